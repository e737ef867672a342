//! capscan command line
//!
//! Drives the discovery engine against a JSON host fixture: `resolve` prints
//! the ranked candidate set for a preset query, `invoke` runs the full quote
//! dispatch pipeline.

use anyhow::{bail, Context, Result};
use capscan::attachment::{file_queue_query, quote_file_name, RenderedImage};
use capscan::delivery::send_message_query;
use capscan::fixture::HostFixture;
use capscan::{CapabilityQuery, CapscanConfig, QuoteDispatcher, Resolver};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(name = "capscan", author, version)]
#[clap(about = "Capability discovery and speculative invocation against a host fixture")]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// TOML configuration file
    #[clap(short, long, global = true, env = "CAPSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[clap(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    FileQueue,
    SendMessage,
}

impl Preset {
    fn query(self) -> CapabilityQuery {
        match self {
            Preset::FileQueue => file_queue_query(),
            Preset::SendMessage => send_message_query(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the ranked candidates for a preset query
    Resolve {
        /// Host fixture (JSON)
        #[clap(short, long)]
        fixture: PathBuf,

        #[clap(short, long, value_enum, default_value = "file-queue")]
        query: Preset,
    },
    /// Queue a rendered image and send it to a destination
    Invoke {
        /// Host fixture (JSON)
        #[clap(short, long)]
        fixture: PathBuf,

        /// Destination (channel) id
        #[clap(short, long)]
        destination: String,

        /// Rendered image as a data URL
        #[clap(long, conflicts_with = "image")]
        data_url: Option<String>,

        /// Rendered image file (PNG)
        #[clap(long)]
        image: Option<PathBuf>,

        /// Attachment file name; derived from --content and --username if omitted
        #[clap(long)]
        file_name: Option<String>,

        /// Quoted text used to derive the file name
        #[clap(long, default_value = "")]
        content: String,

        /// Author used to derive the file name
        #[clap(long, default_value = "")]
        username: String,

        /// Return without waiting for the staged file to be removed
        #[clap(long)]
        no_wait_cleanup: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<CapscanConfig> {
    let mut config = match path {
        Some(path) => CapscanConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CapscanConfig::default(),
    };
    config.apply_env().context("applying CAPSCAN_* environment")?;
    Ok(config)
}

fn load_fixture(path: &Path) -> Result<capscan::fixture::LoadedFixture> {
    let fixture = HostFixture::from_file(path)
        .with_context(|| format!("reading fixture {}", path.display()))?;
    Ok(fixture.load()?)
}

async fn resolve(config: &CapscanConfig, fixture: &Path, preset: Preset) -> Result<()> {
    let loaded = load_fixture(fixture)?;
    let resolver = Resolver::new(loaded.registry.clone(), config);
    let query = preset.query();
    let set = resolver.resolve(&query, true)?;
    let candidates: Vec<_> = set.iter().map(|c| c.summary()).collect();
    let output = json!({
        "query": query.id().as_str(),
        "candidates": candidates,
        "diagnostics": set.diagnostics,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn invoke(
    config: CapscanConfig,
    fixture: &Path,
    destination: &str,
    data_url: Option<String>,
    image: Option<PathBuf>,
    file_name: Option<String>,
    content: &str,
    username: &str,
    wait_cleanup: bool,
) -> Result<()> {
    let image = match (data_url, image) {
        (Some(url), _) => RenderedImage::from_data_url(&url)?,
        (None, Some(path)) => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading image {}", path.display()))?;
            RenderedImage::new(bytes, capscan::attachment::DEFAULT_MIME)
        }
        (None, None) => bail!("one of --data-url or --image is required"),
    };
    let file_name = file_name.unwrap_or_else(|| quote_file_name(content, username));

    let loaded = load_fixture(fixture)?;
    let dispatcher = QuoteDispatcher::new(loaded.registry.clone(), config);
    let result = dispatcher.dispatch_image(destination, &image, &file_name).await;
    if wait_cleanup {
        dispatcher.drain_cleanups().await;
    }

    match result {
        Ok(receipt) => {
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e.user_message());
            Err(e).context("dispatch failed")
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("capscan={}", default_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = load_config(args.config.as_deref())?;

    // host futures are not Send; abandoned calls run as local tasks
    let local = tokio::task::LocalSet::new();
    local.run_until(run(args.command, config)).await
}

async fn run(command: Command, config: CapscanConfig) -> Result<()> {
    match command {
        Command::Resolve { fixture, query } => resolve(&config, &fixture, query).await,
        Command::Invoke {
            fixture,
            destination,
            data_url,
            image,
            file_name,
            content,
            username,
            no_wait_cleanup,
        } => {
            invoke(
                config,
                &fixture,
                &destination,
                data_url,
                image,
                file_name,
                &content,
                &username,
                !no_wait_cleanup,
            )
            .await
        }
    }
}
