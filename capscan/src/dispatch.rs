//! End-to-end quote dispatch
//!
//! validate -> stage -> queue attachment (confirmed) -> pause -> send
//! (confirmed) -> cleanup. Both host calls go through the fallback
//! orchestrator, so neither the upload nor the send entry point has to be
//! known ahead of time.

use crate::attachment::{
    file_queue_query, resolve_destination, resolve_type_tag, upload_probe, RenderedImage, StagedFile,
    UploadStore,
};
use crate::config::CapscanConfig;
use crate::delivery::{new_nonce, nonce_probe, send_args, send_message_query, MessageStore};
use crate::error::CapabilityError;
use crate::orchestrator::{FallbackOrchestrator, InvocationSuccess};
use crate::probe::ConfirmationProbe;
use crate::query::{CapabilityQuery, DomainArgs};
use crate::registry::ModuleRegistry;
use crate::resolver::Resolver;
use serde::Serialize;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// What a successful dispatch did.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReceipt {
    pub destination: String,
    pub file_name: String,
    pub staged_path: PathBuf,
    pub queued_with: String,
    pub queue_shape: String,
    /// False when no upload store was found to confirm against.
    pub queue_confirmed: bool,
    pub sent_with: String,
    pub send_shape: String,
    pub nonce: String,
    pub send_confirmed: bool,
}

/// Runs the quote pipeline. Dispatch must be driven inside a
/// [`tokio::task::LocalSet`] so abandoned host calls can finish on their own.
pub struct QuoteDispatcher {
    orchestrator: FallbackOrchestrator,
    file_queue: CapabilityQuery,
    send_message: CapabilityQuery,
    config: CapscanConfig,
    cleanups: RefCell<Vec<JoinHandle<()>>>,
}

impl QuoteDispatcher {
    pub fn new(registry: Rc<dyn ModuleRegistry>, config: CapscanConfig) -> Self {
        let resolver = Rc::new(Resolver::new(registry, &config));
        let orchestrator = FallbackOrchestrator::new(resolver, &config);
        Self {
            orchestrator,
            file_queue: file_queue_query(),
            send_message: send_message_query(),
            config,
            cleanups: RefCell::new(Vec::new()),
        }
    }

    pub fn orchestrator(&self) -> &FallbackOrchestrator {
        &self.orchestrator
    }

    pub fn file_queue_query(&self) -> &CapabilityQuery {
        &self.file_queue
    }

    fn registry(&self) -> &dyn ModuleRegistry {
        self.orchestrator.resolver().registry().as_ref()
    }

    /// Dispatch a rendered `data:` URL to `destination_id` as `file_name`.
    pub async fn dispatch(
        &self,
        destination_id: &str,
        data_url: &str,
        file_name: &str,
    ) -> Result<DispatchReceipt, CapabilityError> {
        let image = RenderedImage::from_data_url(data_url)?;
        self.dispatch_image(destination_id, &image, file_name).await
    }

    pub async fn dispatch_image(
        &self,
        destination_id: &str,
        image: &RenderedImage,
        file_name: &str,
    ) -> Result<DispatchReceipt, CapabilityError> {
        if destination_id.trim().is_empty() {
            return Err(CapabilityError::InvalidInput(
                "Unable to resolve the destination.".to_string(),
            ));
        }
        if file_name.trim().is_empty() {
            return Err(CapabilityError::InvalidInput("Missing file name.".to_string()));
        }

        let staged = StagedFile::stage(&self.config.dispatch.cache_dir, image).await?;
        let result = self
            .queue_and_send(destination_id, &staged, file_name, &image.mime)
            .await;

        // the host may still be reading the file, so removal is deferred either way
        let delay = Duration::from_millis(self.config.dispatch.cleanup_delay_ms);
        let mut cleanups = self.cleanups.borrow_mut();
        cleanups.retain(|handle| !handle.is_finished());
        cleanups.push(staged.schedule_cleanup(delay));
        drop(cleanups);

        match &result {
            Ok(receipt) => info!(
                destination = destination_id,
                file = file_name,
                queued_with = %receipt.queued_with,
                sent_with = %receipt.sent_with,
                "quote dispatched"
            ),
            Err(e) => warn!(destination = destination_id, file = file_name, error = %e, "quote dispatch failed"),
        }
        result
    }

    async fn queue_and_send(
        &self,
        destination_id: &str,
        staged: &StagedFile,
        file_name: &str,
        mime: &str,
    ) -> Result<DispatchReceipt, CapabilityError> {
        let type_tag = resolve_type_tag(self.registry());
        let destination = resolve_destination(self.registry(), destination_id);

        let upload_args = DomainArgs::new(
            staged.uploadable(file_name, mime),
            destination.clone(),
            type_tag,
        );
        let upload_probe = UploadStore::find(self.registry(), type_tag).map(|store| {
            upload_probe(
                store,
                destination.clone(),
                file_name,
                &staged.staged_name,
                self.config.upload_poll.policy(),
            )
        });
        let queued = self
            .orchestrator
            .resolve_and_invoke(
                &self.file_queue,
                &upload_args,
                upload_probe.as_ref().map(|p| p as &dyn ConfirmationProbe),
            )
            .await?;

        let pause = if upload_probe.is_some() {
            self.config.dispatch.send_delay_ms
        } else {
            self.config.dispatch.unconfirmed_send_delay_ms
        };
        tokio::time::sleep(Duration::from_millis(pause)).await;

        let nonce = new_nonce();
        let message_args = send_args(destination.clone(), &nonce);
        let message_probe = MessageStore::find(self.registry()).map(|store| {
            nonce_probe(store, destination, &nonce, self.config.message_poll.policy())
        });
        let sent = self
            .orchestrator
            .resolve_and_invoke(
                &self.send_message,
                &message_args,
                message_probe.as_ref().map(|p| p as &dyn ConfirmationProbe),
            )
            .await?;

        Ok(receipt(
            destination_id,
            file_name,
            staged,
            &queued,
            upload_probe.is_some(),
            &sent,
            nonce,
            message_probe.is_some(),
        ))
    }

    /// Cleanup handles still held. Finished ones are dropped on the next
    /// dispatch.
    pub fn tracked_cleanups(&self) -> usize {
        self.cleanups.borrow().len()
    }

    /// Wait for every scheduled cleanup to run.
    pub async fn drain_cleanups(&self) {
        let handles: Vec<JoinHandle<()>> = self.cleanups.borrow_mut().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "staged file cleanup task failed");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn receipt(
    destination: &str,
    file_name: &str,
    staged: &StagedFile,
    queued: &InvocationSuccess,
    queue_confirmed: bool,
    sent: &InvocationSuccess,
    nonce: String,
    send_confirmed: bool,
) -> DispatchReceipt {
    DispatchReceipt {
        destination: destination.to_string(),
        file_name: file_name.to_string(),
        staged_path: staged.path.clone(),
        queued_with: queued.candidate.to_string(),
        queue_shape: queued.shape.clone(),
        queue_confirmed,
        sent_with: sent.candidate.to_string(),
        send_shape: sent.shape.clone(),
        nonce,
        send_confirmed,
    }
}
