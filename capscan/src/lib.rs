// capscan
// Capability discovery and speculative invocation over opaque host object graphs

pub mod attachment;
pub mod candidate;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod fixture;
pub mod host;
pub mod invoker;
pub mod orchestrator;
pub mod probe;
pub mod query;
pub mod registry;
pub mod resolver;
pub mod scanner;
pub mod scoring;
pub mod walker;

pub use candidate::{Candidate, CandidateSet, DiscoveryPath, ResolutionDiagnostics, ScoredEntry};
pub use config::CapscanConfig;
pub use dispatch::{DispatchReceipt, QuoteDispatcher};
pub use error::{AttemptError, CapabilityError};
pub use host::{ArrayRef, Completion, FunctionRef, HostError, HostValue, ObjectRef};
pub use invoker::{CandidateInvoker, InvocationOutcome, InvocationReport, ShapeInvoker};
pub use orchestrator::{FallbackOrchestrator, InvocationSuccess};
pub use probe::{ConfirmationProbe, ConfirmationStore, PollPolicy, StoreProbe};
pub use query::{CallShape, CapabilityQuery, Destination, DomainArgs, KnownShape, PropertyPath, QueryId};
pub use registry::{InMemoryRegistry, ModuleId, ModuleRegistry};
pub use resolver::Resolver;
pub use scoring::Scorer;
