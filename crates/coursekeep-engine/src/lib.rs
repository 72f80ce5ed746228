pub mod error;
pub mod processor;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod sink;
pub mod upload;

pub use error::EngineError;
pub use processor::{PassReport, ProcessorConfig, SyncProcessor, TriggerOutcome};
pub use registry::{DirectoryRegistry, OpenRegistry, PackageRegistry};
pub use runtime::{SessionRuntime, SessionSnapshot};
pub use scheduler::SyncScheduler;
pub use service::{ActionReceipt, SyncStatus, TrackingService, UploadReceipt};
pub use sink::{HttpSink, LocalSink, SinkAction, SyncSink};
pub use upload::{UploadAction, UploadBatch};
