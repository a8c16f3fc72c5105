pub mod coordinator;
pub mod failure;
pub mod notify;
pub mod pipeline;
pub mod providers;
pub mod source;
pub mod storage;

pub use coordinator::{
    AiClientFactory, CoordinatorContext, TaskCoordinator, TaskError, TaskOutcome,
    TransformerFactory,
};
pub use failure::{StorageFailureKind, TransformFailure};
pub use notify::{JournalNotifier, MemoryNotifier, Notification, NotificationKind, Notifier};
pub use pipeline::{
    BatchPipeline, NoopObserver, PageOutcome, PipelineError, PipelineObserver, PipelineOptions,
    RunReport, StageReport,
};
pub use providers::{AiTransformClient, ImageProvider, PageTransformer};
pub use source::{open_source, ArchiveSource, FolderSource, ImageSource};
