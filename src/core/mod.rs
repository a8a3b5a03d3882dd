//! Batch orchestration over the device-control API.

pub mod directory;
pub mod mirroring;
pub mod packages;
pub mod record;
pub mod shell;
pub mod store;

pub use directory::{Directory, DirectoryError};
pub use mirroring::{MirrorOrchestrator, StopOutcome, normalize_address};
pub use packages::PackageOrchestrator;
pub use record::{
    BatchSummary, MirrorRecord, MirrorStatus, OperationRecord, RecordStatus, TaskRecord,
    TaskStatus,
};
pub use shell::ShellOrchestrator;
pub use store::RecordStore;

/// Rejected before any remote call was made.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Validation(String),
}
