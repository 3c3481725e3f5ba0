//! Domain model (IDs, tasks, metadata, events, errors, ...).

pub mod decision;
pub mod entity;
pub mod errors;
pub mod events;
pub mod ids;
pub mod metadata;
pub mod outcome;
pub mod task;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

pub use decision::Decision;
pub use entity::{EntityRef, EntityType};
pub use errors::{
    BuildError, ConfigError, HandlerError, PersistError, QueueError, SinkError, SyncError,
};
pub use events::{AbandonReason, Event, EventKind};
pub use ids::{BackendId, FrontId, TaskId};
pub use metadata::{PersistenceMetadata, SyncStatus};
pub use outcome::{ErrorCode, ErrorInfo};
pub use task::{Operation, PersistenceTask, TaskPayload};
