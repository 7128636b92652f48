pub mod config;
pub mod queue;
pub mod scheduler;
pub mod temp_id;

mod manager;

pub use config::{OfflineConfig, ServerRejectionPolicy};
pub use manager::{
    overlay_pending, SkipReason, SyncEngine, SyncError, SyncReport, SyncState, SyncStatus,
};
pub use queue::{Mutation, MutationQueue, QueueEntry, QueueKey, RejectedEntry};
pub use scheduler::{start_sync_scheduler, SyncScheduler, SyncSchedulerMessage};
