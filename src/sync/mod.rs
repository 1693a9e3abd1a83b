//! Client-side synchronization core.
//!
//! [`SyncManager`] owns a transport and the session lifecycle, the binding
//! attaches individual objects to a manager, and [`SyncOrchestrator`] keeps
//! a whole object graph bound as it changes.

pub mod binding;
pub mod builder;
pub mod manager;
pub mod orchestrator;
pub mod state;

pub use binding::{
    apply_remote_change, disable_sync, enable_sync, is_sync_enabled, sync_manager_of, sync_state,
    ApplyOutcome,
};
pub use builder::{SyncBuilder, SyncClient};
pub use manager::{ManagerState, SyncManager};
pub use orchestrator::SyncOrchestrator;
pub use state::{SyncState, SyncStateRegistry};
