//! # dx-sync - Real-time engine object synchronization
//!
//! Captures property edits on engine objects, ships them as
//! [`ChangeNotification`]s through a pluggable [`Transport`], and applies
//! remote edits back onto the same objects without echoing them.
//!
//! ## Features
//!
//! - **Per-object sequencing**: stale and duplicate changes are dropped
//! - **Loop-free**: remote application never produces an outbound change
//! - **Transports**: in-process loopback or a websocket relay client
//! - **Relay server**: multi-tenant fan-out with session membership tracking
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dx_sync::{EngineObject, LoopbackHub, SyncBuilder, ValueKind};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let hub = Arc::new(LoopbackHub::new());
//!     let client = SyncBuilder::new().loopback(hub).source_id("Alice").build()?;
//!
//!     let project = EngineObject::builder("project-1", "demo.Project")
//!         .property("Name", ValueKind::Text)
//!         .build();
//!
//!     client.join("session-1").await?;
//!     client.sync_project(project.clone()).await?;
//!     project.set("Name", "Hello")?;
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod object;
pub mod protocol;
pub mod server;
pub mod sync;
pub mod transport;

// Re-export main types for library consumers
pub use config::SyncConfig;
pub use error::{RetryPolicy, SyncError, SyncResult};
pub use object::{EngineObject, SyncObject, ValueKind};
pub use protocol::{ChangeNotification, ObjectId, PropertyValue};
pub use server::{RelayHub, RelayServer};
pub use sync::{SyncBuilder, SyncClient, SyncManager, SyncOrchestrator};
pub use transport::{ConnectionStatus, LoopbackHub, LoopbackTransport, RelayClientTransport, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
