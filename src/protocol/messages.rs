//! Relay RPC surface.
//!
//! Clients send [`RelayRequest`]s; the relay pushes [`RelayEvent`]s. Both are
//! adjacently tagged so the method name is the bit-exact RPC name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::change::ChangeNotification;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RelayRequest {
    JoinProject {
        project_id: String,
    },
    LeaveProject {
        project_id: String,
    },
    SendChange {
        project_id: String,
        change: ChangeNotification,
    },
    GetActiveProjects,
}

impl RelayRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RelayRequest::JoinProject { .. } => "JoinProject",
            RelayRequest::LeaveProject { .. } => "LeaveProject",
            RelayRequest::SendChange { .. } => "SendChange",
            RelayRequest::GetActiveProjects => "GetActiveProjects",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "params")]
pub enum RelayEvent {
    SessionJoined {
        project_id: String,
    },
    SessionLeft {
        project_id: String,
    },
    SessionMemberCountChanged {
        project_id: String,
        count: usize,
    },
    ReceiveChange {
        change: ChangeNotification,
    },
    ActiveProjects {
        projects: Vec<ActiveProject>,
    },
    /// Handler-level failure; the connection stays open
    Error {
        message: String,
    },
}

/// Snapshot row returned by `GetActiveProjects`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveProject {
    pub project_id: String,
    pub member_count: usize,
    pub created_at: DateTime<Utc>,
}
