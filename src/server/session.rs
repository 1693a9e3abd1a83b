use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ActiveProject;

/// Identity of one websocket connection to the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Relay-side membership of one project
pub struct ProjectSession {
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub(crate) members: DashSet<ConnectionId>,
}

impl ProjectSession {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            created_at: Utc::now(),
            members: DashSet::new(),
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, connection: &ConnectionId) -> bool {
        self.members.contains(connection)
    }

    pub fn members(&self) -> Vec<ConnectionId> {
        self.members.iter().map(|member| *member).collect()
    }

    pub fn snapshot(&self) -> ActiveProject {
        ActiveProject {
            project_id: self.project_id.clone(),
            member_count: self.member_count(),
            created_at: self.created_at,
        }
    }
}
