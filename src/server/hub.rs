//! Relay session table and fan-out.
//!
//! Sessions and broadcast groups are concurrent maps, and membership sets
//! are concurrent sets. Membership is added while holding the session's
//! map entry and empty sessions are removed with `remove_if`, so a join
//! racing the last leave either lands in the surviving session or creates
//! a fresh one. Two first joiners never create two sessions.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::session::{ConnectionId, ProjectSession};
use crate::protocol::codec::{self, Frame};
use crate::protocol::{ActiveProject, ChangeNotification, RelayEvent, RelayRequest};

/// Broadcast group name for a project
pub fn group_name(project_id: &str) -> String {
    format!("project_{project_id}")
}

#[derive(Default)]
pub struct RelayHub {
    sessions: DashMap<String, Arc<ProjectSession>>,
    groups: DashMap<String, DashSet<ConnectionId>>,
    clients: DashMap<ConnectionId, mpsc::Sender<RelayEvent>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&self, connection: ConnectionId, outbound: mpsc::Sender<RelayEvent>) {
        self.clients.insert(connection, outbound);
        tracing::info!(%connection, "client connected");
    }

    /// Remove the connection from every session it belonged to
    pub fn on_disconnected(&self, connection: ConnectionId) {
        self.clients.remove(&connection);

        let joined: Vec<String> = self
            .sessions
            .iter()
            .filter(|session| session.contains(&connection))
            .map(|session| session.key().clone())
            .collect();

        for project_id in &joined {
            self.remove_member(connection, project_id);
        }
        tracing::info!(%connection, sessions = joined.len(), "client disconnected");
    }

    pub fn join_project(&self, connection: ConnectionId, project_id: &str) {
        let session = {
            let entry = self
                .sessions
                .entry(project_id.to_string())
                .or_insert_with(|| {
                    tracing::info!(project_id, "session created");
                    Arc::new(ProjectSession::new(project_id))
                });
            entry.members.insert(connection);
            Arc::clone(&entry)
        };
        self.groups
            .entry(group_name(project_id))
            .or_default()
            .insert(connection);

        let count = session.member_count();
        tracing::info!(%connection, project_id, members = count, "joined project");

        self.push(
            connection,
            RelayEvent::SessionJoined {
                project_id: project_id.to_string(),
            },
        );
        self.broadcast(
            project_id,
            &RelayEvent::SessionMemberCountChanged {
                project_id: project_id.to_string(),
                count,
            },
            None,
        );
    }

    pub fn leave_project(&self, connection: ConnectionId, project_id: &str) {
        match self.remove_member(connection, project_id) {
            Some(remaining) => {
                tracing::info!(%connection, project_id, remaining, "left project");
            }
            None => {
                tracing::debug!(%connection, project_id, "leave for a project the connection is not in");
            }
        }
        self.push(
            connection,
            RelayEvent::SessionLeft {
                project_id: project_id.to_string(),
            },
        );
    }

    /// Returns the remaining member count, or `None` when `connection` was not a member
    fn remove_member(&self, connection: ConnectionId, project_id: &str) -> Option<usize> {
        let session = self.sessions.get(project_id).map(|entry| Arc::clone(&entry))?;
        session.members.remove(&connection)?;

        let group = group_name(project_id);
        if let Some(members) = self.groups.get(&group) {
            members.remove(&connection);
        }
        self.groups.remove_if(&group, |_, members| members.is_empty());

        if self
            .sessions
            .remove_if(project_id, |_, session| session.members.is_empty())
            .is_some()
        {
            tracing::info!(project_id, "session removed");
            return Some(0);
        }

        let count = session.member_count();
        self.broadcast(
            project_id,
            &RelayEvent::SessionMemberCountChanged {
                project_id: project_id.to_string(),
                count,
            },
            None,
        );
        Some(count)
    }

    /// Relay to every other member. Unknown sessions are logged and ignored.
    pub fn send_change(&self, connection: ConnectionId, project_id: &str, mut change: ChangeNotification) -> usize {
        if !self.sessions.contains_key(project_id) {
            tracing::warn!(%connection, project_id, "change for unknown session dropped");
            return 0;
        }

        change.session_id = project_id.to_string();
        let target = change.target();
        let seq = change.sequence_number;
        let delivered = self.broadcast(project_id, &RelayEvent::ReceiveChange { change }, Some(connection));
        tracing::trace!(%connection, project_id, property = %target, ?seq, delivered, "change relayed");
        delivered
    }

    pub fn get_active_projects(&self) -> Vec<ActiveProject> {
        let mut projects: Vec<ActiveProject> = self
            .sessions
            .iter()
            .map(|session| session.snapshot())
            .collect();
        projects.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        projects
    }

    pub fn session(&self, project_id: &str) -> Option<Arc<ProjectSession>> {
        self.sessions.get(project_id).map(|entry| Arc::clone(&entry))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.clients.iter().map(|entry| *entry.key()).collect()
    }

    /// Drop the connection's push queue, which makes its writer close the
    /// socket. Session membership goes when the socket does.
    pub fn close_connection(&self, connection: ConnectionId) -> bool {
        let closed = self.clients.remove(&connection).is_some();
        if closed {
            tracing::info!(%connection, "closing connection");
        }
        closed
    }

    /// Close every connection; returns how many there were
    pub fn close_all(&self) -> usize {
        let connections = self.connections();
        connections
            .into_iter()
            .filter(|connection| self.close_connection(*connection))
            .count()
    }

    pub fn dispatch(&self, connection: ConnectionId, request: RelayRequest) {
        tracing::trace!(%connection, method = request.method(), "request");
        match request {
            RelayRequest::JoinProject { project_id } => {
                if self.check_project_id(connection, &project_id) {
                    self.join_project(connection, &project_id);
                }
            }
            RelayRequest::LeaveProject { project_id } => {
                if self.check_project_id(connection, &project_id) {
                    self.leave_project(connection, &project_id);
                }
            }
            RelayRequest::SendChange { project_id, change } => {
                if self.check_project_id(connection, &project_id) {
                    self.send_change(connection, &project_id, change);
                }
            }
            RelayRequest::GetActiveProjects => {
                let projects = self.get_active_projects();
                self.push(connection, RelayEvent::ActiveProjects { projects });
            }
        }
    }

    /// Decode one inbound frame and dispatch it; undecodable frames get an `Error` push
    pub fn handle_frame(&self, connection: ConnectionId, frame: &Frame) {
        match codec::decode::<RelayRequest>(frame) {
            Ok(request) => self.dispatch(connection, request),
            Err(err) => {
                tracing::warn!(%connection, error = %err, "malformed request");
                self.push(
                    connection,
                    RelayEvent::Error {
                        message: format!("malformed request: {err}"),
                    },
                );
            }
        }
    }

    fn check_project_id(&self, connection: ConnectionId, project_id: &str) -> bool {
        if !project_id.trim().is_empty() {
            return true;
        }
        tracing::warn!(%connection, "request with empty project id");
        self.push(
            connection,
            RelayEvent::Error {
                message: "project id must not be empty".into(),
            },
        );
        false
    }

    fn push(&self, connection: ConnectionId, event: RelayEvent) -> bool {
        let Some(outbound) = self.clients.get(&connection).map(|entry| entry.value().clone()) else {
            return false;
        };
        match outbound.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(%connection, "outbound queue full; dropping push");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn broadcast(&self, project_id: &str, event: &RelayEvent, except: Option<ConnectionId>) -> usize {
        let targets: Vec<ConnectionId> = match self.groups.get(&group_name(project_id)) {
            Some(members) => members
                .iter()
                .map(|member| *member)
                .filter(|member| Some(*member) != except)
                .collect(),
            None => return 0,
        };
        targets
            .into_iter()
            .filter(|member| self.push(*member, event.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connect(hub: &RelayHub) -> (ConnectionId, mpsc::Receiver<RelayEvent>) {
        let connection = ConnectionId::new();
        let (tx, rx) = mpsc::channel(64);
        hub.on_connected(connection, tx);
        (connection, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<RelayEvent>) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn last_count(events: &[RelayEvent]) -> Option<usize> {
        events.iter().rev().find_map(|event| match event {
            RelayEvent::SessionMemberCountChanged { count, .. } => Some(*count),
            _ => None,
        })
    }

    #[test]
    fn closing_a_connection_ends_its_push_queue() {
        let hub = RelayHub::new();
        let (a, mut a_rx) = connect(&hub);
        let (_b, mut b_rx) = connect(&hub);
        hub.join_project(a, "P");
        drain(&mut a_rx);

        assert!(hub.close_connection(a));
        assert!(!hub.close_connection(a));
        assert_eq!(a_rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));
        // Membership stays until the socket actually goes away
        assert!(hub.session("P").unwrap().contains(&a));
        hub.on_disconnected(a);
        assert_eq!(hub.session_count(), 0);

        assert_eq!(hub.close_all(), 1);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(b_rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));
    }

    #[test]
    fn membership_lifecycle() {
        let hub = RelayHub::new();
        let (a, mut a_rx) = connect(&hub);
        let (b, mut b_rx) = connect(&hub);

        hub.join_project(a, "P");
        let events = drain(&mut a_rx);
        assert_eq!(events[0], RelayEvent::SessionJoined { project_id: "P".into() });
        assert_eq!(last_count(&events), Some(1));

        hub.join_project(b, "P");
        assert_eq!(last_count(&drain(&mut a_rx)), Some(2));
        assert_eq!(hub.session("P").unwrap().member_count(), 2);

        hub.leave_project(a, "P");
        assert_eq!(drain(&mut a_rx), vec![RelayEvent::SessionLeft { project_id: "P".into() }]);
        assert_eq!(last_count(&drain(&mut b_rx)), Some(1));
        assert_eq!(hub.get_active_projects()[0].member_count, 1);

        hub.leave_project(b, "P");
        assert!(hub.get_active_projects().is_empty());
        assert_eq!(hub.session_count(), 0);
    }

    #[test]
    fn changes_reach_everyone_but_the_sender() {
        let hub = RelayHub::new();
        let (a, mut a_rx) = connect(&hub);
        let (b, mut b_rx) = connect(&hub);
        let (c, mut c_rx) = connect(&hub);
        let (outsider, mut outsider_rx) = connect(&hub);
        for member in [a, b, c] {
            hub.join_project(member, "P");
        }
        hub.join_project(outsider, "Q");
        for rx in [&mut a_rx, &mut b_rx, &mut c_rx, &mut outsider_rx] {
            drain(rx);
        }

        let change = ChangeNotification::new("x1", "Name", json!("Hello")).with_sequence(1);
        assert_eq!(hub.send_change(a, "P", change), 2);

        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut outsider_rx).is_empty());
        for rx in [&mut b_rx, &mut c_rx] {
            match drain(rx).as_slice() {
                [RelayEvent::ReceiveChange { change }] => {
                    assert_eq!(change.session_id, "P");
                    assert_eq!(change.new_value, json!("Hello"));
                }
                other => panic!("unexpected events: {other:?}"),
            }
        }
    }

    #[test]
    fn change_for_unknown_session_is_dropped() {
        let hub = RelayHub::new();
        let (a, _a_rx) = connect(&hub);
        let change = ChangeNotification::new("x1", "Name", json!("Hello"));
        assert_eq!(hub.send_change(a, "missing", change), 0);
        assert_eq!(hub.session_count(), 0);
    }

    #[test]
    fn disconnect_cleans_up_every_session() {
        let hub = RelayHub::new();
        let (alice, _alice_rx) = connect(&hub);
        let (bob, mut bob_rx) = connect(&hub);
        hub.join_project(alice, "S");
        hub.join_project(bob, "S");
        hub.join_project(alice, "T");
        drain(&mut bob_rx);

        hub.on_disconnected(alice);
        assert_eq!(last_count(&drain(&mut bob_rx)), Some(1));
        assert_eq!(hub.session("S").unwrap().members(), vec![bob]);
        assert!(hub.session("T").is_none());

        hub.on_disconnected(bob);
        assert!(hub.get_active_projects().is_empty());
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn malformed_frames_and_empty_ids_report_errors() {
        let hub = RelayHub::new();
        let (a, mut a_rx) = connect(&hub);

        hub.handle_frame(a, &Frame::Text("{\"method\":\"Nope\"}".into()));
        hub.dispatch(a, RelayRequest::JoinProject { project_id: " ".into() });

        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, RelayEvent::Error { .. })));
        assert_eq!(hub.session_count(), 0);
    }

    #[test]
    fn active_projects_reply_goes_to_the_caller() {
        let hub = RelayHub::new();
        let (a, mut a_rx) = connect(&hub);
        hub.join_project(a, "B");
        hub.join_project(a, "A");
        drain(&mut a_rx);

        hub.dispatch(a, RelayRequest::GetActiveProjects);
        match drain(&mut a_rx).as_slice() {
            [RelayEvent::ActiveProjects { projects }] => {
                let ids: Vec<&str> = projects.iter().map(|p| p.project_id.as_str()).collect();
                assert_eq!(ids, vec!["A", "B"]);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn concurrent_first_joins_share_one_session() {
        let hub = Arc::new(RelayHub::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let hub = hub.clone();
                std::thread::spawn(move || {
                    let (connection, _rx) = connect(&hub);
                    hub.join_project(connection, "P");
                    connection
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(hub.session_count(), 1);
        assert_eq!(hub.session("P").unwrap().member_count(), 16);
    }
}
