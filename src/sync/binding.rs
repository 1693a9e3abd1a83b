//! Attaches a [`SyncObject`] to a [`SyncManager`].
//!
//! Enabling subscribes to the object's property-changed event (local edits
//! become outbound changes) and to the manager's remote stream filtered to
//! the object's id (remote changes are applied back through `set_value`).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;

use super::manager::SyncManager;
use super::state::{SyncState, SyncStateRegistry};
use crate::error::{SyncError, SyncResult};
use crate::object::{decode_value, encode_value, PropertyChanged, SyncObject, ValueKind};
use crate::protocol::{ChangeNotification, LOCAL_CLIENT};

/// What happened to one remote change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Arrived while another remote change was being applied
    Reentrant,
    Stale { sequence: u64, last: u64 },
    UnknownProperty,
    ConversionFailed,
    /// The object refused the value
    Rejected,
}

/// Start synchronizing `object` through `manager`.
///
/// Re-enabling with the same manager is a no-op; with a different manager
/// the previous binding is released first. Must be called within a tokio
/// runtime.
pub fn enable_sync(
    object: &Arc<dyn SyncObject>,
    manager: &Arc<SyncManager>,
    source_id: Option<&str>,
) -> SyncResult<()> {
    let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
    let state = SyncStateRegistry::global().get_or_create(object);
    let mut binding = state.binding.lock();

    if let Some(current) = &binding.manager {
        if Arc::ptr_eq(current, manager) {
            tracing::trace!(object_id = %object.id(), "sync already enabled");
            return Ok(());
        }
        tracing::debug!(object_id = %object.id(), "rebinding object to a different manager");
        if let Some(previous) = binding.release() {
            previous.unregister_object(object.id());
        }
    }

    let source = source_id.unwrap_or(LOCAL_CLIENT).to_string();
    let object_id = object.id().clone();
    // Closes when the handler is dropped, which happens with the object itself
    let (drop_notice, mut dropped) = oneshot::channel::<()>();

    let property_subscription = {
        let state = Arc::downgrade(&state);
        let manager = Arc::clone(manager);
        let object_id = object_id.clone();
        let type_name = object.type_name().to_string();
        let kinds: HashMap<String, ValueKind> = object
            .properties()
            .into_iter()
            .map(|descriptor| (descriptor.name, descriptor.kind))
            .collect();
        object.property_changed().subscribe(move |event: &PropertyChanged| {
            if drop_notice.is_closed() {
                return;
            }
            let Some(state) = state.upgrade() else { return };
            if state.is_receiving_remote_change() {
                tracing::trace!(%object_id, property = %event.property, "suppressing echo of remote change");
                return;
            }

            let kind = kinds
                .get(&event.property)
                .copied()
                .unwrap_or(ValueKind::Structured);
            let mut change = ChangeNotification::new(
                object_id.clone(),
                event.property.clone(),
                encode_value(kind, &event.new_value),
            )
            .with_old_value(encode_value(kind, &event.old_value))
            .with_source(source.as_str())
            .with_sequence(state.next_local_sequence())
            .with_type_name(type_name.as_str());
            if let Some(session_id) = manager.session_id() {
                change = change.with_session_id(session_id);
            }

            let seq = change.sequence_number;
            match manager.enqueue_change(change) {
                Ok(()) => {
                    tracing::trace!(%object_id, property = %event.property, ?seq, "local change queued");
                }
                Err(SyncError::NotConnected) => {
                    tracing::debug!(%object_id, property = %event.property, "not connected; local change not sent");
                }
                Err(err) => {
                    tracing::warn!(%object_id, property = %event.property, error = %err, "failed to queue local change");
                }
            }
        })
    };

    // Subscribed here, before the task starts, so nothing in between is missed
    let mut remote = manager.remote_changes();
    let remote_task = {
        let object = Arc::downgrade(object);
        let state = Arc::downgrade(&state);
        let object_id = object_id.clone();
        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut dropped => {
                        // Also woken by disable, which drops the handler while the object lives
                        if object.strong_count() == 0 {
                            tracing::debug!(%object_id, "bound object dropped");
                            SyncStateRegistry::global().purge();
                        }
                        break;
                    }
                    received = remote.recv() => match received {
                        Ok(change) => {
                            if change.object_id != object_id {
                                continue;
                            }
                            let (Some(object), Some(state)) = (object.upgrade(), state.upgrade()) else {
                                SyncStateRegistry::global().purge();
                                break;
                            };
                            apply_remote_change(object.as_ref(), &state, &change);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(%object_id, skipped, "remote change stream lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    };

    binding.manager = Some(Arc::clone(manager));
    binding.property_subscription = Some(property_subscription);
    binding.remote_task = Some(remote_task);
    drop(binding);

    manager.register_object(object.as_ref());
    tracing::debug!(%object_id, source = %source_id.unwrap_or(LOCAL_CLIENT), "sync enabled");
    Ok(())
}

/// Stop synchronizing `object`. Sequence counters are kept so a later
/// enable continues counting where this one stopped.
pub fn disable_sync(object: &dyn SyncObject) -> bool {
    let Some(state) = SyncStateRegistry::global().get(object) else {
        return false;
    };
    let released = state.binding.lock().release();
    match released {
        Some(manager) => {
            manager.unregister_object(object.id());
            tracing::debug!(object_id = %object.id(), "sync disabled");
            true
        }
        None => false,
    }
}

pub fn is_sync_enabled(object: &dyn SyncObject) -> bool {
    sync_state(object).is_some_and(|state| state.is_enabled())
}

pub fn sync_manager_of(object: &dyn SyncObject) -> Option<Arc<SyncManager>> {
    sync_state(object).and_then(|state| state.manager())
}

pub fn sync_state(object: &dyn SyncObject) -> Option<Arc<SyncState>> {
    SyncStateRegistry::global().get(object)
}

/// Apply one remote change addressed to `object`.
///
/// Never fails: every rejection is logged and reported as an outcome.
pub fn apply_remote_change(
    object: &dyn SyncObject,
    state: &SyncState,
    change: &ChangeNotification,
) -> ApplyOutcome {
    let object_id = object.id();
    let property = change.property_name.as_str();

    if state.is_receiving_remote_change() {
        tracing::trace!(%object_id, property, "discarding re-entrant remote change");
        return ApplyOutcome::Reentrant;
    }

    if let (Some(sequence), Some(last)) = (change.sequence_number, state.last_remote_sequence()) {
        if sequence <= last {
            tracing::trace!(%object_id, property, seq = sequence, last, "discarding stale remote change");
            return ApplyOutcome::Stale { sequence, last };
        }
    }

    let Some(_guard) = state.begin_remote_change() else {
        return ApplyOutcome::Reentrant;
    };

    let Some(descriptor) = object.property(property) else {
        tracing::warn!(%object_id, property, "remote change for unknown property");
        return ApplyOutcome::UnknownProperty;
    };

    let value = match decode_value(&descriptor.name, descriptor.kind, &change.new_value) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(%object_id, property, error = %err, "could not deserialize remote value");
            return ApplyOutcome::ConversionFailed;
        }
    };

    if let Err(err) = object.set_value(&descriptor.name, value) {
        tracing::warn!(%object_id, property, error = %err, "object rejected remote value");
        return ApplyOutcome::Rejected;
    }

    if let Some(sequence) = change.sequence_number {
        state.record_remote_sequence(sequence);
    }
    tracing::debug!(
        %object_id,
        property,
        seq = ?change.sequence_number,
        source = %change.change_source,
        "applied remote change"
    );
    ApplyOutcome::Applied
}
