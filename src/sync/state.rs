//! Per-object synchronization state and the weak side table holding it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::manager::SyncManager;
use crate::object::{Subscription, SyncObject};
use crate::protocol::ObjectId;

static REGISTRY: Lazy<SyncStateRegistry> = Lazy::new(SyncStateRegistry::new);

/// Live affiliation of an object with a manager
#[derive(Default)]
pub(crate) struct Binding {
    pub(crate) manager: Option<Arc<SyncManager>>,
    pub(crate) property_subscription: Option<Subscription>,
    pub(crate) remote_task: Option<JoinHandle<()>>,
}

impl Binding {
    /// Drop both subscriptions and hand back the manager, if any
    pub(crate) fn release(&mut self) -> Option<Arc<SyncManager>> {
        self.property_subscription.take();
        if let Some(task) = self.remote_task.take() {
            task.abort();
        }
        self.manager.take()
    }
}

pub struct SyncState {
    pub(crate) binding: Mutex<Binding>,
    local_sequence: AtomicU64,
    /// 0 until the first sequenced remote change is applied
    last_remote_sequence: AtomicU64,
    receiving_remote: AtomicBool,
}

impl SyncState {
    fn new() -> Self {
        Self {
            binding: Mutex::new(Binding::default()),
            local_sequence: AtomicU64::new(0),
            last_remote_sequence: AtomicU64::new(0),
            receiving_remote: AtomicBool::new(false),
        }
    }

    pub fn local_sequence(&self) -> u64 {
        self.local_sequence.load(Ordering::Acquire)
    }

    pub(crate) fn next_local_sequence(&self) -> u64 {
        self.local_sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn last_remote_sequence(&self) -> Option<u64> {
        match self.last_remote_sequence.load(Ordering::Acquire) {
            0 => None,
            seq => Some(seq),
        }
    }

    pub(crate) fn record_remote_sequence(&self, seq: u64) {
        self.last_remote_sequence.fetch_max(seq, Ordering::AcqRel);
    }

    pub fn is_receiving_remote_change(&self) -> bool {
        self.receiving_remote.load(Ordering::Acquire)
    }

    /// Raise the reentrancy guard; `None` if it is already raised.
    pub(crate) fn begin_remote_change(&self) -> Option<ReceivingGuard<'_>> {
        self.receiving_remote
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReceivingGuard { state: self })
    }

    pub fn is_enabled(&self) -> bool {
        self.binding.lock().manager.is_some()
    }

    pub fn manager(&self) -> Option<Arc<SyncManager>> {
        self.binding.lock().manager.clone()
    }
}

/// Lowers the reentrancy guard when dropped, including on unwind
pub(crate) struct ReceivingGuard<'a> {
    state: &'a SyncState,
}

impl Drop for ReceivingGuard<'_> {
    fn drop(&mut self) {
        self.state.receiving_remote.store(false, Ordering::Release);
    }
}

struct Entry {
    object_id: ObjectId,
    object: Weak<dyn SyncObject>,
    state: Arc<SyncState>,
}

/// Side table from object identity to [`SyncState`].
///
/// Entries hold only a weak reference, so an object's lifetime is never
/// extended by being synchronized. The weak reference also pins the
/// allocation, so an address key cannot be reused by a new object while
/// its stale entry is still present.
pub struct SyncStateRegistry {
    entries: DashMap<usize, Entry>,
}

fn key_of(object: &dyn SyncObject) -> usize {
    object as *const dyn SyncObject as *const () as usize
}

impl SyncStateRegistry {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn global() -> &'static SyncStateRegistry {
        &REGISTRY
    }

    pub fn get_or_create(&self, object: &Arc<dyn SyncObject>) -> Arc<SyncState> {
        let entry = self.entries.entry(key_of(object.as_ref())).or_insert_with(|| Entry {
            object_id: object.id().clone(),
            object: Arc::downgrade(object),
            state: Arc::new(SyncState::new()),
        });
        Arc::clone(&entry.state)
    }

    pub fn get(&self, object: &dyn SyncObject) -> Option<Arc<SyncState>> {
        self.entries
            .get(&key_of(object))
            .map(|entry| Arc::clone(&entry.state))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries whose objects are gone. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let dead: Vec<usize> = self
            .entries
            .iter()
            .filter(|entry| entry.object.strong_count() == 0)
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for key in dead {
            let Some((_, entry)) = self
                .entries
                .remove_if(&key, |_, entry| entry.object.strong_count() == 0)
            else {
                continue;
            };
            if let Some(manager) = entry.state.binding.lock().release() {
                manager.unregister_object(&entry.object_id);
            }
            tracing::trace!(object_id = %entry.object_id, "purged sync state of dropped object");
            removed += 1;
        }
        removed
    }
}
