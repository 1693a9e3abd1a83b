//! Keeps a whole object graph synchronized.
//!
//! The orchestrator only controls WHICH objects are bound: it enables sync
//! for a root and everything reachable through its children, then follows
//! structural changes so new subtrees are enabled and removed ones released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

use super::binding;
use super::manager::SyncManager;
use crate::error::{SyncError, SyncResult};
use crate::object::{ChildrenChanged, Subscription, SyncObject};
use crate::protocol::ObjectId;

struct Tracked {
    object: Arc<dyn SyncObject>,
    _children: Option<Subscription>,
}

struct Inner {
    manager: Arc<SyncManager>,
    tracked: Mutex<HashMap<ObjectId, Tracked>>,
    root: RwLock<Option<Arc<dyn SyncObject>>>,
    source_id: RwLock<Option<String>>,
    /// Runtime that structural-change handlers enter, since they may fire on any thread
    runtime: RwLock<Option<Handle>>,
    disposed: AtomicBool,
}

pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(manager: Arc<SyncManager>) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                tracked: Mutex::new(HashMap::new()),
                root: RwLock::new(None),
                source_id: RwLock::new(None),
                runtime: RwLock::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn manager(&self) -> &Arc<SyncManager> {
        &self.inner.manager
    }

    pub fn current_root(&self) -> Option<Arc<dyn SyncObject>> {
        self.inner.root.read().clone()
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.tracked.lock().len()
    }

    pub fn is_object_synchronized(&self, object_id: &ObjectId) -> bool {
        self.inner.tracked.lock().contains_key(object_id)
    }

    /// Enable sync for `root` and its whole subtree, then follow structural changes.
    ///
    /// Switching to a different root releases the previous graph first.
    pub async fn sync_project(&self, root: Arc<dyn SyncObject>, source_id: Option<&str>) -> SyncResult<()> {
        let inner = &self.inner;
        inner.ensure_live()?;

        let current = inner.root.read().clone();
        if let Some(current) = current {
            if Arc::ptr_eq(&current, &root) {
                tracing::debug!(root = %root.id(), "project already synchronized");
                return Ok(());
            }
            self.stop_sync();
        }

        tracing::info!(root = %root.id(), type_name = root.type_name(), "starting project synchronization");
        *inner.runtime.write() = Some(Handle::try_current().map_err(|_| SyncError::NoRuntime)?);
        *inner.source_id.write() = source_id.map(str::to_string);
        *inner.root.write() = Some(Arc::clone(&root));

        if let Err(err) = inner.track_subtree(root) {
            tracing::error!(error = %err, "project synchronization failed");
            self.stop_sync();
            return Err(err);
        }

        tracing::info!(tracked = self.tracked_count(), "project synchronization started");
        Ok(())
    }

    /// Release every tracked object and forget the root.
    pub fn stop_sync(&self) {
        let inner = &self.inner;
        let root = inner.root.write().take();
        let released: Vec<Tracked> = inner.tracked.lock().drain().map(|(_, tracked)| tracked).collect();
        if root.is_none() && released.is_empty() {
            return;
        }

        let count = released.len();
        for tracked in released {
            binding::disable_sync(tracked.object.as_ref());
        }
        tracing::info!(root = ?root.map(|r| r.id().clone()), released = count, "project synchronization stopped");
    }

    /// Track one more object (and its subtree) outside the root graph
    pub fn enable_sync_for_object(&self, object: Arc<dyn SyncObject>) -> SyncResult<()> {
        let inner = &self.inner;
        inner.ensure_live()?;
        if inner.runtime.read().is_none() {
            *inner.runtime.write() = Some(Handle::try_current().map_err(|_| SyncError::NoRuntime)?);
        }
        inner.track_subtree(object).map(|_| ())
    }

    /// Release one object only; its children stay tracked
    pub fn disable_sync_for_object(&self, object_id: &ObjectId) -> bool {
        let removed = self.inner.tracked.lock().remove(object_id);
        match removed {
            Some(tracked) => {
                binding::disable_sync(tracked.object.as_ref());
                tracing::trace!(%object_id, "object released");
                true
            }
            None => false,
        }
    }

    /// Release everything; further calls fail with [`SyncError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_sync();
        tracing::debug!("sync orchestrator disposed");
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn ensure_live(&self) -> SyncResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(SyncError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Depth-first walk from `start`, enabling every node not yet tracked.
    /// Returns every node visited.
    fn track_subtree(self: &Arc<Self>, start: Arc<dyn SyncObject>) -> SyncResult<HashSet<ObjectId>> {
        let source = self.source_id.read().clone();
        let mut visited = HashSet::new();
        let mut stack = vec![start];

        while let Some(node) = stack.pop() {
            if !visited.insert(node.id().clone()) {
                continue;
            }
            let children = node.children();

            if !self.tracked.lock().contains_key(node.id()) {
                binding::enable_sync(&node, &self.manager, source.as_deref())?;
                let subscription = self.watch_children(&node);
                self.tracked.lock().insert(
                    node.id().clone(),
                    Tracked {
                        object: Arc::clone(&node),
                        _children: subscription,
                    },
                );
                tracing::trace!(object_id = %node.id(), type_name = node.type_name(), "object tracked");
            }

            // Reversed so the first child is visited first
            stack.extend(children.into_iter().rev());
        }
        Ok(visited)
    }

    fn untrack_subtree(&self, start: Arc<dyn SyncObject>) {
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            let removed = self.tracked.lock().remove(node.id());
            if let Some(tracked) = removed {
                binding::disable_sync(tracked.object.as_ref());
                tracing::trace!(object_id = %node.id(), "object untracked");
                stack.extend(node.children());
            }
        }
    }

    fn watch_children(self: &Arc<Self>, node: &Arc<dyn SyncObject>) -> Option<Subscription> {
        let events = node.children_changed()?;
        let weak = Arc::downgrade(self);
        let parent = node.id().clone();
        Some(events.subscribe(move |change: &ChildrenChanged| {
            if let Some(inner) = weak.upgrade() {
                inner.on_children_changed(&parent, change);
            }
        }))
    }

    fn on_children_changed(self: &Arc<Self>, parent: &ObjectId, change: &ChildrenChanged) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let runtime = self.runtime.read().clone();
        let _enter = runtime.as_ref().map(Handle::enter);

        match change {
            ChildrenChanged::Added(items) => {
                for item in items {
                    if let Err(err) = self.track_subtree(Arc::clone(item)) {
                        tracing::warn!(%parent, child = %item.id(), error = %err, "failed to sync added child");
                    }
                }
            }
            ChildrenChanged::Removed(items) => {
                for item in items {
                    self.untrack_subtree(Arc::clone(item));
                }
            }
            ChildrenChanged::Reset => self.resync(),
        }
        tracing::debug!(%parent, ?change, tracked = self.tracked.lock().len(), "children changed");
    }

    /// Enable whatever is newly reachable from the root and release the rest
    fn resync(self: &Arc<Self>) {
        let Some(root) = self.root.read().clone() else {
            return;
        };
        let reachable = match self.track_subtree(root) {
            Ok(reachable) => reachable,
            Err(err) => {
                tracing::warn!(error = %err, "resync after reset failed");
                return;
            }
        };

        let stale: Vec<Tracked> = {
            let mut tracked = self.tracked.lock();
            let ids: Vec<ObjectId> = tracked
                .keys()
                .filter(|id| !reachable.contains(*id))
                .cloned()
                .collect();
            ids.iter().filter_map(|id| tracked.remove(id)).collect()
        };
        for tracked in stale {
            binding::disable_sync(tracked.object.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{EngineObject, ValueKind};
    use crate::transport::{LoopbackHub, LoopbackTransport};

    fn node(id: &str) -> Arc<EngineObject> {
        EngineObject::builder(id, "demo.Node")
            .property("Name", ValueKind::Text)
            .build()
    }

    fn orchestrator() -> SyncOrchestrator {
        let hub = Arc::new(LoopbackHub::new());
        let manager = Arc::new(SyncManager::new(Arc::new(LoopbackTransport::with_hub(hub))));
        SyncOrchestrator::new(manager)
    }

    /// project -> scene -> (e1, e2)
    fn project() -> (Arc<EngineObject>, Arc<EngineObject>) {
        let scene = EngineObject::builder("scene", "demo.Scene")
            .property("Name", ValueKind::Text)
            .child(node("e1"))
            .child(node("e2"))
            .build();
        let project = EngineObject::builder("project", "demo.Project")
            .property("Name", ValueKind::Text)
            .child(scene.clone())
            .build();
        (project, scene)
    }

    #[tokio::test]
    async fn syncs_the_whole_graph() {
        let orchestrator = orchestrator();
        let (project, _) = project();

        orchestrator.sync_project(project.clone(), Some("Alice")).await.unwrap();
        assert_eq!(orchestrator.tracked_count(), 4);
        assert_eq!(orchestrator.manager().registered_count(), 4);
        assert!(orchestrator.is_object_synchronized(&ObjectId::from("e2")));
        assert!(binding::is_sync_enabled(&*project));

        // Same root again is a no-op
        orchestrator.sync_project(project.clone(), None).await.unwrap();
        assert_eq!(orchestrator.tracked_count(), 4);
    }

    #[tokio::test]
    async fn follows_added_and_removed_children() {
        let orchestrator = orchestrator();
        let (project, scene) = project();
        orchestrator.sync_project(project, None).await.unwrap();

        let group = EngineObject::builder("group", "demo.Group")
            .property("Name", ValueKind::Text)
            .child(node("g1"))
            .build();
        scene.add_child(group.clone());
        assert_eq!(orchestrator.tracked_count(), 6);
        assert!(binding::is_sync_enabled(&*group));

        scene.remove_child(&ObjectId::from("group"));
        assert_eq!(orchestrator.tracked_count(), 4);
        assert!(!binding::is_sync_enabled(&*group));
        assert!(!orchestrator.is_object_synchronized(&ObjectId::from("g1")));
    }

    #[tokio::test]
    async fn reset_resynchronizes_the_graph() {
        let orchestrator = orchestrator();
        let (project, scene) = project();
        orchestrator.sync_project(project, None).await.unwrap();

        let replacement = node("e3");
        scene.reset_children(vec![replacement.clone()]);

        assert_eq!(orchestrator.tracked_count(), 3);
        assert!(orchestrator.is_object_synchronized(&ObjectId::from("e3")));
        assert!(!orchestrator.is_object_synchronized(&ObjectId::from("e1")));
    }

    #[tokio::test]
    async fn switching_roots_and_disposing_release_everything() {
        let orchestrator = orchestrator();
        let (first, _) = project();
        orchestrator.sync_project(first.clone(), None).await.unwrap();

        let second = node("other");
        orchestrator.sync_project(second.clone(), None).await.unwrap();
        assert_eq!(orchestrator.tracked_count(), 1);
        assert!(!binding::is_sync_enabled(&*first));

        orchestrator.dispose();
        assert_eq!(orchestrator.tracked_count(), 0);
        assert!(!binding::is_sync_enabled(&*second));
        assert!(matches!(
            orchestrator.sync_project(second, None).await,
            Err(SyncError::Disposed)
        ));
    }

    #[tokio::test]
    async fn single_objects_can_be_managed_directly() {
        let orchestrator = orchestrator();
        let loose = node("loose");

        orchestrator.enable_sync_for_object(loose.clone()).unwrap();
        assert!(orchestrator.is_object_synchronized(loose.id()));
        assert!(orchestrator.disable_sync_for_object(loose.id()));
        assert!(!orchestrator.disable_sync_for_object(loose.id()));
        assert!(!binding::is_sync_enabled(&*loose));
    }
}
