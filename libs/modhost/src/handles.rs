//! Opaque integer handles for managed objects held by native code.
//!
//! Every allocation mints a fresh token from a monotonic counter, so a freed
//! token is never handed out again and stale tokens simply stop resolving.
//!
//! Strong handles to module objects are pinned in a keep-alive registry keyed
//! by module id. Unloading a module drops its whole registry in one step; from
//! then on, strong allocations for that module degrade to weak ones so a late
//! allocation cannot pin the module again.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::loader::{ModuleContext, ModuleId};
use crate::object::{ManagedObject, ObjectRef};
use crate::reclaim::{Finalizer, ReclaimQueue};

/// Non-null handle token. The null handle is `Option::<Handle>::None` (raw `0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(NonZeroU64);

impl Handle {
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn into_raw(self) -> u64 {
        self.0.get()
    }

    /// Raw token for an optional handle; `None` maps to `0`.
    pub fn raw_or_null(handle: Option<Self>) -> u64 {
        handle.map_or(0, Self::into_raw)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Strong,
    Weak,
}

enum Target {
    /// Host-owned object outside any module; the slot itself keeps it alive.
    Held(ObjectRef),
    Observed(Weak<ManagedObject>),
}

struct Slot {
    kind: HandleKind,
    module: Option<ModuleId>,
    target: Target,
}

impl Slot {
    fn upgrade(&self) -> Option<ObjectRef> {
        let object = match &self.target {
            Target::Held(object) => Arc::clone(object),
            Target::Observed(weak) => weak.upgrade()?,
        };
        if object.is_module_unloading() {
            return None;
        }
        Some(object)
    }

    fn target_exists(&self) -> bool {
        match &self.target {
            Target::Held(_) => true,
            Target::Observed(weak) => weak.strong_count() > 0,
        }
    }
}

#[derive(Default)]
struct KeepAlive {
    closed: bool,
    objects: HashMap<Handle, ObjectRef>,
}

type KeepAliveSet = Arc<Mutex<KeepAlive>>;

/// Registry of every live handle.
pub struct HandleTable {
    slots: DashMap<Handle, Slot>,
    keep_alive: DashMap<ModuleId, KeepAliveSet>,
    next: AtomicU64,
    reclaim: ReclaimQueue,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            keep_alive: DashMap::new(),
            next: AtomicU64::new(1),
            reclaim: ReclaimQueue::default(),
        }
    }

    fn mint(&self) -> Handle {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        // Starts at 1; the counter never wraps in practice.
        Handle(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MAX))
    }

    /// Allocates a handle that keeps `object` alive until freed or until its module unloads.
    pub fn alloc_strong(&self, object: &ObjectRef) -> Handle {
        let handle = self.mint();

        let Some(ctx) = object.origin() else {
            self.slots.insert(
                handle,
                Slot {
                    kind: HandleKind::Strong,
                    module: None,
                    target: Target::Held(Arc::clone(object)),
                },
            );
            return handle;
        };

        let module = ctx.id();
        let pinned = self.keep_alive_set(ctx).is_some_and(|set| {
            let mut set = set.lock();
            if set.closed {
                return false;
            }
            set.objects.insert(handle, Arc::clone(object));
            true
        });
        if !pinned {
            tracing::debug!(
                %handle,
                module_id = %module,
                "module is unloading; strong handle degraded to weak"
            );
        }

        self.slots.insert(
            handle,
            Slot {
                kind: HandleKind::Strong,
                module: Some(module),
                target: Target::Observed(Arc::downgrade(object)),
            },
        );
        handle
    }

    /// Allocates a handle that observes `object` without keeping it alive.
    pub fn alloc_weak(&self, object: &ObjectRef) -> Handle {
        let handle = self.mint();
        self.slots.insert(
            handle,
            Slot {
                kind: HandleKind::Weak,
                module: object.module_id(),
                target: Target::Observed(Arc::downgrade(object)),
            },
        );
        handle
    }

    fn keep_alive_set(&self, ctx: &ModuleContext) -> Option<KeepAliveSet> {
        match self.keep_alive.entry(ctx.id()) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                // Checked under the shard lock: release_module removes the entry
                // only after the unloading flag is raised.
                if ctx.is_unloading() {
                    return None;
                }
                Some(Arc::clone(entry.insert(KeepAliveSet::default()).value()))
            }
        }
    }

    /// Dereferences a handle; `None` if it is unknown, freed or its target is gone.
    pub fn resolve(&self, handle: Handle) -> Option<ObjectRef> {
        // The shard guard is released before the object reaches the caller.
        let object = {
            let slot = self.slots.get(&handle)?;
            slot.upgrade()
        };
        object
    }

    pub fn is_alive(&self, handle: Handle) -> bool {
        self.resolve(handle).is_some()
    }

    pub fn kind(&self, handle: Handle) -> Option<HandleKind> {
        self.slots.get(&handle).map(|slot| slot.kind)
    }

    /// Releases a handle. Freeing an unknown or already freed handle does nothing.
    pub fn free(&self, handle: Handle) {
        let Some((_, slot)) = self.slots.remove(&handle) else {
            return;
        };

        if let Some(module) = slot.module {
            let set = self
                .keep_alive
                .get(&module)
                .map(|entry| Arc::clone(entry.value()));
            if let Some(set) = set {
                let pinned = set.lock().objects.remove(&handle);
                drop(pinned);
            }
        }
    }

    /// Drops every keep-alive pin held for `module` and stops accepting new ones.
    ///
    /// The caller raises the module's unloading flag first. Released objects are
    /// queued for the next collection pass; returns how many were queued.
    pub fn release_module(&self, module: ModuleId) -> usize {
        let Some((_, set)) = self.keep_alive.remove(&module) else {
            return 0;
        };

        let released: Vec<ObjectRef> = {
            let mut set = set.lock();
            set.closed = true;
            set.objects.drain().map(|(_, object)| object).collect()
        };
        let count = released.len();
        self.reclaim.defer_objects(released);

        tracing::debug!(module_id = %module, released = count, "keep-alive registry cleared");
        count
    }

    /// Forgets every handle that belonged to `module`; they can no longer resolve.
    pub fn forget_module(&self, module: ModuleId) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.module != Some(module));
        before.saturating_sub(self.slots.len())
    }

    /// Forgets handles whose targets no longer exist.
    pub fn purge_dead(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.target_exists());
        before.saturating_sub(self.slots.len())
    }

    /// Runs one collection pass over deferred releases.
    pub fn collect(&self) -> usize {
        self.reclaim.drain_pass()
    }

    pub(crate) fn defer_finalizer(&self, finalizer: Finalizer) {
        self.reclaim.defer_finalizer(finalizer);
    }

    pub fn pending_reclaim(&self) -> usize {
        self.reclaim.pending()
    }

    /// Number of objects currently pinned for `module`.
    pub fn pinned(&self, module: ModuleId) -> usize {
        self.keep_alive
            .get(&module)
            .map_or(0, |set| set.lock().objects.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
