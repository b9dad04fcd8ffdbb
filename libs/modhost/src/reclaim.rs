//! Deferred release work drained in passes by the unload monitor.

use std::panic::{self, AssertUnwindSafe};

use parking_lot::Mutex;

use crate::object::ObjectRef;

pub(crate) type Finalizer = Box<dyn FnOnce() + Send + 'static>;

enum Deferred {
    Object(ObjectRef),
    Finalizer(Finalizer),
}

/// Queue of references and callbacks whose release is postponed to a collection pass.
///
/// A pass works on a snapshot: anything queued while it runs waits for the next pass.
#[derive(Default)]
pub(crate) struct ReclaimQueue {
    pending: Mutex<Vec<Deferred>>,
}

impl ReclaimQueue {
    pub(crate) fn defer_objects(&self, objects: impl IntoIterator<Item = ObjectRef>) {
        self.pending
            .lock()
            .extend(objects.into_iter().map(Deferred::Object));
    }

    pub(crate) fn defer_finalizer(&self, finalizer: Finalizer) {
        self.pending.lock().push(Deferred::Finalizer(finalizer));
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Runs one pass and returns how many items it processed.
    pub(crate) fn drain_pass(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending.lock());
        let processed = batch.len();
        for item in batch {
            match item {
                Deferred::Object(object) => drop(object),
                Deferred::Finalizer(finalizer) => {
                    if panic::catch_unwind(AssertUnwindSafe(finalizer)).is_err() {
                        tracing::error!("unload finalizer panicked");
                    }
                }
            }
        }
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ManagedObject;
    use crate::testing::Counter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn pass_releases_deferred_objects() {
        let queue = ReclaimQueue::default();
        let object = ManagedObject::detached("Host.Counter", Counter::default());
        let weak = Arc::downgrade(&object);
        queue.defer_objects([object]);

        assert_eq!(queue.pending(), 1);
        assert!(weak.upgrade().is_some());
        assert_eq!(queue.drain_pass(), 1);
        assert!(weak.upgrade().is_none());
        assert_eq!(queue.drain_pass(), 0);
    }

    #[test]
    fn work_queued_during_a_pass_runs_next_pass() {
        let queue = Arc::new(ReclaimQueue::default());
        let ran = Arc::new(AtomicUsize::new(0));

        let inner_queue = Arc::downgrade(&queue);
        let inner_ran = ran.clone();
        queue.defer_finalizer(Box::new(move || {
            let ran = inner_ran.clone();
            if let Some(queue) = inner_queue.upgrade() {
                queue.defer_finalizer(Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }));
            }
            inner_ran.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(queue.drain_pass(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.drain_pass(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_finalizer_does_not_stop_the_pass() {
        let queue = ReclaimQueue::default();
        let ran = Arc::new(AtomicUsize::new(0));
        queue.defer_finalizer(Box::new(|| panic!("boom")));
        let counter = ran.clone();
        queue.defer_finalizer(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(queue.drain_pass(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
