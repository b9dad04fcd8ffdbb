//! Bounded wait for a module context to be reclaimed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::handles::HandleTable;
use crate::loader::{Module, ModuleId, ModuleLoader, UnloadTicket};

#[derive(Debug, Error)]
pub enum UnloadError {
    #[error("module '{module}' was still reachable after {}ms ({passes} collection passes)", waited.as_millis())]
    Timeout {
        module: String,
        module_id: ModuleId,
        waited: Duration,
        passes: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnloadReport {
    pub module_id: ModuleId,
    /// Keep-alive pins dropped when the unload started.
    pub released: usize,
    pub passes: u32,
    pub elapsed: Duration,
}

/// Drives an unload to completion: releases the module's pins, requests the
/// unload, then runs collection passes until the context is gone.
pub struct UnloadMonitor {
    handles: Arc<HandleTable>,
    budget: Duration,
    poll_interval: Duration,
}

impl UnloadMonitor {
    pub const DEFAULT_BUDGET: Duration = Duration::from_millis(4000);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

    pub fn new(handles: Arc<HandleTable>) -> Self {
        Self {
            handles,
            budget: Self::DEFAULT_BUDGET,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn unload(&self, loader: &ModuleLoader, module: Module) -> Result<UnloadReport, UnloadError> {
        let started = Instant::now();
        let module_id = module.id();

        // Raised before the pins go so no new pin can be taken for this module.
        module.context().mark_unloading();
        let released = self.handles.release_module(module_id);

        let mut ticket = loader.unload(module);
        for hook in std::mem::take(&mut ticket.hooks) {
            self.handles.defer_finalizer(hook);
        }

        match self.wait(&ticket, started) {
            Ok(passes) => {
                let forgotten = self.handles.forget_module(module_id) + self.handles.purge_dead();
                let report = UnloadReport {
                    module_id,
                    released,
                    passes,
                    elapsed: started.elapsed(),
                };
                tracing::info!(
                    module = %ticket.name(),
                    module_id = %module_id,
                    released,
                    forgotten,
                    passes,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "module unloaded"
                );
                Ok(report)
            }
            Err(passes) => {
                let waited = started.elapsed();
                tracing::warn!(
                    module = %ticket.name(),
                    module_id = %module_id,
                    passes,
                    pending = self.handles.pending_reclaim(),
                    waited_ms = waited.as_millis() as u64,
                    "module still reachable after unload budget; giving up"
                );
                Err(UnloadError::Timeout {
                    module: ticket.name().to_owned(),
                    module_id,
                    waited,
                    passes,
                })
            }
        }
    }

    /// Polls the ticket; `Ok(passes)` once reclaimed, `Err(passes)` at the deadline.
    fn wait(&self, ticket: &UnloadTicket, started: Instant) -> Result<u32, u32> {
        let deadline = started + self.budget;
        let mut passes = 0u32;

        loop {
            passes += 1;
            // One pass, then drain whatever that pass queued.
            while self.handles.collect() > 0 && Instant::now() < deadline {}

            if ticket.is_reclaimed() {
                return Ok(passes);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(passes);
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use parking_lot::Mutex;

    fn monitor(handles: &Arc<HandleTable>) -> UnloadMonitor {
        UnloadMonitor::new(Arc::clone(handles))
            .with_budget(Duration::from_millis(300))
            .with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn unload_succeeds_when_only_handles_reference_the_module() {
        let fixture = Fixture::new();
        let handles = Arc::new(HandleTable::new());
        let client = fixture.load_client();

        let object = client.instantiate("Game.Player", None).unwrap();
        let strong = handles.alloc_strong(&object);
        let weak = handles.alloc_weak(&object);
        drop(object);

        let report = monitor(&handles).unload(&fixture.loader, client).unwrap();
        assert_eq!(report.released, 1);
        assert!(report.passes >= 1);
        assert!(!handles.is_alive(strong));
        assert!(!handles.is_alive(weak));
        assert!(handles.is_empty());
    }

    #[test]
    fn leaked_reference_times_out_within_budget() {
        let fixture = Fixture::new();
        let handles = Arc::new(HandleTable::new());
        let client = fixture.load_client();
        let leaked = client.instantiate("Game.Player", None).unwrap();

        let started = Instant::now();
        let err = monitor(&handles)
            .unload(&fixture.loader, client)
            .unwrap_err();
        let elapsed = started.elapsed();

        match err {
            UnloadError::Timeout { module, waited, passes, .. } => {
                assert_eq!(module, "Game.Client");
                assert!(waited >= Duration::from_millis(300));
                assert!(passes > 1);
            }
        }
        assert!(elapsed < Duration::from_secs(3));
        assert!(leaked.is_module_unloading());
    }

    #[test]
    fn unloading_hooks_sever_cross_module_references() {
        let fixture = Fixture::new();
        let handles = Arc::new(HandleTable::new());
        let core = fixture.load_core();
        fixture.loader.set_main(Some(&core));
        let client = fixture.load_client();

        // A core-side registry holding a client object, like an event subscription.
        let subscribers = Arc::new(Mutex::new(Vec::new()));
        subscribers
            .lock()
            .push(client.instantiate("Game.Player", None).unwrap());
        let registry = Arc::clone(&subscribers);
        client.on_unloading(move || registry.lock().clear());

        monitor(&handles).unload(&fixture.loader, client).unwrap();
        assert!(subscribers.lock().is_empty());
    }

    #[test]
    fn core_becomes_collectible_once_the_client_is_gone() {
        let fixture = Fixture::new();
        let handles = Arc::new(HandleTable::new());
        let core = fixture.load_core();
        fixture.loader.set_main(Some(&core));
        let client = fixture.load_client();

        monitor(&handles).unload(&fixture.loader, client).unwrap();
        fixture.loader.set_main(None);
        monitor(&handles).unload(&fixture.loader, core).unwrap();
    }
}
