use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

/// Result returned by a cleanup action.
pub type CleanupResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type CleanupFn = Box<dyn FnOnce() -> CleanupResult + Send>;

struct CleanupAction {
    name: String,
    action: CleanupFn,
}

/// Outcome of draining a [`CleanupRegistry`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub ran: usize,
    /// Names of actions that returned an error or panicked.
    pub failed: Vec<String>,
}

/// Ordered teardown steps run once at shutdown.
///
/// Clones share the same list. Actions can be appended until the registry is
/// drained; after that, registration is refused.
#[derive(Clone)]
pub struct CleanupRegistry {
    actions: Arc<Mutex<Option<Vec<CleanupAction>>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self {
            actions: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Append an action. Returns false if the registry was already drained.
    pub fn register<F>(&self, name: impl Into<String>, action: F) -> bool
    where
        F: FnOnce() -> CleanupResult + Send + 'static,
    {
        let name = name.into();
        let mut guard = self.actions.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(actions) => {
                actions.push(CleanupAction {
                    name,
                    action: Box::new(action),
                });
                true
            }
            None => {
                warn!(%name, "cleanup registry already drained, action ignored");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered action in registration order.
    ///
    /// A failing or panicking action is logged and does not stop the ones after
    /// it. Only the first call runs anything; later calls return an empty report.
    pub fn run_all(&self) -> CleanupReport {
        let actions = self
            .actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();

        let mut report = CleanupReport::default();
        for CleanupAction { name, action } in actions {
            report.ran += 1;
            match panic::catch_unwind(AssertUnwindSafe(action)) {
                Ok(Ok(())) => debug!(%name, "cleanup action completed"),
                Ok(Err(e)) => {
                    warn!(%name, "cleanup action failed: {}", e);
                    report.failed.push(name);
                }
                Err(_) => {
                    warn!(%name, "cleanup action panicked");
                    report.failed.push(name);
                }
            }
        }
        report
    }
}

impl Default for CleanupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> CleanupFn) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let make = move |n: u32| -> CleanupFn {
            let log = log2.clone();
            Box::new(move || {
                log.lock().unwrap().push(n);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_runs_in_registration_order() {
        let registry = CleanupRegistry::new();
        let (log, make) = recorder();
        for n in 1..=3 {
            assert!(registry.register(format!("step-{}", n), make(n)));
        }
        assert_eq!(registry.len(), 3);

        let report = registry.run_all();
        assert_eq!(report.ran, 3);
        assert!(report.failed.is_empty());
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_failure_does_not_stop_later_actions() {
        let registry = CleanupRegistry::new();
        let (log, make) = recorder();
        registry.register("first", make(1));
        registry.register("broken", || Err("disk gone".into()));
        registry.register("third", make(3));

        let report = registry.run_all();
        assert_eq!(report.ran, 3);
        assert_eq!(report.failed, vec!["broken".to_string()]);
        assert_eq!(*log.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_panic_is_contained() {
        let registry = CleanupRegistry::new();
        let (log, make) = recorder();
        registry.register("panics", || panic!("cleanup exploded"));
        registry.register("after", make(2));

        let report = registry.run_all();
        assert_eq!(report.failed, vec!["panics".to_string()]);
        assert_eq!(*log.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_drained_exactly_once() {
        let registry = CleanupRegistry::new();
        let (log, make) = recorder();
        registry.register("only", make(7));

        assert_eq!(registry.run_all().ran, 1);
        assert_eq!(registry.run_all().ran, 0);
        assert_eq!(*log.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_register_after_drain_refused() {
        let registry = CleanupRegistry::new();
        registry.run_all();
        assert!(!registry.register("late", || Ok(())));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clones_share_actions() {
        let registry = CleanupRegistry::new();
        let other = registry.clone();
        other.register("from-clone", || Ok(()));
        assert_eq!(registry.len(), 1);
    }
}
