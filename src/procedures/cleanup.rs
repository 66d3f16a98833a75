//! Teardown actions for procedures.
//!
//! A procedure that changes the hardware state (light on, grating moved)
//! registers the action undoing it in a [`CleanupRegistry`], then runs the
//! registry on every exit path: success, error or cancellation. Actions run
//! once, most recent first, and a panicking action does not prevent the
//! others from running.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut cleanup = CleanupRegistry::new();
//! let light = components.light.clone();
//! cleanup.register("light-off", move || async move {
//!     let (min, _) = light.power_range();
//!     light.set_power(min).await
//! });
//!
//! let result = do_the_work().await;
//! let teardown = cleanup.run_all().await;
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error};

/// Type alias for async cleanup functions.
pub type AsyncCleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Registry for async cleanup actions.
///
/// Async code cannot run in `Drop`, so the owner must call
/// [`run_all`](Self::run_all) explicitly. Actions not wanted anymore (e.g.
/// the light should stay on) are taken out with [`remove`](Self::remove).
#[derive(Default)]
pub struct CleanupRegistry {
    actions: Vec<(String, AsyncCleanupFn)>,
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.actions.iter().map(|(name, _)| name))
            .finish()
    }
}

impl CleanupRegistry {
    /// Create a new empty cleanup registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup action, replacing any action with the same name.
    ///
    /// Actions are run in reverse order of registration (LIFO).
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        self.actions.retain(|(n, _)| *n != name);
        self.actions.push((name, Box::new(move || action().boxed())));
    }

    /// Remove a specific cleanup action.
    pub fn remove(&mut self, name: &str) -> Option<AsyncCleanupFn> {
        let index = self.actions.iter().position(|(n, _)| n == name)?;
        Some(self.actions.remove(index).1)
    }

    /// Whether an action with this name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.actions.iter().any(|(n, _)| n == name)
    }

    /// Run all cleanup actions (in reverse order), consuming the registry.
    ///
    /// Every action runs even if a previous one failed or panicked. Returns
    /// the first failure.
    pub async fn run_all(mut self) -> anyhow::Result<()> {
        let mut first_error = None;
        while let Some((name, action)) = self.actions.pop() {
            debug!("Running cleanup: {}", name);
            let outcome = AssertUnwindSafe(action()).catch_unwind().await;
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.context(format!("cleanup '{name}' failed")),
                Err(_) => anyhow::anyhow!("cleanup '{name}' panicked"),
            };
            error!("{failure:#}");
            first_error.get_or_insert(failure);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Check if the registry has any cleanup actions.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Get the number of registered cleanup actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        name: &'static str,
    ) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move || {
            async move {
                log.lock().push(name.to_string());
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn runs_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CleanupRegistry::new();
        registry.register("first", recorder(&log, "first"));
        registry.register("second", recorder(&log, "second"));
        assert_eq!(registry.len(), 2);

        registry.run_all().await.unwrap();
        assert_eq!(*log.lock(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn removed_action_does_not_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CleanupRegistry::new();
        registry.register("light-off", recorder(&log, "light-off"));
        assert!(registry.contains("light-off"));
        assert!(registry.remove("light-off").is_some());
        assert!(registry.is_empty());
        registry.run_all().await.unwrap();
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CleanupRegistry::new();
        registry.register("restore", recorder(&log, "restore"));
        registry.register("panics", || async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        registry.register("fails", || async { Err(anyhow::anyhow!("stalled")) });

        let err = registry.run_all().await.unwrap_err();
        assert!(format!("{err:#}").contains("fails"));
        assert_eq!(*log.lock(), vec!["restore"]);
    }
}
