//! Firing executors
//!
//! When a chord fires with no synchronous participants, nobody is blocked
//! waiting for the continuation, so the engine hands the firing to an
//! executor instead of running it inline on the sending thread. The
//! executor choice is a [`Join`](crate::Join) construction parameter.

/// Runs purely asynchronous chord firings.
///
/// Implementations must not block the caller: `spawn` is invoked from
/// `send` paths that promise not to stall the sender. Panics inside the
/// job are already contained by the engine before `spawn` is called.
pub trait Executor: Send + Sync {
    /// Run `job`, now or later, on some thread.
    fn spawn(&self, job: Box<dyn FnOnce() + Send>);
}

/// Spawns one worker thread per firing.
///
/// Simple and isolating: a slow continuation delays nothing but itself.
/// The thread is detached; completion is observable only through the
/// continuation's own effects.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn spawn(&self, job: Box<dyn FnOnce() + Send>) {
        std::thread::Builder::new()
            .name("chorale-firing".to_string())
            .spawn(job)
            .expect("failed to spawn a firing thread");
    }
}

/// Runs each firing inline on the sending thread.
///
/// Deterministic and allocation-light, at the cost of `send` not returning
/// until the continuation finishes. Useful in tests and in callers that
/// schedule their own concurrency.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn spawn(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn inline_runs_before_returning() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        InlineExecutor.spawn(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn thread_executor_runs_eventually() {
        let (tx, rx) = std::sync::mpsc::channel();
        ThreadExecutor.spawn(Box::new(move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("spawned firing never ran");
    }
}
