//! Coordination engines
//!
//! An engine owns a Join's message state and implements matching: deciding
//! when some chord has a pending message on every channel it joins,
//! consuming exactly one message per channel, and running the continuation
//! once. Two interchangeable engines exist behind the [`Engine`] trait:
//!
//! - [`locked`]: one mutex serializes all matching. Simple, fair enough,
//!   and fast at low contention.
//! - [`scalable`]: lock-free message bags with optimistic claim and
//!   rollback. Matching threads race, losers retry with backoff.
//!
//! Both uphold the same contract: a message is consumed by at most one
//! firing, a chord fires only when fully matched, and matching never
//! deadlocks while a viable firing exists.

pub(crate) mod locked;
pub(crate) mod scalable;

mod bag;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::channel::{ChannelId, ChannelKind, Payload};
use crate::chord::{Args, Continuation, Reply};
use crate::error::JoinError;
use crate::executor::Executor;
use crate::join::JoinStats;
use crate::pattern::Pattern;

// ============================================================================
// Engine contract
// ============================================================================

/// Result of a synchronous send, as seen by the unblocked sender.
#[derive(Clone)]
pub(crate) enum SyncOutcome {
    /// The chord fired; `Some` carries its reply value, `None` means the
    /// continuation replied nothing.
    Value(Option<Arc<dyn Any + Send + Sync>>),
    /// The continuation panicked; the message is resumed at the sender.
    Panicked(String),
}

/// The matching core behind a Join.
///
/// Object safe: the Join factory monomorphizes each engine over the
/// smallest channel-mask type that covers the requested capacity and hides
/// it behind `Box<dyn Engine>`.
pub(crate) trait Engine: Send + Sync {
    /// Allocate the next channel id.
    fn add_channel(&self, kind: ChannelKind) -> Result<ChannelId, JoinError>;

    /// Register a chord over already-allocated channels.
    fn register(&self, pattern: Pattern, body: Continuation) -> Result<(), JoinError>;

    /// Queue an asynchronous message. Must not block the caller beyond
    /// bounded matching work.
    fn send_async(&self, id: ChannelId, payload: Payload);

    /// Send a synchronous message and block until a firing consumes it.
    fn send_sync(&self, id: ChannelId, payload: Payload) -> SyncOutcome;
}

// ============================================================================
// Shared firing machinery
// ============================================================================

/// Run a continuation under a panic boundary.
pub(crate) fn run_body(body: &Continuation, args: Vec<Box<dyn Any + Send>>) -> SyncOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| body(Args::new(args)))) {
        Ok(Reply::None) => SyncOutcome::Value(None),
        Ok(Reply::Value(value)) => SyncOutcome::Value(Some(value)),
        Err(payload) => SyncOutcome::Panicked(panic_message(payload.as_ref())),
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "chord continuation panicked".to_string()
    }
}

/// Counters shared by a Join and its engine.
#[derive(Debug, Default)]
pub(crate) struct StatsCells {
    pub(crate) messages_sent: AtomicU64,
    pub(crate) chords_fired: AtomicU64,
    pub(crate) claim_retries: AtomicU64,
    pub(crate) sync_parks: AtomicU64,
}

impl StatsCells {
    pub(crate) fn snapshot(&self) -> JoinStats {
        JoinStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            chords_fired: self.chords_fired.load(Ordering::Relaxed),
            claim_retries: self.claim_retries.load(Ordering::Relaxed),
            sync_parks: self.sync_parks.load(Ordering::Relaxed),
        }
    }
}

/// Executor and counters, shared by both engine flavors.
pub(crate) struct EngineShared {
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) stats: Arc<StatsCells>,
}

impl EngineShared {
    pub(crate) fn new(executor: Arc<dyn Executor>, stats: Arc<StatsCells>) -> Self {
        Self { executor, stats }
    }

    /// Dispatch a purely asynchronous firing.
    ///
    /// The continuation runs on the executor; a panic there has no blocked
    /// sender to resume into, so it is routed to the unhandled-panic hook.
    pub(crate) fn spawn_firing(&self, body: Continuation, args: Vec<Box<dyn Any + Send>>) {
        self.stats.chords_fired.fetch_add(1, Ordering::Relaxed);
        self.executor.spawn(Box::new(move || {
            if let SyncOutcome::Panicked(msg) = run_body(&body, args) {
                crate::join::report_unhandled_panic(&msg);
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(f: impl Fn(Args) -> Reply + Send + Sync + 'static) -> Continuation {
        Arc::new(f)
    }

    #[test]
    fn run_body_captures_reply() {
        let body = body_of(|mut args| {
            let n: u32 = args.take();
            crate::chord::reply(n * 2)
        });
        match run_body(&body, vec![Box::new(21u32)]) {
            SyncOutcome::Value(Some(v)) => {
                assert_eq!(*v.downcast::<u32>().expect("u32 reply"), 42);
            }
            _ => panic!("expected a reply value"),
        }
    }

    #[test]
    fn run_body_contains_panics() {
        let body = body_of(|_| panic!("kaboom"));
        match run_body(&body, vec![]) {
            SyncOutcome::Panicked(msg) => assert_eq!(msg, "kaboom"),
            SyncOutcome::Value(_) => panic!("panic should be captured"),
        }
    }

    #[test]
    fn panic_message_handles_odd_payloads() {
        assert_eq!(panic_message(&"x"), "x");
        assert_eq!(panic_message(&"y".to_string()), "y");
        assert_eq!(panic_message(&42u32), "chord continuation panicked");
    }
}
