//! The Join factory
//!
//! A [`Join`] owns a set of channels and the chords over them, backed by
//! one of two interchangeable engines. Capacity is fixed at construction
//! and selects the smallest channel-mask representation that covers it, so
//! a Join of up to 64 channels pays for a single machine word of matching
//! state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chorale_sets::{IdSet, Set128, Set256, Set32, Set512, Set64};
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::channel::{
    AsyncChannel, AsyncToken, ChannelKind, ChannelRef, SyncChannel, SyncRequest,
};
use crate::chord::ChordBuilder;
use crate::engine::locked::Locked;
use crate::engine::scalable::Scalable;
use crate::engine::{Engine, EngineShared, StatsCells};
use crate::error::{JoinError, Result};
use crate::executor::{Executor, ThreadExecutor};

/// Largest channel capacity any mask composition covers.
pub const MAX_CAPACITY: usize = 512;

// ============================================================================
// Identity and stats
// ============================================================================

/// Process-unique Join identity, used to reject foreign channels in
/// patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct JoinId(u64);

impl JoinId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A point-in-time snapshot of a Join's counters.
///
/// Counters are relaxed; cross-counter consistency is not guaranteed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinStats {
    /// Messages accepted by `send` and `call`.
    pub messages_sent: u64,
    /// Chord firings dispatched.
    pub chords_fired: u64,
    /// Matching passes retried after losing a claim race.
    pub claim_retries: u64,
    /// Synchronous senders that blocked past their spin budget.
    pub sync_parks: u64,
}

// ============================================================================
// Construction
// ============================================================================

/// Which matching engine backs a Join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineFlavor {
    /// One mutex serializes all matching. Predictable, fast at low
    /// contention.
    #[default]
    Locked,
    /// Lock-free message bags with optimistic claim and rollback. Scales
    /// with senders.
    Scalable,
}

/// Configures a [`Join`] before construction.
#[derive(Clone)]
pub struct JoinBuilder {
    capacity: usize,
    flavor: EngineFlavor,
    executor: Arc<dyn Executor>,
}

impl JoinBuilder {
    /// Select the matching engine.
    #[must_use]
    pub fn flavor(mut self, flavor: EngineFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    /// Replace the executor that runs purely asynchronous firings.
    #[must_use]
    pub fn executor(mut self, executor: impl Executor + 'static) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// Build the Join.
    ///
    /// Fails with [`JoinError::MaxSizeExceeded`] if the capacity exceeds
    /// [`MAX_CAPACITY`].
    pub fn build(self) -> Result<Join> {
        let stats = Arc::new(StatsCells::default());
        let shared = EngineShared::new(Arc::clone(&self.executor), Arc::clone(&stats));
        let engine = build_engine(self.flavor, self.capacity, shared)?;
        let id = JoinId::next();
        debug!(join = id.0, capacity = self.capacity, flavor = ?self.flavor, "join created");
        Ok(Join {
            core: Arc::new(JoinCore {
                id,
                capacity: self.capacity,
                engine,
                stats,
            }),
        })
    }
}

impl std::fmt::Debug for JoinBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinBuilder")
            .field("capacity", &self.capacity)
            .field("flavor", &self.flavor)
            .finish()
    }
}

fn make_engine<S: IdSet>(
    flavor: EngineFlavor,
    shared: EngineShared,
    capacity: usize,
) -> Box<dyn Engine> {
    match flavor {
        EngineFlavor::Locked => Box::new(Locked::<S>::new(shared, capacity)),
        EngineFlavor::Scalable => Box::new(Scalable::<S>::new(shared, capacity)),
    }
}

fn build_engine(
    flavor: EngineFlavor,
    capacity: usize,
    shared: EngineShared,
) -> Result<Box<dyn Engine>> {
    Ok(match capacity {
        0..=32 => make_engine::<Set32>(flavor, shared, capacity),
        33..=64 => make_engine::<Set64>(flavor, shared, capacity),
        65..=128 => make_engine::<Set128>(flavor, shared, capacity),
        129..=256 => make_engine::<Set256>(flavor, shared, capacity),
        257..=512 => make_engine::<Set512>(flavor, shared, capacity),
        _ => {
            return Err(JoinError::MaxSizeExceeded {
                requested: capacity,
                max: MAX_CAPACITY,
            })
        }
    })
}

// ============================================================================
// Join
// ============================================================================

pub(crate) struct JoinCore {
    pub(crate) id: JoinId,
    pub(crate) capacity: usize,
    pub(crate) engine: Box<dyn Engine>,
    pub(crate) stats: Arc<StatsCells>,
}

/// A coordination domain: a fixed-capacity set of channels and the chords
/// over them.
///
/// Cheap to clone; clones share the same underlying state.
#[derive(Clone)]
pub struct Join {
    core: Arc<JoinCore>,
}

impl Join {
    /// A Join with the given engine and the default executor.
    pub fn new(capacity: usize, flavor: EngineFlavor) -> Result<Join> {
        Join::builder(capacity).flavor(flavor).build()
    }

    /// Start configuring a Join.
    pub fn builder(capacity: usize) -> JoinBuilder {
        JoinBuilder {
            capacity,
            flavor: EngineFlavor::default(),
            executor: Arc::new(ThreadExecutor),
        }
    }

    /// The channel capacity fixed at construction.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    /// Snapshot the Join's counters.
    #[must_use]
    pub fn stats(&self) -> JoinStats {
        self.core.stats.snapshot()
    }

    /// Allocate an asynchronous channel carrying `T`.
    pub fn async_channel<T: Send + 'static>(&self) -> Result<AsyncChannel<T>> {
        let id = self.core.engine.add_channel(ChannelKind::AsyncValue)?;
        Ok(AsyncChannel::new(Arc::clone(&self.core), id))
    }

    /// Allocate a payload-free asynchronous channel.
    pub fn async_token(&self) -> Result<AsyncToken> {
        let id = self.core.engine.add_channel(ChannelKind::AsyncToken)?;
        Ok(AsyncToken::new(Arc::clone(&self.core), id))
    }

    /// Allocate a synchronous channel carrying `T` and returning `R`.
    pub fn sync_channel<T, R>(&self) -> Result<SyncChannel<T, R>>
    where
        T: Send + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let id = self.core.engine.add_channel(ChannelKind::SyncValue)?;
        Ok(SyncChannel::new(Arc::clone(&self.core), id))
    }

    /// Allocate a payload-free synchronous channel returning `R`.
    pub fn sync_request<R>(&self) -> Result<SyncRequest<R>>
    where
        R: Clone + Send + Sync + 'static,
    {
        let id = self.core.engine.add_channel(ChannelKind::SyncToken)?;
        Ok(SyncRequest::new(Arc::clone(&self.core), id))
    }

    /// Start a chord on one channel.
    pub fn when(&self, channel: &impl ChannelRef) -> ChordBuilder {
        ChordBuilder::start(Arc::clone(&self.core)).atom(channel)
    }

    /// Start a chord on a whole channel array.
    pub fn when_all(&self, channels: &[&dyn ChannelRef]) -> ChordBuilder {
        ChordBuilder::start(Arc::clone(&self.core)).vector(channels)
    }
}

impl std::fmt::Debug for Join {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Join")
            .field("id", &self.core.id)
            .field("capacity", &self.core.capacity)
            .finish()
    }
}

// ============================================================================
// Unhandled-panic hook
// ============================================================================

type PanicHook = Box<dyn Fn(&str) + Send + Sync>;

static UNHANDLED_PANIC_HOOK: RwLock<Option<PanicHook>> = RwLock::new(None);

/// Install a process-wide handler for panics escaping purely asynchronous
/// chord firings.
///
/// Such a firing has no blocked caller to resume the panic into; without a
/// hook the panic is logged and dropped.
pub fn set_unhandled_panic_hook(hook: impl Fn(&str) + Send + Sync + 'static) {
    *UNHANDLED_PANIC_HOOK.write() = Some(Box::new(hook));
}

/// Remove the handler installed by [`set_unhandled_panic_hook`].
pub fn clear_unhandled_panic_hook() {
    *UNHANDLED_PANIC_HOOK.write() = None;
}

pub(crate) fn report_unhandled_panic(message: &str) {
    match UNHANDLED_PANIC_HOOK.read().as_ref() {
        Some(hook) => hook(message),
        None => error!(message, "chord continuation panicked with nobody to tell"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_beyond_the_largest_mask_is_rejected() {
        let err = Join::new(MAX_CAPACITY + 1, EngineFlavor::Locked).unwrap_err();
        assert_eq!(
            err,
            JoinError::MaxSizeExceeded {
                requested: MAX_CAPACITY + 1,
                max: MAX_CAPACITY,
            }
        );
    }

    #[test]
    fn boundary_capacities_build() {
        for capacity in [0, 1, 32, 33, 64, 65, 128, 129, 256, 257, 512] {
            for flavor in [EngineFlavor::Locked, EngineFlavor::Scalable] {
                let join = Join::builder(capacity).flavor(flavor).build().unwrap();
                assert_eq!(join.capacity(), capacity);
            }
        }
    }

    #[test]
    fn channel_allocation_stops_at_capacity() {
        let join = Join::new(2, EngineFlavor::Scalable).unwrap();
        join.async_token().unwrap();
        join.async_token().unwrap();
        let err = join.async_token().unwrap_err();
        assert_eq!(err, JoinError::SizeExceeded { capacity: 2 });
        // Failure is repeatable, not sticky in some worse way.
        let err = join.sync_request::<()>().unwrap_err();
        assert_eq!(err, JoinError::SizeExceeded { capacity: 2 });
    }

    #[test]
    fn join_ids_are_distinct() {
        let a = Join::new(4, EngineFlavor::Locked).unwrap();
        let b = Join::new(4, EngineFlavor::Locked).unwrap();
        assert_ne!(a.core.id, b.core.id);
    }
}
