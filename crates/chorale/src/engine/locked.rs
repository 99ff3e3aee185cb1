//! Mutex-serialized engine
//!
//! One mutex guards everything: channel queues, the pending-state bitmask,
//! and the chord table. Matching is a circular scan over the chords
//! starting at a rotating cursor, so no chord is starved by an earlier
//! sibling that keeps matching. Continuations always run outside the
//! mutex; matched firings are collected as effects under the lock and
//! dispatched after release.
//!
//! Synchronous senders park on a per-waiter condvar. A firing with
//! synchronous participants is executed on the first such participant's
//! thread: the matcher hands that waiter the full firing plan, the waiter
//! runs the continuation, and distributes the outcome to the remaining
//! participants.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chorale_sets::IdSet;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::channel::{ChannelId, ChannelKind, Payload};
use crate::chord::Continuation;
use crate::engine::{run_body, Engine, EngineShared, SyncOutcome};
use crate::error::JoinError;
use crate::pattern::Pattern;

// ============================================================================
// Waiters
// ============================================================================

/// What a parked synchronous sender is waiting on.
enum WaiterPhase {
    /// Still queued, or matched but not yet told.
    Waiting,
    /// Matched as the firing participant: run the plan on this thread.
    Fire(FirePlan),
    /// Matched as a co-participant: the firing already ran elsewhere.
    Done(SyncOutcome),
}

/// A complete matched firing, handed to the participant that executes it.
struct FirePlan {
    body: Continuation,
    args: Vec<Box<dyn Any + Send>>,
    /// The firing's other synchronous participants, in declaration order.
    co: Vec<Arc<Waiter>>,
}

struct WaiterCell {
    /// Taken by the matcher when the waiter's message is consumed.
    payload: Option<Payload>,
    phase: WaiterPhase,
}

/// A parked synchronous sender.
struct Waiter {
    cell: Mutex<WaiterCell>,
    cond: Condvar,
}

impl Waiter {
    fn new(payload: Payload) -> Arc<Self> {
        Arc::new(Self {
            cell: Mutex::new(WaiterCell {
                payload: Some(payload),
                phase: WaiterPhase::Waiting,
            }),
            cond: Condvar::new(),
        })
    }

    fn deliver(&self, phase: WaiterPhase) {
        let mut cell = self.cell.lock();
        cell.phase = phase;
        self.cond.notify_one();
    }
}

// ============================================================================
// Queues and chords
// ============================================================================

/// Pending messages on one channel.
enum Queue {
    /// Payload-carrying asynchronous messages, FIFO.
    Values(VecDeque<Box<dyn Any + Send>>),
    /// Payload-free asynchronous messages collapse to a counter.
    Count(u32),
    /// Parked synchronous senders, FIFO.
    Waiters(VecDeque<Arc<Waiter>>),
}

impl Queue {
    fn is_empty(&self) -> bool {
        match self {
            Queue::Values(q) => q.is_empty(),
            Queue::Count(n) => *n == 0,
            Queue::Waiters(q) => q.is_empty(),
        }
    }
}

struct ChannelSlot {
    kind: ChannelKind,
    queue: Queue,
}

struct Chord<S> {
    mask: S,
    /// Joined channels in declaration order; payload extraction follows it.
    channels: Vec<(ChannelId, ChannelKind)>,
    body: Continuation,
}

/// Work to dispatch once the engine mutex is released.
enum Effect {
    /// Purely asynchronous firing: run on the executor.
    Spawn(Continuation, Vec<Box<dyn Any + Send>>),
    /// Firing with synchronous participants: wake the executing one.
    Wake(Arc<Waiter>, FirePlan),
}

// ============================================================================
// Engine
// ============================================================================

struct State<S> {
    /// Bit `i` is set while channel `i` has at least one pending message.
    pending: S,
    channels: Vec<ChannelSlot>,
    chords: Vec<Arc<Chord<S>>>,
    /// Circular scan start, advanced past each fired chord.
    cursor: usize,
}

/// The mutex-serialized engine, monomorphized over the channel-mask type.
pub(crate) struct Locked<S> {
    shared: EngineShared,
    capacity: usize,
    state: Mutex<State<S>>,
}

impl<S: IdSet> Locked<S> {
    pub(crate) fn new(shared: EngineShared, capacity: usize) -> Self {
        debug_assert!(capacity <= S::CAPACITY as usize);
        Self {
            shared,
            capacity,
            state: Mutex::new(State {
                pending: S::empty(),
                channels: Vec::new(),
                chords: Vec::new(),
                cursor: 0,
            }),
        }
    }

    /// Find one fully matched chord and consume its messages.
    ///
    /// Runs under the engine mutex. Returns `None` when no chord matches
    /// the current pending set.
    fn match_one(st: &mut State<S>) -> Option<Effect> {
        let count = st.chords.len();
        for step in 0..count {
            let index = (st.cursor + step) % count;
            let chord = Arc::clone(&st.chords[index]);
            if !chord.mask.is_subset_of(&st.pending) {
                continue;
            }
            st.cursor = (index + 1) % count;
            return Some(Self::consume(st, &chord));
        }
        None
    }

    /// Dequeue one message per joined channel and build the firing.
    fn consume(st: &mut State<S>, chord: &Chord<S>) -> Effect {
        let mut args: Vec<Box<dyn Any + Send>> = Vec::new();
        let mut waiters: Vec<Arc<Waiter>> = Vec::new();
        for &(id, kind) in &chord.channels {
            let slot = &mut st.channels[id.0 as usize];
            match (&mut slot.queue, kind) {
                (Queue::Values(q), ChannelKind::AsyncValue) => {
                    let value = q.pop_front().expect("matched channel has a message");
                    args.push(value);
                }
                (Queue::Count(n), ChannelKind::AsyncToken) => {
                    debug_assert!(*n > 0, "matched channel has a message");
                    *n -= 1;
                }
                (Queue::Waiters(q), ChannelKind::SyncValue | ChannelKind::SyncToken) => {
                    let waiter = q.pop_front().expect("matched channel has a waiter");
                    let payload = waiter
                        .cell
                        .lock()
                        .payload
                        .take()
                        .expect("queued waiter still holds its payload");
                    if let Payload::Value(value) = payload {
                        args.push(value);
                    }
                    waiters.push(waiter);
                }
                _ => unreachable!("channel queue shape matches its kind"),
            }
            if slot.queue.is_empty() {
                st.pending.remove(id.0);
            }
        }
        let body = Arc::clone(&chord.body);
        match waiters.split_first() {
            None => Effect::Spawn(body, args),
            Some((firer, co)) => Effect::Wake(
                Arc::clone(firer),
                FirePlan {
                    body,
                    args,
                    co: co.to_vec(),
                },
            ),
        }
    }
}

impl<S: IdSet> Engine for Locked<S> {
    fn add_channel(&self, kind: ChannelKind) -> Result<ChannelId, JoinError> {
        let mut st = self.state.lock();
        if st.channels.len() >= self.capacity {
            return Err(JoinError::SizeExceeded {
                capacity: self.capacity,
            });
        }
        let id = ChannelId(st.channels.len() as u32);
        let queue = match kind {
            ChannelKind::AsyncValue => Queue::Values(VecDeque::new()),
            ChannelKind::AsyncToken => Queue::Count(0),
            ChannelKind::SyncValue | ChannelKind::SyncToken => Queue::Waiters(VecDeque::new()),
        };
        st.channels.push(ChannelSlot { kind, queue });
        Ok(id)
    }

    fn register(&self, pattern: Pattern, body: Continuation) -> Result<(), JoinError> {
        let mask: S = pattern.mask()?;
        if mask.is_empty() {
            return Err(JoinError::EmptyPattern);
        }
        let effects = {
            let mut st = self.state.lock();
            let channels = pattern
                .channels()
                .into_iter()
                .map(|id| (id, st.channels[id.0 as usize].kind))
                .collect();
            st.chords.push(Arc::new(Chord {
                mask,
                channels,
                body,
            }));
            debug!(channels = ?mask, "chord registered");
            // Pending messages may already complete the new chord.
            self.collect_effects(&mut st)
        };
        self.dispatch(effects);
        Ok(())
    }

    fn send_async(&self, id: ChannelId, payload: Payload) {
        self.shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        let effects = {
            let mut st = self.state.lock();
            let slot = &mut st.channels[id.0 as usize];
            match (&mut slot.queue, payload) {
                (Queue::Values(q), Payload::Value(value)) => q.push_back(value),
                (Queue::Count(n), Payload::Unit) => {
                    *n = n.checked_add(1).unwrap_or_else(|| {
                        panic!("{}", JoinError::AsyncChannelOverflow)
                    });
                }
                _ => unreachable!("payload shape matches the channel kind"),
            }
            st.pending.insert(id.0);
            self.collect_effects(&mut st)
        };
        self.dispatch(effects);
    }

    fn send_sync(&self, id: ChannelId, payload: Payload) -> SyncOutcome {
        self.shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        let waiter = Waiter::new(payload);
        let effects = {
            let mut st = self.state.lock();
            match &mut st.channels[id.0 as usize].queue {
                Queue::Waiters(q) => q.push_back(Arc::clone(&waiter)),
                _ => unreachable!("synchronous channel has a waiter queue"),
            }
            st.pending.insert(id.0);
            self.collect_effects(&mut st)
        };
        self.dispatch(effects);
        self.await_outcome(&waiter)
    }
}

impl<S: IdSet> Locked<S> {
    fn collect_effects(&self, st: &mut State<S>) -> Vec<Effect> {
        let mut effects = Vec::new();
        while let Some(effect) = Self::match_one(st) {
            effects.push(effect);
        }
        effects
    }

    fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Spawn(body, args) => self.shared.spawn_firing(body, args),
                Effect::Wake(firer, plan) => {
                    self.shared.stats.chords_fired.fetch_add(1, Ordering::Relaxed);
                    firer.deliver(WaiterPhase::Fire(plan));
                }
            }
        }
    }

    /// Park until matched, executing the firing here if chosen.
    fn await_outcome(&self, waiter: &Arc<Waiter>) -> SyncOutcome {
        let plan = {
            let mut cell = waiter.cell.lock();
            loop {
                match std::mem::replace(&mut cell.phase, WaiterPhase::Waiting) {
                    WaiterPhase::Waiting => {
                        self.shared.stats.sync_parks.fetch_add(1, Ordering::Relaxed);
                        waiter.cond.wait(&mut cell);
                    }
                    WaiterPhase::Done(outcome) => return outcome,
                    WaiterPhase::Fire(plan) => break plan,
                }
            }
        };
        trace!(participants = plan.co.len() + 1, "firing on sync sender");
        let outcome = run_body(&plan.body, plan.args);
        for co in &plan.co {
            co.deliver(WaiterPhase::Done(outcome.clone()));
        }
        outcome
    }
}
