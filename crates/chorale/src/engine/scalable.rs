//! Lock-free engine
//!
//! Messages live in per-channel [`Bag`]s and matching is optimistic: a
//! sender scans the chords of its channel, picks one pending message per
//! joined channel, and tries to claim them all with per-slot CAS in a
//! fixed channel-id order. If any claim fails the whole set is rolled
//! back and the pass reports contention; the sender retries under
//! [`Backoff`]. A pass that finds neither a match nor contention is
//! conclusive, and the sender may stop (asynchronous) or park
//! (synchronous).
//!
//! Firings with a synchronous participant always execute on one such
//! participant's thread. If the matcher is that participant it fires
//! inline; otherwise it deposits the complete claimed firing into the
//! participant's sync entry, marks the slot `WOKEN`, and signals. The
//! woken thread finishes consumption, runs the continuation, and
//! distributes the outcome to the remaining synchronous participants.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use chorale_sets::IdSet;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::channel::{ChannelId, ChannelKind, Payload};
use crate::chord::Continuation;
use crate::engine::bag::{Bag, SlotRef, CONSUMED, WOKEN};
use crate::engine::{run_body, Engine, EngineShared, SyncOutcome};
use crate::error::JoinError;
use crate::park::{local_signal, Backoff, Signal, SpinEstimator};
use crate::pattern::Pattern;

// ============================================================================
// Messages and sync entries
// ============================================================================

/// Rendezvous state for one blocked synchronous sender.
pub(crate) struct SyncEntry {
    pub(crate) signal: Arc<Signal>,
    /// Filled by a matcher that elects this sender to execute the firing.
    pub(crate) handoff: Mutex<Option<FiringJob>>,
    /// Filled by whichever thread executed a firing this sender joined.
    pub(crate) outcome: Mutex<Option<SyncOutcome>>,
}

/// One published message.
pub(crate) struct Message {
    pub(crate) payload: Payload,
    /// Present iff the sender is blocked on this message.
    pub(crate) sync: Option<Arc<SyncEntry>>,
}

/// A fully claimed firing, handed to a woken synchronous sender.
///
/// Slots are in chord declaration order; the recipient finds its own slot
/// by identity and takes that message directly.
pub(crate) struct FiringJob {
    body: Continuation,
    slots: Vec<SlotRef>,
}

// ============================================================================
// Chords and channels
// ============================================================================

struct Chord {
    /// Joined channels in declaration order.
    channels: Vec<(ChannelId, ChannelKind)>,
    /// Positions into `channels`, sorted by channel id. All matchers claim
    /// in this order so rival claim sets collide early instead of
    /// livelocking.
    claim_order: Vec<usize>,
    body: Continuation,
}

struct ChannelState {
    kind: ChannelKind,
    bag: Bag,
    spin: SpinEstimator,
    /// Chords joining this channel.
    chords: RwLock<Vec<Arc<Chord>>>,
}

/// The matcher's view of one claimed position.
enum Claimed {
    /// The resolving sender's message, not yet published anywhere.
    Local,
    /// The resolving sender's published slot.
    Own(SlotRef),
    /// Somebody else's message.
    Other(SlotRef),
}

impl Claimed {
    fn slot(&self) -> Option<&SlotRef> {
        match self {
            Claimed::Local => None,
            Claimed::Own(s) | Claimed::Other(s) => Some(s),
        }
    }
}

/// The resolving sender's own message, if it has one in play.
struct OwnMsg {
    channel: ChannelId,
    /// `None` while the message is still thread-local (sync fast path).
    slot: Option<SlotRef>,
}

/// Result of one matching pass.
enum Pass {
    /// A chord involving the caller's own synchronous message fired on
    /// this thread.
    Inline(SyncOutcome),
    /// A firing was dispatched (spawned or handed off).
    Progress,
    /// No claim completed, but a rival held something; retry.
    Contended,
    /// Conclusively no firing is currently possible.
    Clean,
}

// ============================================================================
// Engine
// ============================================================================

/// The lock-free engine, monomorphized over the channel-mask type used for
/// registration-time pattern checks.
pub(crate) struct Scalable<S> {
    shared: EngineShared,
    capacity: usize,
    channels: RwLock<Vec<Arc<ChannelState>>>,
    _mask: PhantomData<S>,
}

impl<S: IdSet> Scalable<S> {
    pub(crate) fn new(shared: EngineShared, capacity: usize) -> Self {
        debug_assert!(capacity <= S::CAPACITY as usize);
        Self {
            shared,
            capacity,
            channels: RwLock::new(Vec::new()),
            _mask: PhantomData,
        }
    }

    fn channel(&self, id: ChannelId) -> Arc<ChannelState> {
        Arc::clone(&self.channels.read()[id.0 as usize])
    }

    // ------------------------------------------------------------------
    // Claiming
    // ------------------------------------------------------------------

    /// Try to claim one message per channel of `chord`.
    ///
    /// Find phase walks declaration order picking the oldest pending slot
    /// per channel (the caller's own message stands in for its channel).
    /// Claim phase CASes the picks in channel-id order, rolling everything
    /// back on the first failure.
    fn try_claim(&self, chord: &Chord, own: Option<&OwnMsg>) -> Result<Vec<Claimed>, bool> {
        let channels = self.channels.read();
        let mut picks: Vec<Claimed> = Vec::with_capacity(chord.channels.len());
        let mut contended = false;
        for &(id, _) in &chord.channels {
            if let Some(own) = own.filter(|o| o.channel == id) {
                picks.push(match &own.slot {
                    None => Claimed::Local,
                    Some(slot) => Claimed::Own(slot.clone()),
                });
                continue;
            }
            let (found, saw) = channels[id.0 as usize].bag.find_pending();
            contended |= saw;
            match found {
                Some(slot) => picks.push(Claimed::Other(slot)),
                None => return Err(contended),
            }
        }
        drop(channels);

        for (done, &pos) in chord.claim_order.iter().enumerate() {
            let Some(slot) = picks[pos].slot() else {
                continue;
            };
            if slot.try_claim() {
                continue;
            }
            for &prev in &chord.claim_order[..done] {
                if let Some(claimed) = picks[prev].slot() {
                    claimed.rollback();
                }
            }
            return Err(true);
        }
        Ok(picks)
    }

    // ------------------------------------------------------------------
    // Firing
    // ------------------------------------------------------------------

    /// Execute a claimed firing on this thread.
    ///
    /// Used when the matcher is itself a synchronous participant.
    fn fire_inline(
        &self,
        body: &Continuation,
        picks: Vec<Claimed>,
        local: &mut Option<Payload>,
    ) -> SyncOutcome {
        let mut args: Vec<Box<dyn Any + Send>> = Vec::new();
        let mut co: Vec<Arc<SyncEntry>> = Vec::new();
        for pick in picks {
            let payload = match pick {
                Claimed::Local => local.take().expect("local payload claimed once"),
                Claimed::Own(slot) => slot.consume().payload,
                Claimed::Other(slot) => {
                    let msg = slot.consume();
                    if let Some(entry) = msg.sync {
                        co.push(entry);
                    }
                    msg.payload
                }
            };
            if let Payload::Value(value) = payload {
                args.push(value);
            }
        }
        self.shared.stats.chords_fired.fetch_add(1, Ordering::Relaxed);
        let outcome = run_body(body, args);
        distribute(&co, &outcome);
        outcome
    }

    /// Dispatch a claimed firing that this thread will not execute.
    ///
    /// With a synchronous participant, hand the whole job to the first one
    /// and wake it. Otherwise consume everything and spawn the firing.
    fn dispatch(&self, chord: &Chord, picks: Vec<Claimed>) {
        let sync_pos = chord
            .channels
            .iter()
            .position(|&(_, kind)| kind.is_sync());
        if let Some(pos) = sync_pos {
            let slots: Vec<SlotRef> = picks
                .iter()
                .map(|p| p.slot().expect("handoff claims are all published").clone())
                .collect();
            let chosen = slots[pos].clone();
            let entry = chosen
                .peek_sync()
                .expect("synchronous slot carries a sync entry");
            *entry.handoff.lock() = Some(FiringJob {
                body: Arc::clone(&chord.body),
                slots,
            });
            chosen.wake();
            entry.signal.set();
            trace!("handed firing to a blocked sender");
            return;
        }
        let mut args: Vec<Box<dyn Any + Send>> = Vec::new();
        for pick in picks {
            let slot = pick.slot().expect("async claims are all published");
            if let Payload::Value(value) = slot.consume().payload {
                args.push(value);
            }
        }
        self.shared.spawn_firing(Arc::clone(&chord.body), args);
    }

    /// Finish a handed-off firing on the woken sender's thread.
    fn fire_handoff(&self, job: FiringJob, my_slot: &SlotRef) -> SyncOutcome {
        let mut args: Vec<Box<dyn Any + Send>> = Vec::new();
        let mut co: Vec<Arc<SyncEntry>> = Vec::new();
        for slot in &job.slots {
            let msg = if SlotRef::same_slot(slot, my_slot) {
                slot.take_message()
            } else {
                let msg = slot.consume();
                if let Some(entry) = &msg.sync {
                    co.push(Arc::clone(entry));
                }
                msg
            };
            if let Payload::Value(value) = msg.payload {
                args.push(value);
            }
        }
        self.shared.stats.chords_fired.fetch_add(1, Ordering::Relaxed);
        let outcome = run_body(&job.body, args);
        distribute(&co, &outcome);
        outcome
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// One matching pass over `chords`.
    fn resolve_pass(
        &self,
        chords: &[Arc<Chord>],
        own: Option<&OwnMsg>,
        local: &mut Option<Payload>,
        caller_is_sync: bool,
    ) -> Pass {
        let mut contended = false;
        for chord in chords {
            match self.try_claim(chord, own) {
                Err(saw) => contended |= saw,
                Ok(picks) => {
                    let involves_own =
                        picks.iter().any(|p| !matches!(p, Claimed::Other(_)));
                    if caller_is_sync && involves_own {
                        return Pass::Inline(self.fire_inline(&chord.body, picks, local));
                    }
                    self.dispatch(chord, picks);
                    return Pass::Progress;
                }
            }
        }
        if contended {
            Pass::Contended
        } else {
            Pass::Clean
        }
    }

    /// Outcome retrieval once the sender's own slot is terminal.
    fn settled(&self, slot: &SlotRef, entry: &SyncEntry) -> Option<SyncOutcome> {
        match slot.status() {
            WOKEN => {
                let job = entry
                    .handoff
                    .lock()
                    .take()
                    .expect("woken slot carries its firing job");
                Some(self.fire_handoff(job, slot))
            }
            // The slot turns CONSUMED before the firing runs; the outcome
            // arrives separately. Absent means keep waiting.
            CONSUMED => entry.outcome.lock().take(),
            _ => None,
        }
    }
}

fn distribute(co: &[Arc<SyncEntry>], outcome: &SyncOutcome) {
    for entry in co {
        *entry.outcome.lock() = Some(outcome.clone());
        entry.signal.set();
    }
}

impl<S: IdSet> Engine for Scalable<S> {
    fn add_channel(&self, kind: ChannelKind) -> Result<ChannelId, JoinError> {
        let mut channels = self.channels.write();
        if channels.len() >= self.capacity {
            return Err(JoinError::SizeExceeded {
                capacity: self.capacity,
            });
        }
        let id = ChannelId(channels.len() as u32);
        channels.push(Arc::new(ChannelState {
            kind,
            bag: Bag::new(),
            spin: SpinEstimator::new(),
            chords: RwLock::new(Vec::new()),
        }));
        Ok(id)
    }

    fn register(&self, pattern: Pattern, body: Continuation) -> Result<(), JoinError> {
        let mask: S = pattern.mask()?;
        if mask.is_empty() {
            return Err(JoinError::EmptyPattern);
        }
        let ordered = pattern.channels();
        let chord = {
            let channels = self.channels.read();
            let decl: Vec<(ChannelId, ChannelKind)> = ordered
                .iter()
                .map(|&id| (id, channels[id.0 as usize].kind))
                .collect();
            let mut claim_order: Vec<usize> = (0..decl.len()).collect();
            claim_order.sort_by_key(|&pos| decl[pos].0);
            let chord = Arc::new(Chord {
                channels: decl,
                claim_order,
                body,
            });
            for &id in &ordered {
                channels[id.0 as usize].chords.write().push(Arc::clone(&chord));
            }
            chord
        };
        debug!(channels = ?mask, "chord registered");

        // The chord-list writes must be ordered before the scan below, or
        // this scan and a concurrent sender's chord-list read could each
        // miss the other's write.
        fence(Ordering::SeqCst);

        // Already-pending messages may complete the new chord.
        let slice = [chord];
        let mut backoff = Backoff::new();
        loop {
            match self.resolve_pass(&slice, None, &mut None, false) {
                Pass::Progress => backoff.reset(),
                Pass::Contended => backoff.pause(),
                Pass::Clean => break,
                Pass::Inline(_) => unreachable!("no own message at registration"),
            }
        }
        Ok(())
    }

    fn send_async(&self, id: ChannelId, payload: Payload) {
        self.shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        let channel = self.channel(id);
        let slot = channel.bag.publish(Message {
            payload,
            sync: None,
        });
        let own = OwnMsg {
            channel: id,
            slot: Some(slot.clone()),
        };
        // The publish must be ordered before scanning rival bags. Without
        // a full fence, two senders on complementary channels of one chord
        // could each scan before the other's publish lands and both
        // conclude no match exists.
        fence(Ordering::SeqCst);
        let mut backoff = Backoff::new();
        loop {
            if slot.is_settled() {
                return;
            }
            // Re-read per pass so a chord registered after publish still
            // sees this message.
            let chords = channel.chords.read().clone();
            match self.resolve_pass(&chords, Some(&own), &mut None, false) {
                Pass::Progress => backoff.reset(),
                Pass::Contended => {
                    self.shared.stats.claim_retries.fetch_add(1, Ordering::Relaxed);
                    backoff.pause();
                }
                Pass::Clean => return,
                Pass::Inline(_) => unreachable!("asynchronous sends never fire inline"),
            }
        }
    }

    fn send_sync(&self, id: ChannelId, payload: Payload) -> SyncOutcome {
        self.shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        let channel = self.channel(id);
        let chords = channel.chords.read().clone();

        // Fast path: fire against the message before publishing it.
        let mut local = Some(payload);
        let own = OwnMsg {
            channel: id,
            slot: None,
        };
        if let Pass::Inline(outcome) = self.resolve_pass(&chords, Some(&own), &mut local, true)
        {
            return outcome;
        }

        // Slow path: publish with a sync entry and wait to be matched.
        let signal = local_signal();
        let entry = Arc::new(SyncEntry {
            signal: Arc::clone(&signal),
            handoff: Mutex::new(None),
            outcome: Mutex::new(None),
        });
        let slot = channel.bag.publish(Message {
            payload: local.take().expect("fast path left the payload in place"),
            sync: Some(Arc::clone(&entry)),
        });
        let own = OwnMsg {
            channel: id,
            slot: Some(slot.clone()),
        };
        // Same full fence as the asynchronous path: the publish has to be
        // visible to rival scans before this thread's own scan can treat a
        // clean pass as conclusive and park.
        fence(Ordering::SeqCst);
        let mut backoff = Backoff::new();
        loop {
            if let Some(outcome) = self.settled(&slot, &entry) {
                return outcome;
            }
            let chords = channel.chords.read().clone();
            match self.resolve_pass(&chords, Some(&own), &mut None, true) {
                Pass::Inline(outcome) => return outcome,
                Pass::Progress => backoff.reset(),
                Pass::Contended => {
                    self.shared.stats.claim_retries.fetch_add(1, Ordering::Relaxed);
                    backoff.pause();
                }
                Pass::Clean => {
                    let budget = channel.spin.budget();
                    let spins = signal.wait(budget);
                    channel.spin.observe(spins);
                    if spins >= budget {
                        self.shared.stats.sync_parks.fetch_add(1, Ordering::Relaxed);
                    }
                    signal.reset();
                    backoff.reset();
                }
            }
        }
    }
}
