//! Lock-free message bags
//!
//! Each channel in the scalable engine owns a bag: an append-only chain of
//! fixed-size segments of slots. Publishing reserves a global index with a
//! fetch-add, writes the message into that slot, and flips the slot status
//! to `PENDING` with release ordering. Matching never removes slots;
//! consumption is a status transition, and a low-water mark skips the
//! fully consumed prefix on later scans.
//!
//! Slot status is the claim protocol's ground truth:
//!
//! ```text
//! EMPTY -> PENDING -> CLAIMED -> CONSUMED
//!                  \-> (rollback to PENDING)
//!                 CLAIMED -> WOKEN   (sync handoff, terminal)
//! ```
//!
//! `CLAIMED` is tentative: a matcher that cannot complete its claim set
//! rolls every claimed slot back to `PENDING`. `CONSUMED` and `WOKEN` are
//! terminal.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, RwLock};

use super::scalable::{Message, SyncEntry};

pub(crate) const EMPTY: u8 = 0;
pub(crate) const PENDING: u8 = 1;
pub(crate) const CLAIMED: u8 = 2;
pub(crate) const CONSUMED: u8 = 3;
pub(crate) const WOKEN: u8 = 4;

const SEG_SIZE: u64 = 32;

// ============================================================================
// Slots and segments
// ============================================================================

pub(crate) struct Slot {
    status: AtomicU8,
    /// Written before the status turns `PENDING`, taken by the consumer.
    /// Uncontended in practice; the mutex keeps the slot free of unsafe
    /// code.
    cell: Mutex<Option<Message>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(EMPTY),
            cell: Mutex::new(None),
        }
    }
}

pub(crate) struct Segment {
    /// Global index of `slots[0]`.
    base: u64,
    slots: Vec<Slot>,
    next: OnceLock<Arc<Segment>>,
}

impl Segment {
    fn new(base: u64) -> Arc<Self> {
        Arc::new(Self {
            base,
            slots: (0..SEG_SIZE).map(|_| Slot::new()).collect(),
            next: OnceLock::new(),
        })
    }

    fn next_or_grow(self: &Arc<Self>) -> Arc<Segment> {
        Arc::clone(
            self.next
                .get_or_init(|| Segment::new(self.base + SEG_SIZE)),
        )
    }
}

/// A stable reference to one published slot.
#[derive(Clone)]
pub(crate) struct SlotRef {
    seg: Arc<Segment>,
    idx: usize,
}

impl SlotRef {
    fn slot(&self) -> &Slot {
        &self.seg.slots[self.idx]
    }

    pub(crate) fn status(&self) -> u8 {
        self.slot().status.load(Ordering::Acquire)
    }

    /// Tentatively claim a pending message.
    pub(crate) fn try_claim(&self) -> bool {
        self.slot()
            .status
            .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undo a tentative claim.
    pub(crate) fn rollback(&self) {
        self.slot().status.store(PENDING, Ordering::Release);
    }

    /// Finalize a claim, taking the message out.
    pub(crate) fn consume(&self) -> Message {
        let msg = self
            .slot()
            .cell
            .lock()
            .take()
            .expect("claimed slot holds its message");
        self.slot().status.store(CONSUMED, Ordering::Release);
        msg
    }

    /// Take the message without touching the status.
    ///
    /// Used by a woken sender collecting its own payload from a slot that
    /// is already terminal.
    pub(crate) fn take_message(&self) -> Message {
        self.slot()
            .cell
            .lock()
            .take()
            .expect("terminal slot still holds its message")
    }

    /// The sync entry of the message, if the slot still holds one.
    pub(crate) fn peek_sync(&self) -> Option<Arc<SyncEntry>> {
        self.slot().cell.lock().as_ref().and_then(|m| m.sync.clone())
    }

    /// Finalize a claim by handing the firing to the blocked sender.
    ///
    /// The message stays where the sender can read its own sync entry; the
    /// slot is terminal either way.
    pub(crate) fn wake(&self) {
        self.slot().status.store(WOKEN, Ordering::Release);
    }

    /// Whether the slot reached a terminal status.
    pub(crate) fn is_settled(&self) -> bool {
        matches!(self.status(), CONSUMED | WOKEN)
    }

    pub(crate) fn same_slot(a: &SlotRef, b: &SlotRef) -> bool {
        Arc::ptr_eq(&a.seg, &b.seg) && a.idx == b.idx
    }
}

// ============================================================================
// Bag
// ============================================================================

/// One channel's pending messages.
pub(crate) struct Bag {
    head: Arc<Segment>,
    /// Hint to the newest segment; scans re-derive correctness from slot
    /// statuses, so staleness is only a performance matter.
    tail: RwLock<Arc<Segment>>,
    /// Next index to publish into.
    reserve: CachePadded<AtomicU64>,
    /// All slots below this index are terminal.
    low: CachePadded<AtomicU64>,
}

impl Bag {
    pub(crate) fn new() -> Self {
        let head = Segment::new(0);
        Self {
            tail: RwLock::new(Arc::clone(&head)),
            head,
            reserve: CachePadded::new(AtomicU64::new(0)),
            low: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Walk to the segment containing `index`, growing the chain as
    /// needed.
    fn segment_for(&self, index: u64) -> Arc<Segment> {
        let hint = self.tail.read().clone();
        let mut seg = if hint.base <= index {
            hint
        } else {
            Arc::clone(&self.head)
        };
        while index >= seg.base + SEG_SIZE {
            seg = seg.next_or_grow();
        }
        seg
    }

    /// Publish a message; it becomes visible to matchers on return.
    pub(crate) fn publish(&self, msg: Message) -> SlotRef {
        let index = self.reserve.fetch_add(1, Ordering::Relaxed);
        let seg = self.segment_for(index);
        let slot_ref = SlotRef {
            idx: (index - seg.base) as usize,
            seg,
        };
        *slot_ref.slot().cell.lock() = Some(msg);
        slot_ref.slot().status.store(PENDING, Ordering::Release);
        // Only the first publish into a segment can move the hint, so the
        // common path never touches the lock.
        if slot_ref.idx == 0 {
            let mut tail = self.tail.write();
            if slot_ref.seg.base > tail.base {
                *tail = Arc::clone(&slot_ref.seg);
            }
        }
        slot_ref
    }

    /// Find the oldest pending message.
    ///
    /// Returns the slot (if any) and whether the scan passed a slot some
    /// other matcher holds claimed or is still publishing; the caller uses
    /// that as its contention signal.
    pub(crate) fn find_pending(&self) -> (Option<SlotRef>, bool) {
        let mut index = self.low.load(Ordering::Acquire);
        let limit = self.reserve.load(Ordering::Acquire);
        let mut contended = false;
        let mut seg = self.segment_for(index.min(limit.saturating_sub(1)));
        while index < limit {
            while index >= seg.base + SEG_SIZE {
                seg = seg.next_or_grow();
            }
            let slot = &seg.slots[(index - seg.base) as usize];
            match slot.status.load(Ordering::Acquire) {
                PENDING => {
                    return (
                        Some(SlotRef {
                            seg: Arc::clone(&seg),
                            idx: (index - seg.base) as usize,
                        }),
                        contended,
                    );
                }
                CONSUMED | WOKEN => {
                    // Advance the low-water mark past a terminal prefix.
                    let _ = self.low.compare_exchange(
                        index,
                        index + 1,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                }
                // EMPTY below the reserve line is a publish in flight;
                // CLAIMED is a rival matcher. Either way the message may
                // reappear, so the caller must not conclude "no match".
                _ => contended = true,
            }
            index += 1;
        }
        (None, contended)
    }
}
