//! Channel handles
//!
//! A channel is a typed endpoint owned by a [`Join`](crate::Join). Its
//! identity is the pair `(owning Join, integer id)`; the id indexes the
//! Join's channel-mask bits. Handles are cheap to clone and immutable after
//! allocation.
//!
//! Four flavors cover the `{async, sync} x {payload, no payload}` grid:
//!
//! - [`AsyncChannel<T>`] — fire-and-forget with a payload.
//! - [`AsyncToken`] — fire-and-forget, no payload (a counting channel).
//! - [`SyncChannel<T, R>`] — sends a payload and blocks for a result.
//! - [`SyncRequest<R>`] — no payload, blocks for a result.
//!
//! Synchronous calls return the firing chord's result, or resume the
//! continuation's panic on the calling thread. Result types must be `Clone`
//! because one firing delivers the same result to every synchronous
//! co-participant of the chord.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::engine::SyncOutcome;
use crate::join::{JoinCore, JoinId};

// ============================================================================
// Identity
// ============================================================================

/// A channel's index within its owning Join, in `[0, capacity)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u32);

impl ChannelId {
    /// The raw index.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({})", self.0)
    }
}

/// Channel flavor, fixed at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelKind {
    AsyncValue,
    AsyncToken,
    SyncValue,
    SyncToken,
}

impl ChannelKind {
    pub(crate) fn is_sync(self) -> bool {
        matches!(self, ChannelKind::SyncValue | ChannelKind::SyncToken)
    }
}

/// One message's payload, tagged rather than boxed-unit so payload-free
/// channels contribute no continuation argument.
pub(crate) enum Payload {
    Unit,
    Value(Box<dyn Any + Send>),
}

/// What the builder needs to know about a handle.
#[doc(hidden)]
#[derive(Clone, Copy)]
pub struct ChannelDesc {
    pub(crate) join: JoinId,
    pub(crate) id: ChannelId,
}

/// A handle usable in chord patterns.
///
/// Implemented by all four channel flavors; not implementable outside this
/// crate.
pub trait ChannelRef {
    /// The channel's index within its owning Join.
    fn id(&self) -> ChannelId;

    #[doc(hidden)]
    fn descriptor(&self) -> ChannelDesc;
}

// ============================================================================
// Asynchronous handles
// ============================================================================

/// An asynchronous channel carrying a payload of type `T`.
///
/// `send` never blocks the caller; the payload is queued until a chord
/// joining this channel can fire.
pub struct AsyncChannel<T> {
    core: Arc<JoinCore>,
    id: ChannelId,
    _payload: PhantomData<fn(T)>,
}

impl<T: Send + 'static> AsyncChannel<T> {
    pub(crate) fn new(core: Arc<JoinCore>, id: ChannelId) -> Self {
        Self {
            core,
            id,
            _payload: PhantomData,
        }
    }

    /// Queue a message. Never blocks.
    pub fn send(&self, value: T) {
        self.core
            .engine
            .send_async(self.id, Payload::Value(Box::new(value)));
    }
}

impl<T> Clone for AsyncChannel<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            id: self.id,
            _payload: PhantomData,
        }
    }
}

impl<T> ChannelRef for AsyncChannel<T> {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn descriptor(&self) -> ChannelDesc {
        ChannelDesc {
            join: self.core.id,
            id: self.id,
        }
    }
}

impl<T> fmt::Debug for AsyncChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncChannel").field("id", &self.id).finish()
    }
}

/// An asynchronous channel with no payload.
///
/// Sends only count; a token contributes no continuation argument. Useful
/// for resource tokens (forks, seats, permits).
#[derive(Clone)]
pub struct AsyncToken {
    core: Arc<JoinCore>,
    id: ChannelId,
}

impl AsyncToken {
    pub(crate) fn new(core: Arc<JoinCore>, id: ChannelId) -> Self {
        Self { core, id }
    }

    /// Queue one token. Never blocks.
    pub fn send(&self) {
        self.core.engine.send_async(self.id, Payload::Unit);
    }
}

impl ChannelRef for AsyncToken {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn descriptor(&self) -> ChannelDesc {
        ChannelDesc {
            join: self.core.id,
            id: self.id,
        }
    }
}

impl fmt::Debug for AsyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncToken").field("id", &self.id).finish()
    }
}

// ============================================================================
// Synchronous handles
// ============================================================================

/// A synchronous channel: sends a payload of type `T` and blocks the caller
/// until a chord joining this channel fires, returning the chord's result.
pub struct SyncChannel<T, R> {
    core: Arc<JoinCore>,
    id: ChannelId,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T, R> SyncChannel<T, R>
where
    T: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(core: Arc<JoinCore>, id: ChannelId) -> Self {
        Self {
            core,
            id,
            _marker: PhantomData,
        }
    }

    /// Send `value` and block until the chord that consumes it fires.
    ///
    /// Returns the continuation's result. If the continuation panicked, the
    /// panic resumes on this thread.
    pub fn call(&self, value: T) -> R {
        recover(
            self.core
                .engine
                .send_sync(self.id, Payload::Value(Box::new(value))),
        )
    }
}

impl<T, R> Clone for SyncChannel<T, R> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T, R> ChannelRef for SyncChannel<T, R> {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn descriptor(&self) -> ChannelDesc {
        ChannelDesc {
            join: self.core.id,
            id: self.id,
        }
    }
}

impl<T, R> fmt::Debug for SyncChannel<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncChannel").field("id", &self.id).finish()
    }
}

/// A synchronous channel with no payload: blocks the caller until a chord
/// joining this channel fires, returning the chord's result.
pub struct SyncRequest<R> {
    core: Arc<JoinCore>,
    id: ChannelId,
    _marker: PhantomData<fn() -> R>,
}

impl<R> SyncRequest<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(core: Arc<JoinCore>, id: ChannelId) -> Self {
        Self {
            core,
            id,
            _marker: PhantomData,
        }
    }

    /// Block until a chord joining this channel fires; return its result.
    ///
    /// If the continuation panicked, the panic resumes on this thread.
    pub fn call(&self) -> R {
        recover(self.core.engine.send_sync(self.id, Payload::Unit))
    }
}

impl<R> Clone for SyncRequest<R> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<R> ChannelRef for SyncRequest<R> {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn descriptor(&self) -> ChannelDesc {
        ChannelDesc {
            join: self.core.id,
            id: self.id,
        }
    }
}

impl<R> fmt::Debug for SyncRequest<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRequest").field("id", &self.id).finish()
    }
}

// ============================================================================
// Result recovery
// ============================================================================

/// Turn a type-erased firing outcome back into the caller's result type.
///
/// A mismatch between a chord's reply and the channel's declared result
/// type is reported as a panic at the call site.
fn recover<R: Clone + Send + Sync + 'static>(outcome: SyncOutcome) -> R {
    match outcome {
        SyncOutcome::Panicked(msg) => std::panic::resume_unwind(Box::new(msg)),
        SyncOutcome::Value(Some(value)) => match value.downcast::<R>() {
            Ok(value) => (*value).clone(),
            Err(_) => panic!(
                "chord continuation replied with a value of the wrong type for {}",
                std::any::type_name::<R>()
            ),
        },
        SyncOutcome::Value(None) => match (&() as &dyn Any).downcast_ref::<R>() {
            Some(unit) => unit.clone(),
            None => panic!(
                "chord continuation replied with no value, but the channel expects {}",
                std::any::type_name::<R>()
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recover_unit_reply() {
        let out = SyncOutcome::Value(None);
        recover::<()>(out);
    }

    #[test]
    fn recover_typed_reply() {
        let out = SyncOutcome::Value(Some(Arc::new(7i32)));
        assert_eq!(recover::<i32>(out), 7);
    }

    #[test]
    #[should_panic(expected = "wrong type")]
    fn recover_mismatched_reply_panics() {
        let out = SyncOutcome::Value(Some(Arc::new("seven".to_string())));
        let _: i32 = recover(out);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn recover_panicked_resumes() {
        let _: i32 = recover(SyncOutcome::Panicked("boom".to_string()));
    }
}
