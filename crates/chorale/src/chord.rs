//! Chords
//!
//! A chord joins a set of channels to a continuation. The builder collects
//! channels with [`Join::when`](crate::Join::when) / [`ChordBuilder::and`]
//! and registers the chord with [`ChordBuilder::complete`]. Once a message
//! is pending on every joined channel, the engine consumes one message per
//! channel and runs the continuation exactly once with those messages.
//!
//! Continuations receive their payloads through [`Args`], in the order the
//! channels were declared; payload-free channels contribute nothing. A
//! chord joining synchronous channels replies through [`Reply`], and every
//! synchronous co-participant of the firing receives a clone of the reply.

use std::any::Any;
use std::sync::Arc;

use crate::channel::{ChannelDesc, ChannelRef};
use crate::error::JoinError;
use crate::join::JoinCore;
use crate::pattern::Pattern;

// ============================================================================
// Continuation arguments
// ============================================================================

/// The payloads consumed by one firing, in channel declaration order.
///
/// A continuation calls [`take`](Args::take) once per payload-carrying
/// channel it joins, with the channel's payload type. Taking too many
/// values, or asking for the wrong type, panics; since continuations run
/// under a panic boundary this surfaces as a failed firing, not undefined
/// behavior.
pub struct Args {
    values: std::vec::IntoIter<Box<dyn Any + Send>>,
}

impl Args {
    pub(crate) fn new(values: Vec<Box<dyn Any + Send>>) -> Self {
        Self {
            values: values.into_iter(),
        }
    }

    /// Take the next payload, in channel declaration order.
    pub fn take<T: Send + 'static>(&mut self) -> T {
        let value = self
            .values
            .next()
            .unwrap_or_else(|| panic!("chord continuation took more payloads than it joins"));
        match value.downcast::<T>() {
            Ok(value) => *value,
            Err(_) => panic!(
                "chord continuation took a payload as {} but the channel carries another type",
                std::any::type_name::<T>()
            ),
        }
    }

    /// How many payloads remain untaken.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.values.len()
    }
}

impl std::fmt::Debug for Args {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Args")
            .field("remaining", &self.values.len())
            .finish()
    }
}

// ============================================================================
// Continuation results
// ============================================================================

/// A continuation's reply, delivered to every synchronous participant of
/// the firing.
#[derive(Clone)]
pub enum Reply {
    /// No reply value; synchronous participants with result type `()`
    /// unblock with `()`.
    None,
    /// A shared reply value; each synchronous participant receives a clone.
    Value(Arc<dyn Any + Send + Sync>),
}

/// Wrap a value as a chord reply.
pub fn reply<T: Clone + Send + Sync + 'static>(value: T) -> Reply {
    Reply::Value(Arc::new(value))
}

/// Conversion from a continuation's return type into a [`Reply`].
///
/// Implemented for `()` (no reply) and [`Reply`] itself, so purely
/// asynchronous chords can return `()` and replying chords use
/// [`reply`].
pub trait IntoReply {
    /// Convert into the wire reply.
    fn into_reply(self) -> Reply;
}

impl IntoReply for () {
    fn into_reply(self) -> Reply {
        Reply::None
    }
}

impl IntoReply for Reply {
    fn into_reply(self) -> Reply {
        self
    }
}

/// A registered chord body.
pub(crate) type Continuation = Arc<dyn Fn(Args) -> Reply + Send + Sync>;

// ============================================================================
// Builder
// ============================================================================

/// Accumulates a chord's channel pattern before registration.
///
/// Errors found while building (a channel from a foreign Join) are held and
/// reported by [`complete`](ChordBuilder::complete), so the builder chain
/// itself stays infallible.
#[must_use = "a chord does nothing until `complete` registers it"]
pub struct ChordBuilder {
    core: Arc<JoinCore>,
    pattern: Option<Pattern>,
    error: Option<JoinError>,
}

impl ChordBuilder {
    pub(crate) fn start(core: Arc<JoinCore>) -> Self {
        Self {
            core,
            pattern: None,
            error: None,
        }
    }

    fn check(&mut self, desc: ChannelDesc) -> bool {
        if desc.join != self.core.id {
            if self.error.is_none() {
                self.error = Some(JoinError::ForeignJoin);
            }
            return false;
        }
        true
    }

    fn push(&mut self, node: Pattern) {
        self.pattern = Some(match self.pattern.take() {
            None => node,
            Some(p) => p.and(node),
        });
    }

    pub(crate) fn atom(mut self, channel: &dyn ChannelRef) -> Self {
        let desc = channel.descriptor();
        if self.check(desc) {
            self.push(Pattern::Atom(desc.id));
        }
        self
    }

    pub(crate) fn vector(mut self, channels: &[&dyn ChannelRef]) -> Self {
        let descs: Vec<ChannelDesc> = channels.iter().map(|c| c.descriptor()).collect();
        if descs.iter().all(|d| self.check(*d)) {
            self.push(Pattern::Vector(descs.iter().map(|d| d.id).collect()));
        }
        self
    }

    /// Join one more channel into the chord.
    pub fn and(self, channel: &impl ChannelRef) -> Self {
        self.atom(channel)
    }

    /// Join a whole channel array into the chord.
    ///
    /// An empty slice adds nothing; the chord is still valid as long as
    /// some other call contributed a channel.
    pub fn and_all(self, channels: &[&dyn ChannelRef]) -> Self {
        self.vector(channels)
    }

    /// Register the chord with its continuation.
    ///
    /// The continuation runs once per firing, with one consumed message per
    /// joined channel. It may return `()` for no reply, or [`reply`] a
    /// value for the firing's synchronous participants.
    ///
    /// Fails with [`JoinError::ForeignJoin`] if a channel from another Join
    /// was used, [`JoinError::RepeatedChannel`] if a channel was joined
    /// twice, or [`JoinError::EmptyPattern`] if no channels were joined.
    pub fn complete<F, O>(self, body: F) -> Result<(), JoinError>
    where
        F: Fn(Args) -> O + Send + Sync + 'static,
        O: IntoReply,
    {
        if let Some(err) = self.error {
            return Err(err);
        }
        let pattern = self.pattern.ok_or(JoinError::EmptyPattern)?;
        let body: Continuation = Arc::new(move |args| body(args).into_reply());
        self.core.engine.register(pattern, body)
    }
}

impl std::fmt::Debug for ChordBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChordBuilder")
            .field("pattern", &self.pattern)
            .field("error", &self.error)
            .finish()
    }
}
