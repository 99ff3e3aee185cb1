//! Error taxonomy
//!
//! Every error here is raised synchronously to the calling thread at
//! allocation or registration time, never deferred. The only failure that
//! can occur after a chord is registered is a panic inside its continuation
//! at firing time; see the crate docs for how those are delivered.

use thiserror::Error;

/// Errors raised by channel allocation and chord registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum JoinError {
    /// A channel from a different Join was used in a pattern.
    #[error("channel belongs to a different join")]
    ForeignJoin,

    /// The same channel appears more than once in a single chord.
    #[error("channel {0} is joined twice in one chord")]
    RepeatedChannel(u32),

    /// The chord's pattern covers no channels at all.
    #[error("chord pattern joins no channels")]
    EmptyPattern,

    /// The Join's declared channel capacity is exhausted.
    #[error("join capacity of {capacity} channels is exhausted")]
    SizeExceeded {
        /// The capacity the Join was created with.
        capacity: usize,
    },

    /// The requested capacity exceeds the largest supported channel mask.
    #[error("requested capacity {requested} exceeds the supported maximum of {max}")]
    MaxSizeExceeded {
        /// The capacity passed to the factory.
        requested: usize,
        /// The largest capacity any mask composition covers.
        max: usize,
    },

    /// A counting (payload-free asynchronous) channel overflowed its
    /// pending-message counter.
    #[error("counting channel overflowed its pending-message counter")]
    AsyncChannelOverflow,
}

/// Result alias used throughout the crate.
pub type Result<T, E = JoinError> = std::result::Result<T, E>;
