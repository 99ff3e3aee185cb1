//! Join-calculus coordination for threads.
//!
//! A [`Join`] is a coordination domain: a fixed-capacity set of typed
//! channels plus *chords* joining them. A chord fires when every channel
//! it joins has a pending message; the firing atomically consumes one
//! message per channel and runs the chord's continuation exactly once with
//! those messages. Classic synchronization patterns (rendezvous, barriers,
//! bounded buffers, dining philosophers) fall out as small channel
//! declarations instead of hand-rolled mutex protocols.
//!
//! Channels come in four flavors over the `{async, sync} x {payload, no
//! payload}` grid: [`AsyncChannel`], [`AsyncToken`], [`SyncChannel`], and
//! [`SyncRequest`]. Asynchronous sends never block; synchronous calls
//! block until a firing consumes their message and return the chord's
//! reply.
//!
//! Two interchangeable engines implement matching, selected with
//! [`EngineFlavor`]: a mutex-serialized engine, and a lock-free engine
//! that claims messages optimistically with rollback and scales with
//! sender parallelism.
//!
//! # Example
//!
//! ```
//! use chorale::{reply, EngineFlavor, Join};
//!
//! let join = Join::new(8, EngineFlavor::Scalable)?;
//! let put = join.async_channel::<String>()?;
//! let get = join.sync_request::<String>()?;
//!
//! // `get` rendezvouses with one queued `put`.
//! join.when(&get).and(&put).complete(|mut args| {
//!     let value: String = args.take();
//!     reply(value)
//! })?;
//!
//! put.send("hello".to_string());
//! assert_eq!(get.call(), "hello");
//! # Ok::<(), chorale::JoinError>(())
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod channel;
mod chord;
mod engine;
mod error;
mod executor;
mod join;
mod park;
mod pattern;

pub use channel::{AsyncChannel, AsyncToken, ChannelId, ChannelRef, SyncChannel, SyncRequest};
pub use chord::{reply, Args, ChordBuilder, IntoReply, Reply};
pub use error::{JoinError, Result};
pub use executor::{Executor, InlineExecutor, ThreadExecutor};
pub use join::{
    clear_unhandled_panic_hook, set_unhandled_panic_hook, EngineFlavor, Join, JoinBuilder,
    JoinStats, MAX_CAPACITY,
};
