//! Waiting primitives
//!
//! Shared by both engines: [`Backoff`] paces claim retries, [`Signal`]
//! parks synchronous senders, and [`SpinEstimator`] adapts how long a
//! sender spins before parking.

mod backoff;
mod signal;

pub(crate) use backoff::Backoff;
pub(crate) use signal::{local_signal, Signal, SpinEstimator};
