//! Error taxonomy shared by the lock and election layers.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by [`DistLock`](crate::DistLock) and
/// [`LeaderElector`](crate::LeaderElector).
///
/// Discriminated non-error outcomes (a lost lease during renewal, a
/// conditional write that found another owner) are *not* represented here;
/// those are ordinary results carried by [`Touch`](crate::Touch) and the
/// store-level CAS outcomes.
#[derive(Debug, Error)]
pub enum Error {
    /// A non-blocking acquire found the key held by a live lease.
    /// Never retried internally.
    #[error("lock {key:?} is held by another owner")]
    LockExists {
        /// The contended lock key.
        key: String,
    },

    /// A blocking acquire ran past its deadline without winning the key.
    #[error("gave up acquiring lock {key:?} after {waited:?}")]
    AcquireTimeout {
        /// The contended lock key.
        key: String,
        /// How long the acquire loop polled before giving up.
        waited: Duration,
    },

    /// The local wall clock and the store clock disagree by more than the
    /// configured tolerance. Expiry math always uses the store clock, but a
    /// host this far adrift is refused outright rather than auto-retried.
    #[error("local clock is {offset:?} away from the store clock (max allowed {max:?})")]
    ClockOffset {
        /// Absolute difference observed between the two clocks.
        offset: Duration,
        /// The configured tolerance that was exceeded.
        max: Duration,
    },

    /// The store could not be reached or the driver failed mid-call.
    #[error("store unavailable")]
    StoreUnavailable(#[from] StoreError),

    /// Bad construction arguments. Raised at construction, never later.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// [`poll`](crate::LeaderElector::poll) was called while the background
    /// worker is running.
    #[error("manual poll is not available while the background worker is running")]
    ElectorRunning,

    /// The elector has reached its terminal state and cannot be restarted.
    #[error("elector has been stopped")]
    ElectorStopped,
}
