//! Distributed locking and leader election backed by MongoDB.
//!
//! Two layered primitives share one document collection per deployment:
//!
//! - [`DistLock`]: a mutually-exclusive lease over a named key, held by at
//!   most one process in a cluster and expiring automatically when the
//!   holder goes silent. All expiry math runs on the *store's* clock, so
//!   contenders never have to trust each other's wall clocks.
//! - [`LeaderElector`]: a single-leader election among peers contending for
//!   the same key, built on `DistLock`. A background worker renews the
//!   lease, user callbacks fire on promotion and demotion, and every
//!   instance publishes a status document any peer can aggregate into a
//!   cluster view.
//!
//! The store is treated as an opaque capability ([`CoordinationStore`])
//! providing conditional insert/update/delete, point reads and a server
//! clock; [`MongoStore`] is the production implementation. Logging goes
//! through the [`tracing`] facade: install a subscriber to see it, or
//! don't and the library stays silent.

pub mod distlock;
pub mod elector;
mod error;
pub mod store;

pub use distlock::{AcquireOptions, DistLock, Lease, LockOptions, Touch};
pub use elector::{ElectorBuilder, ElectorState, Hook, LeaderElector};
pub use error::Error;
pub use store::{
    CasOutcome, CoordinationStore, LockDocument, MongoStore, NodeStatusDocument, StoreError,
};
