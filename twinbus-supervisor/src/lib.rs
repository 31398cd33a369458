//! Twinbus Supervisor - Restart-with-backoff supervision for registry units
//!
//! Keeps long-lived async units (registry maintainers, heartbeat loops)
//! alive across failures. Restarts are scheduled with exponential backoff
//! and jitter; units that cannot determine their own identity at startup
//! enter a corrupted state, answer requests as unavailable, and passivate
//! after a timeout. Every lifecycle transition is published so dependent
//! components can fail fast and re-register once the unit returns.
//!
//! The backoff bookkeeping is an explicit state value threaded through the
//! supervisor loop, not mutable fields scattered across the supervisor.

mod backoff;
mod error;
mod supervisor;
mod unit;

pub use backoff::{BackoffPolicy, BackoffState};
pub use error::{Result, SupervisorError};
pub use supervisor::{SupervisedHandle, SupervisionConfig, Supervisor};
pub use unit::{Readiness, Supervised, SupervisionEvent, SupervisionEventKind, UnitState};
