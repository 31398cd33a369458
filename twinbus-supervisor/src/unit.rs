//! Supervised unit contract and lifecycle states

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a supervised unit
///
/// `Starting -> Active -> (on failure) Restarting -> Active | Corrupted`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Unit is being started for the first time
    Starting,
    /// Unit is running and serving requests
    Active,
    /// Unit failed and is waiting out its backoff delay
    Restarting,
    /// Unit could not determine its identity/configuration at startup;
    /// all requests are answered with an unavailable error until the
    /// unit passivates
    Corrupted,
    /// Unit stopped for good (clean shutdown or corrupted passivation)
    Stopped,
}

impl UnitState {
    /// Whether requests to the unit can currently be served
    pub fn is_available(&self) -> bool {
        matches!(self, UnitState::Active)
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitState::Starting => write!(f, "starting"),
            UnitState::Active => write!(f, "active"),
            UnitState::Restarting => write!(f, "restarting"),
            UnitState::Corrupted => write!(f, "corrupted"),
            UnitState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Handed to each incarnation so it can report that startup recovery is
/// done. The supervisor keeps the unit out of the active state until the
/// incarnation calls [`Readiness::ready`].
#[derive(Debug)]
pub struct Readiness(watch::Sender<bool>);

impl Readiness {
    pub(crate) fn channel() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Readiness(tx), rx)
    }

    /// Mark this incarnation ready to serve
    pub fn ready(&self) {
        let _ = self.0.send(true);
    }
}

/// A long-lived unit of execution managed by the supervisor.
///
/// One call to [`Supervised::run`] is one incarnation of the unit: the
/// future resolves when the incarnation terminates. Returning `Ok(())` is a
/// clean shutdown and ends supervision; returning an error schedules a
/// backoff restart, except for [`crate::SupervisorError::Corrupted`] which
/// moves the unit to the corrupted state.
#[async_trait]
pub trait Supervised: Send + 'static {
    /// Unit name used in log output and supervision events
    fn name(&self) -> &str;

    /// Run one incarnation until it terminates.
    ///
    /// Implementations should observe `shutdown` and return `Ok(())`
    /// promptly when it is cancelled, and call `ready.ready()` once
    /// startup recovery has finished; the unit only counts as active
    /// from that point.
    async fn run(&mut self, shutdown: CancellationToken, ready: Readiness) -> Result<()>;
}

/// Event emitted by the supervisor on unit lifecycle transitions
#[derive(Debug, Clone)]
pub struct SupervisionEvent {
    /// Name of the unit the event concerns
    pub unit: String,
    /// What happened
    pub kind: SupervisionEventKind,
}

/// Kind of supervision event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionEventKind {
    /// Unit entered the active state (first start or restart)
    Started,
    /// An incarnation terminated with an error
    Failed { reason: String },
    /// A restart was scheduled after backoff
    Restarting { delay_ms: u64 },
    /// Unit entered the corrupted state
    Corrupted { reason: String },
    /// Corrupted unit passivated after its timeout
    Passivated,
    /// Unit shut down cleanly
    Stopped,
}
