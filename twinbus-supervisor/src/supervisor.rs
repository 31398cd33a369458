//! Restart-with-backoff supervisor loop

use crate::backoff::{BackoffPolicy, BackoffState};
use crate::error::SupervisorError;
use crate::unit::{Readiness, Supervised, SupervisionEvent, SupervisionEventKind, UnitState};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for unit supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionConfig {
    /// Backoff policy applied between restarts
    pub backoff: BackoffPolicy,

    /// How long a corrupted unit lingers before passivating
    #[serde(with = "humantime_serde")]
    pub corrupted_timeout: Duration,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            corrupted_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle to a unit running under supervision
#[derive(Debug)]
pub struct SupervisedHandle {
    name: String,
    state: watch::Receiver<UnitState>,
    shutdown: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl SupervisedHandle {
    /// Unit name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> UnitState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes
    pub fn state_watch(&self) -> watch::Receiver<UnitState> {
        self.state.clone()
    }

    /// Wait until the unit reaches the active state
    pub async fn wait_active(&self) -> crate::error::Result<()> {
        let mut rx = self.state.clone();
        loop {
            match *rx.borrow() {
                UnitState::Active => return Ok(()),
                UnitState::Stopped | UnitState::Corrupted => {
                    return Err(SupervisorError::Unavailable(self.name.clone()))
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(SupervisorError::Unavailable(self.name.clone()));
            }
        }
    }

    /// Request shutdown and wait for the supervision loop to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.join.await;
    }

    /// Request shutdown without waiting
    pub fn abort(&self) {
        self.shutdown.cancel();
    }
}

/// Supervisor for long-lived async units.
///
/// Each spawned unit runs inside its own task; failures are restarted with
/// exponential backoff, corruption passivates after a timeout, and every
/// lifecycle transition is published on a broadcast channel so dependent
/// components can react (e.g. fail fast and resubscribe).
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: SupervisionConfig,
    events: broadcast::Sender<SupervisionEvent>,
}

impl Supervisor {
    /// Create a supervisor with the given configuration
    pub fn new(config: SupervisionConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self { config, events }
    }

    /// Subscribe to supervision events
    pub fn events(&self) -> broadcast::Receiver<SupervisionEvent> {
        self.events.subscribe()
    }

    /// Place a unit under supervision.
    ///
    /// The returned handle reports lifecycle state and can shut the unit
    /// down; dropping the handle does not stop the unit.
    pub fn spawn<U: Supervised>(&self, mut unit: U) -> SupervisedHandle {
        let name = unit.name().to_string();
        let (state_tx, state_rx) = watch::channel(UnitState::Starting);
        let shutdown = CancellationToken::new();
        let loop_shutdown = shutdown.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        let unit_name = name.clone();

        let join = tokio::spawn(async move {
            let mut backoff = BackoffState::new(config.backoff.clone());

            loop {
                let _ = state_tx.send(UnitState::Starting);
                debug!(unit = %unit_name, "starting supervised unit");

                let incarnation =
                    shutdown_guarded(&mut unit, &loop_shutdown, &state_tx, &events, &unit_name)
                        .await;

                match incarnation {
                    Ok(()) => {
                        let _ = state_tx.send(UnitState::Stopped);
                        let _ = events.send(SupervisionEvent {
                            unit: unit_name.clone(),
                            kind: SupervisionEventKind::Stopped,
                        });
                        info!(unit = %unit_name, "supervised unit stopped");
                        return;
                    }
                    Err(SupervisorError::Corrupted(reason)) => {
                        let _ = state_tx.send(UnitState::Corrupted);
                        let _ = events.send(SupervisionEvent {
                            unit: unit_name.clone(),
                            kind: SupervisionEventKind::Corrupted {
                                reason: reason.clone(),
                            },
                        });
                        error!(unit = %unit_name, %reason, "supervised unit corrupted");

                        // Linger answering unavailable, then passivate.
                        tokio::select! {
                            _ = loop_shutdown.cancelled() => {}
                            _ = tokio::time::sleep(config.corrupted_timeout) => {}
                        }
                        let _ = state_tx.send(UnitState::Stopped);
                        let _ = events.send(SupervisionEvent {
                            unit: unit_name.clone(),
                            kind: SupervisionEventKind::Passivated,
                        });
                        warn!(unit = %unit_name, "corrupted unit passivated");
                        return;
                    }
                    Err(err) => {
                        let reason = err.to_string();
                        let _ = events.send(SupervisionEvent {
                            unit: unit_name.clone(),
                            kind: SupervisionEventKind::Failed {
                                reason: reason.clone(),
                            },
                        });
                        warn!(unit = %unit_name, %reason, "supervised unit failed");

                        let delay = backoff.record_failure();
                        let _ = state_tx.send(UnitState::Restarting);
                        let _ = events.send(SupervisionEvent {
                            unit: unit_name.clone(),
                            kind: SupervisionEventKind::Restarting {
                                delay_ms: delay.as_millis() as u64,
                            },
                        });
                        debug!(unit = %unit_name, ?delay, "scheduling restart");

                        tokio::select! {
                            _ = loop_shutdown.cancelled() => {
                                let _ = state_tx.send(UnitState::Stopped);
                                let _ = events.send(SupervisionEvent {
                                    unit: unit_name.clone(),
                                    kind: SupervisionEventKind::Stopped,
                                });
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        });

        SupervisedHandle {
            name,
            state: state_rx,
            shutdown,
            join,
        }
    }
}

/// Run one incarnation, treating external shutdown as a clean stop.
///
/// The unit stays in the starting state until it signals readiness;
/// only then is it marked active and a `Started` event emitted. An
/// incarnation that fails before signalling never flickers active.
async fn shutdown_guarded<U: Supervised>(
    unit: &mut U,
    shutdown: &CancellationToken,
    state_tx: &watch::Sender<UnitState>,
    events: &broadcast::Sender<SupervisionEvent>,
    name: &str,
) -> crate::error::Result<()> {
    let incarnation = CancellationToken::new();
    let child = incarnation.clone();
    let (ready, mut ready_rx) = Readiness::channel();
    let run = unit.run(child, ready);
    tokio::pin!(run);
    let mut announced = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                incarnation.cancel();
                return Ok(());
            }
            res = &mut run => return res,
            changed = ready_rx.changed(), if !announced => {
                announced = true;
                if changed.is_ok() && *ready_rx.borrow() {
                    let _ = state_tx.send(UnitState::Active);
                    let _ = events.send(SupervisionEvent {
                        unit: name.to_string(),
                        kind: SupervisionEventKind::Started,
                    });
                    info!(unit = %name, "supervised unit active");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakyUnit {
        starts: Arc<AtomicUsize>,
        failures_before_success: usize,
    }

    #[async_trait]
    impl Supervised for FlakyUnit {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(
            &mut self,
            shutdown: CancellationToken,
            ready: Readiness,
        ) -> crate::error::Result<()> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(SupervisorError::Supervisor("boom".into()))
            } else {
                ready.ready();
                shutdown.cancelled().await;
                Ok(())
            }
        }
    }

    struct CorruptUnit;

    #[async_trait]
    impl Supervised for CorruptUnit {
        fn name(&self) -> &str {
            "corrupt"
        }

        async fn run(
            &mut self,
            _shutdown: CancellationToken,
            _ready: Readiness,
        ) -> crate::error::Result<()> {
            Err(SupervisorError::Corrupted("no identity".into()))
        }
    }

    struct SlowStartUnit {
        recovery: Duration,
    }

    #[async_trait]
    impl Supervised for SlowStartUnit {
        fn name(&self) -> &str {
            "slow-start"
        }

        async fn run(
            &mut self,
            shutdown: CancellationToken,
            ready: Readiness,
        ) -> crate::error::Result<()> {
            tokio::time::sleep(self.recovery).await;
            ready.ready();
            shutdown.cancelled().await;
            Ok(())
        }
    }

    fn fast_config() -> SupervisionConfig {
        SupervisionConfig {
            backoff: BackoffPolicy::default()
                .with_min_backoff(Duration::from_millis(10))
                .with_max_backoff(Duration::from_millis(40))
                .with_jitter(false),
            corrupted_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_restarts_until_stable() {
        let supervisor = Supervisor::new(fast_config());
        let starts = Arc::new(AtomicUsize::new(0));
        let handle = supervisor.spawn(FlakyUnit {
            starts: starts.clone(),
            failures_before_success: 2,
        });

        handle.wait_active().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.state(), UnitState::Active);
        assert_eq!(starts.load(Ordering::SeqCst), 3);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_events_emitted() {
        let supervisor = Supervisor::new(fast_config());
        let mut events = supervisor.events();
        let starts = Arc::new(AtomicUsize::new(0));
        let handle = supervisor.spawn(FlakyUnit {
            starts,
            failures_before_success: 1,
        });

        let mut saw_failed = false;
        let mut saw_restarting = false;
        for _ in 0..4 {
            match events.recv().await.unwrap().kind {
                SupervisionEventKind::Failed { .. } => saw_failed = true,
                SupervisionEventKind::Restarting { .. } => saw_restarting = true,
                _ => {}
            }
        }
        assert!(saw_failed);
        assert!(saw_restarting);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_corrupted_unit_passivates() {
        let supervisor = Supervisor::new(fast_config());
        let handle = supervisor.spawn(CorruptUnit);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state(), UnitState::Corrupted);
        assert!(!handle.state().is_available());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(handle.state(), UnitState::Stopped);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_active_waits_for_unit_readiness() {
        let supervisor = Supervisor::new(fast_config());
        let handle = supervisor.spawn(SlowStartUnit {
            recovery: Duration::from_millis(150),
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(handle.state(), UnitState::Starting);
        assert!(!handle.state().is_available());

        handle.wait_active().await.unwrap();
        assert_eq!(handle.state(), UnitState::Active);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_incarnation_never_reports_active() {
        let supervisor = Supervisor::new(fast_config());
        let mut states = Vec::new();
        let handle = supervisor.spawn(CorruptUnit);
        let mut watch = handle.state_watch();

        states.push(*watch.borrow());
        while watch.changed().await.is_ok() {
            let state = *watch.borrow();
            states.push(state);
            if state == UnitState::Stopped {
                break;
            }
        }
        assert!(!states.contains(&UnitState::Active), "states: {:?}", states);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_clean_shutdown() {
        let supervisor = Supervisor::new(fast_config());
        let starts = Arc::new(AtomicUsize::new(0));
        let handle = supervisor.spawn(FlakyUnit {
            starts,
            failures_before_success: 0,
        });

        handle.wait_active().await.unwrap();
        handle.shutdown().await;
    }
}
