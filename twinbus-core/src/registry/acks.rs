//! Replicated ack-label ownership registry
//!
//! A label is owned by at most one subscriber cluster-wide. Local declares
//! are checked synchronously against the merged cluster view and against
//! other declares on this node; concurrent declares on different nodes are
//! resolved after replication by a deterministic tie-break, with the loser
//! retracted and notified.

use crate::cluster::{MembershipEvent, NodeId};
use crate::error::{Result, TwinBusError};
use crate::pubsub::subscriber::{SubscriberEvent, SubscriberId, SubscriberRef};
use crate::replication::{
    AckClaim, AckOwnershipState, Consistency, RegistryValue, ReplicatedStore, ACK_REGISTRY_KEY,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twinbus_supervisor::{Readiness, Supervised, SupervisorError, UnitState};
use uuid::Uuid;

/// Unit name used in logs and supervision events
pub const ACK_REGISTRY_UNIT: &str = "ack-registry";

/// Consecutive handle-call timeouts after which the maintainer is
/// presumed wedged and poisoned so supervision restarts it
const TIMEOUT_ESCALATION: u32 = 3;

/// Acknowledgement for a completed declare, echoing the granted labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclareAck {
    pub subscriber: SubscriberId,
    pub labels: BTreeSet<String>,
    pub group: Option<String>,
}

/// One granted label in the local snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckGrant {
    pub subscriber: SubscriberId,
    pub group: Option<String>,
}

/// Labels declared by subscribers on this node, pushed to listeners on
/// every heartbeat
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckSnapshot {
    pub labels: BTreeMap<String, AckGrant>,
}

/// One winning claim in the merged cluster view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAckOwner {
    pub node: NodeId,
    pub subscriber: SubscriberId,
    pub group: Option<String>,
}

/// Merged cluster view of ack-label ownership after tie-breaks
#[derive(Debug, Clone, Default)]
pub struct ClusterAckView {
    pub owners: BTreeMap<String, ClusterAckOwner>,
}

enum AckCommand {
    Declare {
        subscriber: SubscriberRef,
        labels: BTreeSet<String>,
        group: Option<String>,
        reply: oneshot::Sender<Result<DeclareAck>>,
    },
    Undeclare {
        subscriber: SubscriberId,
        reply: oneshot::Sender<Result<()>>,
    },
    DeclarantTerminated {
        subscriber: SubscriberRef,
    },
    AddListener {
        listener: mpsc::Sender<AckSnapshot>,
    },
    NotifyTerminated {
        registry: String,
    },
    Poison {
        reason: String,
    },
}

/// Caller-facing handle to the ack-label registry maintainer
#[derive(Clone)]
pub struct AckRegistryHandle {
    cmd: mpsc::Sender<AckCommand>,
    local: watch::Receiver<AckSnapshot>,
    cluster: watch::Receiver<ClusterAckView>,
    timeout: Duration,
    state: Option<watch::Receiver<UnitState>>,
    timeouts: Arc<AtomicU32>,
}

impl AckRegistryHandle {
    pub(crate) fn set_state_watch(&mut self, state: watch::Receiver<UnitState>) {
        self.state = Some(state);
    }

    fn ensure_available(&self) -> Result<()> {
        if let Some(state) = &self.state {
            if !state.borrow().is_available() {
                return Err(TwinBusError::Unavailable(ACK_REGISTRY_UNIT.to_string()));
            }
        }
        Ok(())
    }

    fn note_timeout(&self) {
        let seen = self.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        if seen >= TIMEOUT_ESCALATION {
            self.timeouts.store(0, Ordering::Relaxed);
            warn!(
                consecutive = seen,
                "ack registry keeps missing command deadlines, escalating to supervision"
            );
            let cmd = self.cmd.clone();
            tokio::spawn(async move {
                let _ = cmd
                    .send(AckCommand::Poison {
                        reason: "command deadline missed repeatedly".to_string(),
                    })
                    .await;
            });
        }
    }

    async fn call<T>(&self, cmd: AckCommand, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.ensure_available()?;
        self.cmd
            .send(cmd)
            .await
            .map_err(|_| TwinBusError::Unavailable(ACK_REGISTRY_UNIT.to_string()))?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => {
                self.timeouts.store(0, Ordering::Relaxed);
                result
            }
            Ok(Err(_)) => Err(TwinBusError::Terminated(ACK_REGISTRY_UNIT.to_string())),
            Err(_) => {
                self.note_timeout();
                Err(TwinBusError::Timeout(ACK_REGISTRY_UNIT.to_string()))
            }
        }
    }

    /// Claim exclusive ownership of `labels` for `subscriber`.
    ///
    /// Fails with [`TwinBusError::Conflict`] if any label is already owned
    /// elsewhere, as far as this node has observed. Concurrent declares on
    /// other nodes may still win the label after replication; the loser
    /// receives [`SubscriberEvent::AckLabelsRevoked`].
    pub async fn declare(
        &self,
        subscriber: SubscriberRef,
        labels: BTreeSet<String>,
        group: Option<String>,
    ) -> Result<DeclareAck> {
        let (tx, rx) = oneshot::channel();
        self.call(
            AckCommand::Declare {
                subscriber,
                labels,
                group,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Release every label owned by `subscriber`
    pub async fn undeclare(&self, subscriber: SubscriberId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.call(
            AckCommand::Undeclare {
                subscriber,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Snapshot of locally declared labels, refreshed every heartbeat
    pub fn local_acks(&self) -> watch::Receiver<AckSnapshot> {
        self.local.clone()
    }

    /// Merged cluster-wide ownership view after tie-breaks
    pub fn cluster_acks(&self) -> watch::Receiver<ClusterAckView> {
        self.cluster.clone()
    }

    /// Register a listener for the per-heartbeat local snapshot push.
    /// Closed listeners are dropped on the next heartbeat.
    pub async fn add_listener(&self, listener: mpsc::Sender<AckSnapshot>) {
        let _ = self.cmd.send(AckCommand::AddListener { listener }).await;
    }

    /// Tell every local declarant that a registry it depends on died
    pub async fn notify_dependents_terminated(&self, registry: &str) {
        let _ = self
            .cmd
            .send(AckCommand::NotifyTerminated {
                registry: registry.to_string(),
            })
            .await;
    }

    /// Fault injection: make the maintainer's current incarnation fail
    pub async fn poison(&self, reason: &str) {
        let _ = self
            .cmd
            .send(AckCommand::Poison {
                reason: reason.to_string(),
            })
            .await;
    }
}

struct OwnClaim {
    claim: AckClaim,
    subscriber: SubscriberRef,
}

/// Maintainer unit; runs under supervision
pub struct AckRegistryUnit {
    node: NodeId,
    heartbeat: Duration,
    store: Arc<dyn ReplicatedStore>,
    membership: broadcast::Sender<MembershipEvent>,
    cmd_rx: mpsc::Receiver<AckCommand>,
    cmd_tx: mpsc::Sender<AckCommand>,
    local_tx: watch::Sender<AckSnapshot>,
    cluster_tx: watch::Sender<ClusterAckView>,

    own: BTreeMap<String, OwnClaim>,
    merged: AckOwnershipState,
    departed: BTreeSet<NodeId>,
    listeners: Vec<mpsc::Sender<AckSnapshot>>,
    // Currently watched incarnation per declarant; a redeclare under the
    // same id by a newer construction replaces the entry
    declarants: HashMap<SubscriberId, SubscriberRef>,
}

/// Build the maintainer plus its handle. The command channel and the
/// published views survive supervised restarts of the unit.
pub fn ack_registry(
    heartbeat: Duration,
    timeout: Duration,
    store: Arc<dyn ReplicatedStore>,
    membership: broadcast::Sender<MembershipEvent>,
) -> (AckRegistryUnit, AckRegistryHandle) {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (local_tx, local_rx) = watch::channel(AckSnapshot::default());
    let (cluster_tx, cluster_rx) = watch::channel(ClusterAckView::default());

    let unit = AckRegistryUnit {
        node: store.node(),
        heartbeat,
        store,
        membership,
        cmd_rx,
        cmd_tx: cmd_tx.clone(),
        local_tx,
        cluster_tx,
        own: BTreeMap::new(),
        merged: AckOwnershipState::default(),
        departed: BTreeSet::new(),
        listeners: Vec::new(),
        declarants: HashMap::new(),
    };
    let handle = AckRegistryHandle {
        cmd: cmd_tx,
        local: local_rx,
        cluster: cluster_rx,
        timeout,
        state: None,
        timeouts: Arc::new(AtomicU32::new(0)),
    };
    (unit, handle)
}

impl AckRegistryUnit {
    /// Rebuild from the replication store. Local declarations do not
    /// survive a restart; this node's contribution is reset so declarants
    /// must redeclare.
    async fn recover(&mut self) -> Result<()> {
        self.own.clear();
        self.declarants.clear();
        let mut merged = match self.store.read(ACK_REGISTRY_KEY, Consistency::Majority).await? {
            Some(RegistryValue::AckOwners(state)) => state,
            _ => AckOwnershipState::default(),
        };
        merged.update_own(&self.node, BTreeMap::new());
        let delta = own_delta(&merged, &self.node);
        self.store
            .write(ACK_REGISTRY_KEY, RegistryValue::AckOwners(delta))
            .await?;
        self.merged = merged;
        self.publish_views();
        Ok(())
    }

    async fn write_own(&mut self) -> Result<()> {
        let claims = self
            .own
            .iter()
            .map(|(label, own)| (label.clone(), own.claim.clone()))
            .collect();
        self.merged.update_own(&self.node, claims);
        let delta = own_delta(&self.merged, &self.node);
        self.store
            .write(ACK_REGISTRY_KEY, RegistryValue::AckOwners(delta))
            .await
    }

    fn local_snapshot(&self) -> AckSnapshot {
        AckSnapshot {
            labels: self
                .own
                .iter()
                .map(|(label, own)| {
                    (
                        label.clone(),
                        AckGrant {
                            subscriber: own.subscriber.id().clone(),
                            group: own.claim.group.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn publish_views(&self) {
        self.local_tx.send_replace(self.local_snapshot());
        let owners = self
            .merged
            .winners(&self.departed)
            .into_iter()
            .map(|(label, (node, claim))| {
                (
                    label,
                    ClusterAckOwner {
                        node,
                        subscriber: SubscriberId::new(claim.subscriber),
                        group: claim.group,
                    },
                )
            })
            .collect();
        self.cluster_tx.send_replace(ClusterAckView { owners });
    }

    /// Arm a liveness watcher for this exact incarnation of the
    /// declarant. A re-constructed declarant under the same id replaces
    /// the watched entry and gets its own watcher; termination of an
    /// already-replaced incarnation is ignored.
    fn watch_liveness(&mut self, subscriber: &SubscriberRef) {
        let already_watched = self
            .declarants
            .get(subscriber.id())
            .map(|current| current.same_incarnation(subscriber))
            .unwrap_or(false);
        if already_watched {
            return;
        }
        self.declarants
            .insert(subscriber.id().clone(), subscriber.clone());
        let token = subscriber.liveness().clone();
        let cmd = self.cmd_tx.clone();
        let fired = subscriber.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            let _ = cmd
                .send(AckCommand::DeclarantTerminated { subscriber: fired })
                .await;
        });
    }

    async fn handle_terminated(&mut self, terminated: SubscriberRef) -> Result<()> {
        let id = terminated.id().clone();
        let current = self
            .declarants
            .get(&id)
            .map(|watched| watched.same_incarnation(&terminated))
            .unwrap_or(false);
        if !current {
            debug!(subscriber = %id, "ignoring termination of a replaced declarant");
            return Ok(());
        }
        self.declarants.remove(&id);
        self.handle_undeclare(id).await
    }

    async fn handle_declare(
        &mut self,
        subscriber: SubscriberRef,
        labels: BTreeSet<String>,
        group: Option<String>,
    ) -> Result<DeclareAck> {
        let id = subscriber.id().clone();

        // First gate: anything already owned in the last merged view, on
        // any node, by anyone else, rejects the whole declare. This also
        // covers a same-window declare on this node, because local commits
        // go straight into the merged state.
        let winners = self.merged.winners(&self.departed);
        let conflicts: Vec<String> = labels
            .iter()
            .filter(|label| {
                winners
                    .get(*label)
                    .map(|(_, claim)| claim.subscriber != id.as_str())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if !conflicts.is_empty() {
            debug!(subscriber = %id, ?conflicts, "declare rejected");
            return Err(TwinBusError::Conflict { labels: conflicts });
        }

        self.watch_liveness(&subscriber);
        for label in &labels {
            // Redeclaring a label you already hold keeps the original
            // proposal so the tie-break outcome never flaps.
            let claim = match self.own.get(label) {
                Some(existing) if existing.claim.subscriber == id.as_str() => AckClaim {
                    subscriber: existing.claim.subscriber.clone(),
                    group: group.clone(),
                    proposal: existing.claim.proposal.clone(),
                },
                _ => AckClaim {
                    subscriber: id.as_str().to_string(),
                    group: group.clone(),
                    proposal: Uuid::new_v4().to_string(),
                },
            };
            self.own.insert(
                label.clone(),
                OwnClaim {
                    claim,
                    subscriber: subscriber.clone(),
                },
            );
        }
        self.write_own().await?;
        self.publish_views();
        info!(subscriber = %id, ?labels, ?group, "ack labels declared");

        Ok(DeclareAck {
            subscriber: id,
            labels,
            group,
        })
    }

    async fn handle_undeclare(&mut self, subscriber: SubscriberId) -> Result<()> {
        let before = self.own.len();
        self.own
            .retain(|_, own| own.subscriber.id() != &subscriber);
        if self.own.len() != before {
            debug!(subscriber = %subscriber, "ack labels released");
            self.write_own().await?;
            self.publish_views();
        }
        Ok(())
    }

    /// After a remote merge, retract any of our claims that lost the
    /// tie-break and tell the declarant after the fact.
    async fn retract_losers(&mut self) -> Result<()> {
        let winners = self.merged.winners(&self.departed);
        let mut lost: BTreeMap<SubscriberId, (SubscriberRef, Vec<String>)> = BTreeMap::new();
        for (label, own) in &self.own {
            let kept = winners
                .get(label)
                .map(|(node, claim)| node == &self.node && claim.proposal == own.claim.proposal)
                .unwrap_or(false);
            if !kept {
                lost.entry(own.subscriber.id().clone())
                    .or_insert_with(|| (own.subscriber.clone(), Vec::new()))
                    .1
                    .push(label.clone());
            }
        }
        if lost.is_empty() {
            return Ok(());
        }
        for (subscriber, (sink, labels)) in lost {
            warn!(%subscriber, ?labels, "ack labels lost to a concurrent declare");
            for label in &labels {
                self.own.remove(label);
            }
            sink.offer(SubscriberEvent::AckLabelsRevoked { labels });
        }
        self.write_own().await
    }

    async fn absorb_remote(&mut self) -> Result<()> {
        if let Some(RegistryValue::AckOwners(remote)) =
            self.store.read(ACK_REGISTRY_KEY, Consistency::Local).await?
        {
            self.merged.merge(&remote);
            self.retract_losers().await?;
            self.publish_views();
        }
        Ok(())
    }

    /// Heartbeat: prune dead declarants and push the local snapshot
    async fn heartbeat_tick(&mut self) -> Result<()> {
        let dead: Vec<String> = self
            .own
            .iter()
            .filter(|(_, own)| !own.subscriber.is_live())
            .map(|(label, _)| label.clone())
            .collect();
        if !dead.is_empty() {
            info!(labels = ?dead, "pruning ack labels of dead declarants");
            for label in &dead {
                self.own.remove(label);
            }
            self.write_own().await?;
        }
        self.declarants.retain(|_, subscriber| subscriber.is_live());
        self.publish_views();

        let snapshot = self.local_snapshot();
        self.listeners.retain(|listener| {
            if listener.is_closed() {
                return false;
            }
            let _ = listener.try_send(snapshot.clone());
            true
        });
        Ok(())
    }

    fn handle_membership(&mut self, event: MembershipEvent) {
        match event {
            MembershipEvent::NodeDown(node) => {
                info!(%node, "removing departed node's ack claims");
                self.departed.insert(node.clone());
                self.merged.nodes.remove(&node);
                self.publish_views();
            }
            MembershipEvent::NodeUp(node) => {
                self.departed.remove(&node);
            }
        }
    }

    fn notify_dependents(&self, registry: &str) {
        let mut seen = HashSet::new();
        for own in self.own.values() {
            if seen.insert(own.subscriber.id().clone()) {
                own.subscriber.offer(SubscriberEvent::RegistryTerminated {
                    registry: registry.to_string(),
                });
            }
        }
    }
}

#[async_trait]
impl Supervised for AckRegistryUnit {
    fn name(&self) -> &str {
        ACK_REGISTRY_UNIT
    }

    async fn run(
        &mut self,
        shutdown: CancellationToken,
        ready: Readiness,
    ) -> twinbus_supervisor::Result<()> {
        let result = self.run_incarnation(shutdown, ready).await;
        if result.is_err() {
            // Every fatal exit wipes local declarations on the next
            // recovery, so declarants must hear about it now.
            self.notify_dependents(ACK_REGISTRY_UNIT);
        }
        result
    }
}

impl AckRegistryUnit {
    async fn run_incarnation(
        &mut self,
        shutdown: CancellationToken,
        ready: Readiness,
    ) -> twinbus_supervisor::Result<()> {
        if self.node.as_str().is_empty() {
            return Err(SupervisorError::Corrupted(
                "node identity is not configured".to_string(),
            ));
        }

        self.recover()
            .await
            .map_err(|e| SupervisorError::Supervisor(e.to_string()))?;

        let mut updates = self.store.updates();
        let mut membership = self.membership.subscribe();
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ready.ready();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Ok(()) };
                    match cmd {
                        AckCommand::Declare { subscriber, labels, group, reply } => {
                            let result = self.handle_declare(subscriber, labels, group).await;
                            let _ = reply.send(result);
                        }
                        AckCommand::Undeclare { subscriber, reply } => {
                            let result = self.handle_undeclare(subscriber).await;
                            let _ = reply.send(result);
                        }
                        AckCommand::DeclarantTerminated { subscriber } => {
                            if let Err(err) = self.handle_terminated(subscriber).await {
                                warn!(%err, "failed to clean up terminated declarant");
                            }
                        }
                        AckCommand::AddListener { listener } => {
                            let _ = listener.try_send(self.local_snapshot());
                            self.listeners.push(listener);
                        }
                        AckCommand::NotifyTerminated { registry } => {
                            self.notify_dependents(&registry);
                        }
                        AckCommand::Poison { reason } => {
                            return Err(SupervisorError::Supervisor(reason));
                        }
                    }
                }

                update = updates.recv() => {
                    match update {
                        Ok(update) if update.key == ACK_REGISTRY_KEY => {
                            if let Err(err) = self.absorb_remote().await {
                                warn!(%err, "failed to absorb remote ack update");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "update stream lagged, resyncing ack registry");
                            if let Err(err) = self.absorb_remote().await {
                                warn!(%err, "resync failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(SupervisorError::Supervisor(
                                "replication update stream closed".to_string(),
                            ));
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(err) = self.heartbeat_tick().await {
                        warn!(%err, "heartbeat maintenance failed");
                    }
                }

                event = membership.recv() => {
                    if let Ok(event) = event {
                        self.handle_membership(event);
                    }
                }
            }
        }
    }
}

fn own_delta(state: &AckOwnershipState, node: &NodeId) -> AckOwnershipState {
    let mut delta = AckOwnershipState::default();
    if let Some(contribution) = state.nodes.get(node) {
        delta.nodes.insert(node.clone(), contribution.clone());
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::InMemoryStore;

    #[tokio::test]
    async fn test_repeated_declare_timeouts_poison_the_maintainer() {
        // Nothing drains the command channel, so every call times out.
        let store = Arc::new(InMemoryStore::standalone(NodeId::new("node-1")));
        let (membership, _) = broadcast::channel(8);
        let (mut unit, handle) = ack_registry(
            Duration::from_millis(100),
            Duration::from_millis(10),
            store,
            membership,
        );

        let (s, _rx) = SubscriberRef::channel("s1", 4);
        for _ in 0..TIMEOUT_ESCALATION {
            let result = handle
                .declare(s.clone(), BTreeSet::from(["lorem".to_string()]), None)
                .await;
            assert!(matches!(result, Err(TwinBusError::Timeout(_))));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut poisoned = false;
        while let Ok(cmd) = unit.cmd_rx.try_recv() {
            if matches!(cmd, AckCommand::Poison { .. }) {
                poisoned = true;
            }
        }
        assert!(poisoned, "expected a poison command after repeated timeouts");
    }
}
