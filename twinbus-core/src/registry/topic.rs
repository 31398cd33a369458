//! Replicated topic-subscription registry
//!
//! A single maintainer task per node owns the local subscription table and
//! this node's contribution to the replicated shards. Subscriptions are
//! stored as compact hashed digests (one per topic) keyed by a shard
//! derived from the subscriber id, bounding the size of each replicated
//! update. The merged cluster view is published through a watch channel so
//! publishers resolve routes without a network round-trip.

use crate::cluster::{MembershipEvent, NodeId};
use crate::error::{Result, TwinBusError};
use crate::hash::{HashFamily, TopicBucket};
use crate::pubsub::message::Envelope;
use crate::pubsub::subscriber::{SubscriberEvent, SubscriberId, SubscriberRef};
use crate::replication::{
    topic_shard_key, Consistency, RegistryValue, ReplicatedStore, SubscriptionRecord,
    TopicShardState,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twinbus_supervisor::{Readiness, Supervised, SupervisorError, UnitState};

/// Unit name used in logs and supervision events
pub const TOPIC_REGISTRY_UNIT: &str = "topic-registry";

/// Consecutive handle-call timeouts after which the maintainer is
/// presumed wedged and poisoned so supervision restarts it
const TIMEOUT_ESCALATION: u32 = 3;

/// Predicate restricting which messages on a subscribed topic reach a
/// subscriber. Supplied by the embedding application.
#[derive(Clone)]
pub struct TopicFilter(Arc<dyn Fn(&Envelope) -> bool + Send + Sync>);

impl TopicFilter {
    pub fn new(f: impl Fn(&Envelope) -> bool + Send + Sync + 'static) -> Self {
        TopicFilter(Arc::new(f))
    }

    pub fn accepts(&self, envelope: &Envelope) -> bool {
        (self.0)(envelope)
    }
}

impl std::fmt::Debug for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TopicFilter(..)")
    }
}

/// Acknowledgement for a completed subscribe, echoing the accepted set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAck {
    pub subscriber: SubscriberId,
    pub topics: BTreeSet<String>,
    pub group: Option<String>,
}

/// Acknowledgement for a completed unsubscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeAck {
    pub subscriber: SubscriberId,
    pub topics: BTreeSet<String>,
}

/// One subscriber's entry in the merged cluster view
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub node: NodeId,
    pub subscriber: SubscriberId,
    pub digests: Vec<BTreeSet<TopicBucket>>,
    pub group: Option<String>,
}

/// Merged cluster view of all nodes' subscription contributions
#[derive(Debug, Clone, Default)]
pub struct TopicSnapshot {
    pub entries: Vec<SnapshotEntry>,
}

/// One local subscriber's full routing record (exact topics, not hashes)
#[derive(Debug, Clone)]
pub struct LocalRoute {
    pub subscriber: SubscriberRef,
    pub topics: BTreeSet<String>,
    pub group: Option<String>,
    pub filter: Option<TopicFilter>,
}

/// Exact-match routing table for subscribers on this node
#[derive(Debug, Clone, Default)]
pub struct LocalRouteTable {
    pub routes: BTreeMap<SubscriberId, LocalRoute>,
}

enum TopicCommand {
    Subscribe {
        subscriber: SubscriberRef,
        topics: BTreeSet<String>,
        group: Option<String>,
        filter: Option<TopicFilter>,
        reply: oneshot::Sender<Result<SubscribeAck>>,
    },
    Unsubscribe {
        subscriber: SubscriberId,
        topics: BTreeSet<String>,
        reply: oneshot::Sender<Result<UnsubscribeAck>>,
    },
    CurrentSubscribers {
        bucket: TopicBucket,
        reply: oneshot::Sender<BTreeSet<SubscriberId>>,
    },
    SubscriberTerminated {
        subscriber: SubscriberRef,
    },
    NotifyTerminated {
        registry: String,
    },
    Poison {
        reason: String,
    },
}

/// Caller-facing handle to the topic registry maintainer
#[derive(Clone)]
pub struct TopicRegistryHandle {
    cmd: mpsc::Sender<TopicCommand>,
    snapshot: watch::Receiver<TopicSnapshot>,
    routes: watch::Receiver<LocalRouteTable>,
    timeout: Duration,
    state: Option<watch::Receiver<UnitState>>,
    timeouts: Arc<AtomicU32>,
}

impl TopicRegistryHandle {
    /// Attach the supervision state watch so calls fail fast while the
    /// maintainer is down
    pub(crate) fn set_state_watch(&mut self, state: watch::Receiver<UnitState>) {
        self.state = Some(state);
    }

    fn ensure_available(&self) -> Result<()> {
        if let Some(state) = &self.state {
            if !state.borrow().is_available() {
                return Err(TwinBusError::Unavailable(TOPIC_REGISTRY_UNIT.to_string()));
            }
        }
        Ok(())
    }

    /// Count a reply timeout; a maintainer that misses its deadline
    /// several times in a row is poisoned so supervision restarts it
    fn note_timeout(&self) {
        let seen = self.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        if seen >= TIMEOUT_ESCALATION {
            self.timeouts.store(0, Ordering::Relaxed);
            warn!(
                consecutive = seen,
                "topic registry keeps missing command deadlines, escalating to supervision"
            );
            let cmd = self.cmd.clone();
            tokio::spawn(async move {
                let _ = cmd
                    .send(TopicCommand::Poison {
                        reason: "command deadline missed repeatedly".to_string(),
                    })
                    .await;
            });
        }
    }

    async fn call<T>(
        &self,
        cmd: TopicCommand,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.ensure_available()?;
        self.cmd
            .send(cmd)
            .await
            .map_err(|_| TwinBusError::Unavailable(TOPIC_REGISTRY_UNIT.to_string()))?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => {
                self.timeouts.store(0, Ordering::Relaxed);
                result
            }
            Ok(Err(_)) => Err(TwinBusError::Terminated(TOPIC_REGISTRY_UNIT.to_string())),
            Err(_) => {
                self.note_timeout();
                Err(TwinBusError::Timeout(TOPIC_REGISTRY_UNIT.to_string()))
            }
        }
    }

    /// Register (or replace) a subscription for `subscriber`.
    ///
    /// Returns after the local registry is updated and the change is
    /// queued for replication; other nodes observe it eventually.
    pub async fn subscribe(
        &self,
        subscriber: SubscriberRef,
        topics: BTreeSet<String>,
        group: Option<String>,
        filter: Option<TopicFilter>,
    ) -> Result<SubscribeAck> {
        let (tx, rx) = oneshot::channel();
        self.call(
            TopicCommand::Subscribe {
                subscriber,
                topics,
                group,
                filter,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Remove `topics` from the subscriber's subscription set
    pub async fn unsubscribe(
        &self,
        subscriber: SubscriberId,
        topics: BTreeSet<String>,
    ) -> Result<UnsubscribeAck> {
        let (tx, rx) = oneshot::channel();
        self.call(
            TopicCommand::Unsubscribe {
                subscriber,
                topics,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Cluster-wide subscriber ids currently stored under `bucket`
    pub async fn current_subscribers(&self, bucket: TopicBucket) -> Result<BTreeSet<SubscriberId>> {
        self.ensure_available()?;
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(TopicCommand::CurrentSubscribers { bucket, reply: tx })
            .await
            .map_err(|_| TwinBusError::Unavailable(TOPIC_REGISTRY_UNIT.to_string()))?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(set)) => {
                self.timeouts.store(0, Ordering::Relaxed);
                Ok(set)
            }
            Ok(Err(_)) => Err(TwinBusError::Terminated(TOPIC_REGISTRY_UNIT.to_string())),
            Err(_) => {
                self.note_timeout();
                Err(TwinBusError::Timeout(TOPIC_REGISTRY_UNIT.to_string()))
            }
        }
    }

    /// Merged cluster view, updated on every local mutation and remote merge
    pub fn snapshot(&self) -> watch::Receiver<TopicSnapshot> {
        self.snapshot.clone()
    }

    /// Exact-match table for subscribers on this node
    pub fn local_routes(&self) -> watch::Receiver<LocalRouteTable> {
        self.routes.clone()
    }

    /// Tell every local subscriber that a registry it depends on died,
    /// so it can redeclare once the dependency restarts
    pub async fn notify_dependents_terminated(&self, registry: &str) {
        let _ = self
            .cmd
            .send(TopicCommand::NotifyTerminated {
                registry: registry.to_string(),
            })
            .await;
    }

    /// Fault injection: make the maintainer's current incarnation fail.
    /// Used by recovery drills and the integration tests.
    pub async fn poison(&self, reason: &str) {
        let _ = self
            .cmd
            .send(TopicCommand::Poison {
                reason: reason.to_string(),
            })
            .await;
    }
}

struct LocalSubscription {
    subscriber: SubscriberRef,
    topics: BTreeSet<String>,
    group: Option<String>,
    filter: Option<TopicFilter>,
}

/// Maintainer unit; runs under supervision
pub struct TopicRegistryUnit {
    node: NodeId,
    hash: HashFamily,
    shard_count: u32,
    store: Arc<dyn ReplicatedStore>,
    membership: broadcast::Sender<MembershipEvent>,
    cmd_rx: mpsc::Receiver<TopicCommand>,
    cmd_tx: mpsc::Sender<TopicCommand>,
    snapshot_tx: watch::Sender<TopicSnapshot>,
    routes_tx: watch::Sender<LocalRouteTable>,

    local: BTreeMap<SubscriberId, LocalSubscription>,
    merged: HashMap<u32, TopicShardState>,
    departed: BTreeSet<NodeId>,
}

/// Build the maintainer plus its handle.
///
/// The command channel and the published views outlive maintainer
/// incarnations, so the handle stays valid across supervised restarts.
pub fn topic_registry(
    hash: HashFamily,
    shard_count: u32,
    timeout: Duration,
    store: Arc<dyn ReplicatedStore>,
    membership: broadcast::Sender<MembershipEvent>,
) -> (TopicRegistryUnit, TopicRegistryHandle) {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (snapshot_tx, snapshot_rx) = watch::channel(TopicSnapshot::default());
    let (routes_tx, routes_rx) = watch::channel(LocalRouteTable::default());

    let unit = TopicRegistryUnit {
        node: store.node(),
        hash,
        shard_count: shard_count.max(1),
        store,
        membership,
        cmd_rx,
        cmd_tx: cmd_tx.clone(),
        snapshot_tx,
        routes_tx,
        local: BTreeMap::new(),
        merged: HashMap::new(),
        departed: BTreeSet::new(),
    };
    let handle = TopicRegistryHandle {
        cmd: cmd_tx,
        snapshot: snapshot_rx,
        routes: routes_rx,
        timeout,
        state: None,
        timeouts: Arc::new(AtomicU32::new(0)),
    };
    (unit, handle)
}

impl TopicRegistryUnit {
    fn shard_of(&self, subscriber: &SubscriberId) -> u32 {
        (self.hash.digest(subscriber.as_str(), 1)[0] % self.shard_count as u64) as u32
    }

    /// Rebuild registry state from the replication store. Local
    /// subscriptions do not survive a restart; this node's contribution is
    /// reset so dependents can resubscribe from scratch.
    async fn recover(&mut self) -> Result<()> {
        self.local.clear();
        self.merged.clear();
        for shard in 0..self.shard_count {
            let key = topic_shard_key(shard);
            let mut state = match self.store.read(&key, Consistency::Majority).await? {
                Some(RegistryValue::TopicShard(state)) => state,
                _ => TopicShardState::default(),
            };
            state.update_own(&self.node, BTreeMap::new());
            let delta = own_delta(&state, &self.node);
            self.store
                .write(&key, RegistryValue::TopicShard(delta))
                .await?;
            self.merged.insert(shard, state);
        }
        self.publish_views();
        Ok(())
    }

    async fn write_shard(&mut self, shard: u32) -> Result<()> {
        let contribution: BTreeMap<String, SubscriptionRecord> = self
            .local
            .iter()
            .filter(|(id, _)| self.hash.digest(id.as_str(), 1)[0] % self.shard_count as u64
                == shard as u64)
            .map(|(id, sub)| {
                let digests = sub
                    .topics
                    .iter()
                    .map(|t| self.hash.buckets(t))
                    .collect();
                (
                    id.as_str().to_string(),
                    SubscriptionRecord {
                        digests,
                        group: sub.group.clone(),
                    },
                )
            })
            .collect();

        let state = self.merged.entry(shard).or_default();
        state.update_own(&self.node, contribution);
        let delta = own_delta(state, &self.node);
        self.store
            .write(&topic_shard_key(shard), RegistryValue::TopicShard(delta))
            .await?;
        Ok(())
    }

    fn publish_views(&self) {
        let mut entries = Vec::new();
        for state in self.merged.values() {
            for (node, contribution) in &state.nodes {
                if self.departed.contains(node) {
                    continue;
                }
                for (subscriber, record) in &contribution.subscribers {
                    entries.push(SnapshotEntry {
                        node: node.clone(),
                        subscriber: SubscriberId::new(subscriber.clone()),
                        digests: record.digests.clone(),
                        group: record.group.clone(),
                    });
                }
            }
        }
        self.snapshot_tx.send_replace(TopicSnapshot { entries });

        let routes = self
            .local
            .iter()
            .map(|(id, sub)| {
                (
                    id.clone(),
                    LocalRoute {
                        subscriber: sub.subscriber.clone(),
                        topics: sub.topics.clone(),
                        group: sub.group.clone(),
                        filter: sub.filter.clone(),
                    },
                )
            })
            .collect();
        self.routes_tx.send_replace(LocalRouteTable { routes });
    }

    /// Arm a liveness watcher for this exact incarnation of the
    /// subscriber. A re-constructed subscriber under the same id carries
    /// a fresh token and gets its own watcher; the termination handler
    /// matches on the incarnation, so a stale token firing after a
    /// replacement subscription cannot tear the live one down.
    fn watch_liveness(&mut self, subscriber: &SubscriberRef) {
        let already_watched = self
            .local
            .get(subscriber.id())
            .map(|sub| sub.subscriber.same_incarnation(subscriber))
            .unwrap_or(false);
        if already_watched {
            return;
        }
        let token = subscriber.liveness().clone();
        let cmd = self.cmd_tx.clone();
        let fired = subscriber.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            let _ = cmd
                .send(TopicCommand::SubscriberTerminated { subscriber: fired })
                .await;
        });
    }

    async fn handle_subscribe(
        &mut self,
        subscriber: SubscriberRef,
        topics: BTreeSet<String>,
        group: Option<String>,
        filter: Option<TopicFilter>,
    ) -> Result<SubscribeAck> {
        if topics.iter().any(|t| t.is_empty()) {
            return Err(TwinBusError::InvalidTopic(
                "the empty topic is never a valid subscription".to_string(),
            ));
        }
        if topics.is_empty() {
            return Err(TwinBusError::InvalidTopic(
                "a subscription needs at least one topic".to_string(),
            ));
        }

        let id = subscriber.id().clone();
        self.watch_liveness(&subscriber);

        // Re-subscribing replaces the prior topic set, it does not union.
        self.local.insert(
            id.clone(),
            LocalSubscription {
                subscriber,
                topics: topics.clone(),
                group: group.clone(),
                filter,
            },
        );
        let shard = self.shard_of(&id);
        self.write_shard(shard).await?;
        self.publish_views();
        debug!(subscriber = %id, ?topics, ?group, "subscribed");

        Ok(SubscribeAck {
            subscriber: id,
            topics,
            group,
        })
    }

    async fn handle_unsubscribe(
        &mut self,
        subscriber: SubscriberId,
        topics: BTreeSet<String>,
    ) -> Result<UnsubscribeAck> {
        let mut removed_all = false;
        if let Some(sub) = self.local.get_mut(&subscriber) {
            for topic in &topics {
                sub.topics.remove(topic);
            }
            removed_all = sub.topics.is_empty();
        }
        if removed_all {
            self.local.remove(&subscriber);
        }
        let shard = self.shard_of(&subscriber);
        self.write_shard(shard).await?;
        self.publish_views();
        debug!(subscriber = %subscriber, ?topics, "unsubscribed");

        Ok(UnsubscribeAck { subscriber, topics })
    }

    async fn handle_terminated(&mut self, terminated: SubscriberRef) -> Result<()> {
        let id = terminated.id().clone();
        let current = match self.local.get(&id) {
            Some(sub) if sub.subscriber.same_incarnation(&terminated) => true,
            Some(_) => {
                debug!(subscriber = %id, "ignoring termination of a replaced subscriber");
                false
            }
            None => false,
        };
        if current {
            self.local.remove(&id);
            info!(subscriber = %id, "subscriber terminated, unsubscribing");
            let shard = self.shard_of(&id);
            self.write_shard(shard).await?;
            self.publish_views();
        }
        Ok(())
    }

    fn current_subscribers(&self, bucket: TopicBucket) -> BTreeSet<SubscriberId> {
        let mut out = BTreeSet::new();
        for state in self.merged.values() {
            for (node, contribution) in &state.nodes {
                if self.departed.contains(node) {
                    continue;
                }
                for (subscriber, record) in &contribution.subscribers {
                    if record.digests.iter().any(|d| d.contains(&bucket)) {
                        out.insert(SubscriberId::new(subscriber.clone()));
                    }
                }
            }
        }
        out
    }

    async fn absorb_remote(&mut self, key: &str) -> Result<()> {
        for shard in 0..self.shard_count {
            if key == topic_shard_key(shard) {
                if let Some(RegistryValue::TopicShard(remote)) =
                    self.store.read(key, Consistency::Local).await?
                {
                    self.merged.entry(shard).or_default().merge(&remote);
                    self.publish_views();
                }
                return Ok(());
            }
        }
        Ok(())
    }

    fn handle_membership(&mut self, event: MembershipEvent) {
        match event {
            MembershipEvent::NodeDown(node) => {
                info!(%node, "removing departed node's subscriptions");
                self.departed.insert(node.clone());
                for state in self.merged.values_mut() {
                    state.nodes.remove(&node);
                }
                self.publish_views();
            }
            MembershipEvent::NodeUp(node) => {
                self.departed.remove(&node);
            }
        }
    }

    fn notify_dependents(&self, registry: &str) {
        for sub in self.local.values() {
            sub.subscriber.offer(SubscriberEvent::RegistryTerminated {
                registry: registry.to_string(),
            });
        }
    }
}

#[async_trait]
impl Supervised for TopicRegistryUnit {
    fn name(&self) -> &str {
        TOPIC_REGISTRY_UNIT
    }

    async fn run(
        &mut self,
        shutdown: CancellationToken,
        ready: Readiness,
    ) -> twinbus_supervisor::Result<()> {
        let result = self.run_incarnation(shutdown, ready).await;
        if result.is_err() {
            // Every fatal exit wipes local subscriptions on the next
            // recovery, so dependents must hear about it now.
            self.notify_dependents(TOPIC_REGISTRY_UNIT);
        }
        result
    }
}

impl TopicRegistryUnit {
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
        ready.ready();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Ok(()) };
                    match cmd {
                        TopicCommand::Subscribe { subscriber, topics, group, filter, reply } => {
                            let result = self.handle_subscribe(subscriber, topics, group, filter).await;
                            let _ = reply.send(result);
                        }
                        TopicCommand::Unsubscribe { subscriber, topics, reply } => {
                            let result = self.handle_unsubscribe(subscriber, topics).await;
                            let _ = reply.send(result);
                        }
                        TopicCommand::CurrentSubscribers { bucket, reply } => {
                            let _ = reply.send(self.current_subscribers(bucket));
                        }
                        TopicCommand::SubscriberTerminated { subscriber } => {
                            if let Err(err) = self.handle_terminated(subscriber).await {
                                warn!(%err, "failed to clean up terminated subscriber");
                            }
                        }
                        TopicCommand::NotifyTerminated { registry } => {
                            self.notify_dependents(&registry);
                        }
                        TopicCommand::Poison { reason } => {
                            return Err(SupervisorError::Supervisor(reason));
                        }
                    }
                }

                update = updates.recv() => {
                    match update {
                        Ok(update) => {
                            if let Err(err) = self.absorb_remote(&update.key).await {
                                warn!(%err, key = %update.key, "failed to absorb remote update");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "update stream lagged, resyncing all shards");
                            for shard in 0..self.shard_count {
                                let key = topic_shard_key(shard);
                                if let Err(err) = self.absorb_remote(&key).await {
                                    warn!(%err, key, "resync failed");
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(SupervisorError::Supervisor(
                                "replication update stream closed".to_string(),
                            ));
                        }
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

fn own_delta(state: &TopicShardState, node: &NodeId) -> TopicShardState {
    let mut delta = TopicShardState::default();
    if let Some(contribution) = state.nodes.get(node) {
        delta.nodes.insert(node.clone(), contribution.clone());
    }
    delta
}
