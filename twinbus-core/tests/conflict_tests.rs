//! Ack-label ownership: local conflicts, cross-node arbitration after
//! delayed replication, and weak-acknowledgement synthesis

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use twinbus_core::config::TwinBusConfig;
use twinbus_core::prelude::*;

fn config(name: &str) -> TwinBusConfig {
    let mut config = TwinBusConfig::default();
    config.node.name = name.to_string();
    config.replication.heartbeat_interval = Duration::from_millis(50);
    config
}

async fn node(hub: &GossipHub, mesh: &Arc<InProcessMesh>, name: &str) -> PubSubService {
    let store = Arc::new(hub.join(NodeId::new(name)));
    let service = PubSubServiceBuilder::new(config(name), store)
        .with_remote_delivery(mesh.clone())
        .build()
        .unwrap();
    let publisher = service.publisher();
    mesh.register(NodeId::new(name), &publisher);
    service.started().await.unwrap();
    service
}

async fn single_node() -> PubSubService {
    node(&GossipHub::new(), &InProcessMesh::new(), "node-1").await
}

fn labels(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|l| l.to_string()).collect()
}

fn topics(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|t| t.to_string()).collect()
}

async fn wait_owner(service: &PubSubService, label: &str, owner: Option<&str>) {
    let rx = service.ack_registry().cluster_acks();
    for _ in 0..200 {
        {
            let view = rx.borrow();
            let current = view.owners.get(label).map(|o| o.subscriber.as_str());
            if current == owner {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("label {:?} never reached owner {:?}", label, owner);
}

#[tokio::test]
async fn test_second_local_declare_conflicts() {
    let service = single_node().await;

    let (s1, _rx1) = service.subscriber("s1");
    s1.declare_acks(labels(&["lorem", "ipsum"]), None)
        .await
        .unwrap();

    let (s2, _rx2) = service.subscriber("s2");
    let err = s2.declare_acks(labels(&["ipsum"]), None).await.unwrap_err();
    match err {
        TwinBusError::Conflict { labels } => assert_eq!(labels, vec!["ipsum".to_string()]),
        other => panic!("expected conflict, got {:?}", other),
    }

    service.shutdown().await;
}

#[tokio::test]
async fn test_redeclare_is_idempotent() {
    let service = single_node().await;
    let (s1, _rx) = service.subscriber("s1");
    s1.declare_acks(labels(&["lorem"]), None).await.unwrap();
    s1.declare_acks(labels(&["lorem"]), None).await.unwrap();
    service.shutdown().await;
}

#[tokio::test]
async fn test_undeclare_frees_labels() {
    let service = single_node().await;

    let (s1, _rx1) = service.subscriber("s1");
    s1.declare_acks(labels(&["lorem"]), None).await.unwrap();
    s1.undeclare_acks().await.unwrap();

    let (s2, _rx2) = service.subscriber("s2");
    s2.declare_acks(labels(&["lorem"]), None).await.unwrap();

    service.shutdown().await;
}

#[tokio::test]
async fn test_cross_node_conflict_resolved_after_merge() {
    let hub = GossipHub::new();
    let mesh = InProcessMesh::new();
    let a = node(&hub, &mesh, "node-a").await;
    let b = node(&hub, &mesh, "node-b").await;

    // Hold replication back so both declares pass their local checks.
    hub.pause();
    let (s1, _rx1) = a.subscriber("s1");
    s1.declare_acks(labels(&["lorem", "ipsum"]), None)
        .await
        .unwrap();
    let (s2, mut rx2) = b.subscriber("s2");
    s2.declare_acks(labels(&["ipsum", "dolor"]), None)
        .await
        .unwrap();
    hub.resume();

    // Deterministic tie-break: s1 sorts before s2, so s1 keeps "ipsum".
    wait_owner(&a, "ipsum", Some("s1")).await;
    wait_owner(&b, "ipsum", Some("s1")).await;
    wait_owner(&a, "lorem", Some("s1")).await;
    wait_owner(&b, "dolor", Some("s2")).await;

    // The loser hears about it after the fact.
    let mut revoked = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx2.recv()).await {
            Ok(Some(SubscriberEvent::AckLabelsRevoked { labels })) => {
                revoked = labels;
                break;
            }
            Ok(Some(_)) => continue,
            other => panic!("expected revocation, got {:?}", other),
        }
    }
    assert_eq!(revoked, vec!["ipsum".to_string()]);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_replicated_label_blocks_remote_declare() {
    let hub = GossipHub::new();
    let mesh = InProcessMesh::new();
    let a = node(&hub, &mesh, "node-a").await;
    let b = node(&hub, &mesh, "node-b").await;

    let (s1, _rx1) = a.subscriber("s1");
    s1.declare_acks(labels(&["lorem"]), None).await.unwrap();
    wait_owner(&b, "lorem", Some("s1")).await;

    let (s2, _rx2) = b.subscriber("s2");
    let err = s2.declare_acks(labels(&["lorem"]), None).await.unwrap_err();
    assert!(matches!(err, TwinBusError::Conflict { .. }));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_weak_ack_for_unowned_label() {
    let service = single_node().await;

    let (publisher_side, mut prx) = service.subscriber("pub");
    let envelope = Envelope::new(json!({}))
        .with_header("topics", "hello")
        .with_entity_id("twin-1")
        .requesting_ack("nobody-owns-this");
    let receipt = service
        .publisher()
        .publish(envelope, None, publisher_side.subscriber())
        .await
        .unwrap();
    assert_eq!(receipt.weak_acks, 1);

    match tokio::time::timeout(Duration::from_secs(1), prx.recv())
        .await
        .unwrap()
        .unwrap()
    {
        SubscriberEvent::Ack(ack) => {
            assert!(ack.weak);
            assert_eq!(ack.label, "nobody-owns-this");
            assert_eq!(ack.entity_id.as_deref(), Some("twin-1"));
        }
        other => panic!("expected an ack, got {:?}", other),
    }

    service.shutdown().await;
}

#[tokio::test]
async fn test_no_weak_ack_when_owner_is_targeted() {
    let service = single_node().await;

    let (owner, mut owner_rx) = service.subscriber("owner");
    owner.subscribe(topics(&["hello"])).await.unwrap();
    owner.declare_acks(labels(&["lorem"]), None).await.unwrap();
    wait_owner(&service, "lorem", Some("owner")).await;

    // The sender subscribes too so the real ack can route back to it.
    let (publisher_side, mut prx) = service.subscriber("pub");
    publisher_side.subscribe(topics(&["replies"])).await.unwrap();

    let publisher = service.publisher();
    let envelope = Envelope::new(json!({}))
        .with_header("topics", "hello")
        .requesting_ack("lorem");
    let receipt = publisher
        .publish(envelope, None, publisher_side.subscriber())
        .await
        .unwrap();
    assert_eq!(receipt.weak_acks, 0);
    assert_eq!(receipt.delivered_local, 1);

    // The owner acknowledges for real.
    let delivery = match owner_rx.recv().await.unwrap() {
        SubscriberEvent::Message(delivery) => delivery,
        other => panic!("expected delivery, got {:?}", other),
    };
    publisher
        .acknowledge(
            &delivery,
            Acknowledgement {
                label: "lorem".to_string(),
                entity_id: delivery.envelope.entity_id.clone(),
                headers: Default::default(),
                weak: false,
            },
        )
        .await
        .unwrap();

    match tokio::time::timeout(Duration::from_secs(1), prx.recv())
        .await
        .unwrap()
        .unwrap()
    {
        SubscriberEvent::Ack(ack) => {
            assert!(!ack.weak);
            assert_eq!(ack.label, "lorem");
        }
        other => panic!("expected an ack, got {:?}", other),
    }

    service.shutdown().await;
}

#[tokio::test]
async fn test_weak_ack_when_owner_not_among_targets() {
    let service = single_node().await;

    // Owner of the label is not subscribed to the published topic.
    let (owner, _owner_rx) = service.subscriber("owner");
    owner.declare_acks(labels(&["lorem"]), None).await.unwrap();
    wait_owner(&service, "lorem", Some("owner")).await;

    let (publisher_side, mut prx) = service.subscriber("pub");
    let receipt = service
        .publisher()
        .publish(
            Envelope::new(json!({}))
                .with_header("topics", "hello")
                .requesting_ack("lorem"),
            None,
            publisher_side.subscriber(),
        )
        .await
        .unwrap();
    assert_eq!(receipt.weak_acks, 1);

    match tokio::time::timeout(Duration::from_secs(1), prx.recv())
        .await
        .unwrap()
        .unwrap()
    {
        SubscriberEvent::Ack(ack) => assert!(ack.weak),
        other => panic!("expected an ack, got {:?}", other),
    }

    service.shutdown().await;
}

#[tokio::test]
async fn test_terminated_declarant_releases_labels() {
    let service = single_node().await;

    let (s1, _rx1) = service.subscriber("s1");
    s1.declare_acks(labels(&["lorem"]), None).await.unwrap();
    wait_owner(&service, "lorem", Some("s1")).await;

    s1.terminate();
    wait_owner(&service, "lorem", None).await;

    let (s2, _rx2) = service.subscriber("s2");
    s2.declare_acks(labels(&["lorem"]), None).await.unwrap();

    service.shutdown().await;
}

#[tokio::test]
async fn test_replaced_declarant_survives_old_incarnation_terminating() {
    let service = single_node().await;

    let (first, _rx1) = service.subscriber("s1");
    first.declare_acks(labels(&["lorem"]), None).await.unwrap();
    wait_owner(&service, "lorem", Some("s1")).await;

    // Same id, new construction: redeclares and takes over the label.
    let (second, _rx2) = service.subscriber("s1");
    second.declare_acks(labels(&["lorem"]), None).await.unwrap();

    // The old construction going away must not release the label the
    // replacement now holds.
    first.terminate();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let view = service.ack_registry().cluster_acks();
    assert_eq!(
        view.borrow()
            .owners
            .get("lorem")
            .map(|o| o.subscriber.as_str()),
        Some("s1")
    );

    // Termination of the current construction does release it.
    second.terminate();
    wait_owner(&service, "lorem", None).await;

    service.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_pushes_local_snapshot() {
    let service = single_node().await;

    let (s1, _rx1) = service.subscriber("s1");
    s1.declare_acks(labels(&["lorem", "ipsum"]), None)
        .await
        .unwrap();

    let (tx, mut listener) = mpsc::channel(16);
    service.add_ack_listener(tx).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = tokio::time::timeout_at(deadline, listener.recv())
            .await
            .expect("no heartbeat snapshot")
            .expect("listener closed");
        if snapshot.labels.len() == 2 {
            assert_eq!(
                snapshot.labels["lorem"].subscriber,
                SubscriberId::new("s1")
            );
            break;
        }
    }

    service.shutdown().await;
}
