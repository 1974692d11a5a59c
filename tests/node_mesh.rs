//! Integration tests for the Node facade: content hopping across
//! in-memory links between several nodes.

use std::time::Duration;

use courier::{
    ContentId, ContentStore, DispatchError, Node, RegistryConfig, UserId, SIM_PROTOCOL,
};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const SHORT_TIMEOUT: Duration = Duration::from_millis(300);

fn node(name: &str) -> Node {
    Node::spawn(name, RegistryConfig::default())
}

async fn wait_until_stored(node: &Node, id: &ContentId) -> courier::ContentItem {
    timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(Some(item)) = node.store().get(id).await {
                return item;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("item never arrived")
}

#[tokio::test]
async fn content_hops_across_encounters() {
    let a = node("a");
    let b = node("b");
    let c = node("c");
    let id = a.post(&UserId::derive("amy", 0), "bridge is out #flood").await;

    Node::connect_pair(&a, &b).expect("a-b");
    let at_b = wait_until_stored(&b, &id).await;
    assert_eq!(at_b.hop_count, 1);
    assert!(at_b.is_forwarder("a", SIM_PROTOCOL));

    a.disconnect("b").expect("a-b down");
    b.disconnect("a").expect("b-a down");
    Node::connect_pair(&b, &c).expect("b-c");

    let at_c = wait_until_stored(&c, &id).await;
    assert_eq!(at_c.hop_count, 2);
    assert!(at_c.tags.contains("#flood"));

    for n in [&a, &b, &c] {
        n.shutdown().await;
    }
}

#[tokio::test]
async fn received_content_is_not_echoed_back() {
    let a = node("a");
    let b = node("b");
    let id = a.post(&UserId::derive("amy", 0), "no echo").await;

    Node::connect_pair(&a, &b).expect("pair");
    wait_until_stored(&b, &id).await;
    tokio::time::sleep(SHORT_TIMEOUT).await;

    let at_a = a.store().get(&id).await.unwrap().expect("own copy");
    assert_eq!(at_a.duplicates, 0);
    let b_stats = b
        .registry()
        .dispatcher(&Node::peer_key("a"))
        .expect("bound")
        .telemetry()
        .stats;
    assert_eq!(b_stats.sent, 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn a_peer_is_bound_once() {
    let a = node("a");
    let b = node("b");

    a.connect(&b).expect("first");
    assert!(matches!(a.connect(&b), Err(DispatchError::AlreadyBound(peer)) if peer == "b/courier-sim"));
    assert_eq!(a.registry().bound_peers(), vec![Node::peer_key("b")]);

    a.disconnect("b").expect("down");
    assert!(matches!(a.disconnect("b"), Err(DispatchError::NotBound(_))));
    a.connect(&b).expect("reconnect");
    assert!(a.is_connected_to("b"));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn severed_link_frees_the_peer_key() {
    let a = node("a");
    let b = node("b");
    a.connect(&b).expect("up");
    let dispatcher = a.registry().dispatcher(&Node::peer_key("b")).expect("bound");

    assert!(a.sever("b"));
    a.post(&UserId::derive("amy", 0), "into the void").await;
    timeout(TEST_TIMEOUT, dispatcher.wait_stopped())
        .await
        .expect("self-drained");
    assert!(!a.is_connected_to("b"));

    a.connect(&b).expect("reconnect after loss");
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn telemetry_reports_links_and_items() {
    let a = node("a");
    let b = node("b");
    a.post(&UserId::derive("amy", 0), "one").await;
    a.post(&UserId::derive("amy", 0), "two").await;
    a.connect(&b).expect("up");

    let snapshot = a.telemetry().await;
    assert_eq!(snapshot.address, "a");
    assert_eq!(snapshot.items, 2);
    assert_eq!(snapshot.links, 1);
    assert!(snapshot.registry.started);
    assert_eq!(snapshot.registry.dispatchers.len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}
