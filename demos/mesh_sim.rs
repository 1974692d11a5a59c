//! Scripted walk through a three-device mesh.
//!
//! Alice posts while alone, meets Bob, Bob later meets Carol. Carol ends up
//! with Alice's status although the two never met. Run with
//! `RUST_LOG=courier=debug` to watch the dispatchers.

use std::time::Duration;

use anyhow::{Context, Result};
use courier::{ContentId, ContentStore, Node, RegistryConfig, UserId};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

async fn wait_for(node: &Node, id: &ContentId) -> Result<u32> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Some(item)) = node.store().get(id).await {
                return item.hop_count;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("{} never received {}", node.address(), id))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let alice = Node::spawn("alice-phone", RegistryConfig::default());
    let bob = Node::spawn("bob-phone", RegistryConfig::default());
    let carol = Node::spawn("carol-phone", RegistryConfig::default());

    let status = alice
        .post(&UserId::derive("alice", 0), "water point at the north gate #camp")
        .await;
    info!(content = %status, "alice posted");

    Node::connect_pair(&alice, &bob)?;
    let hops = wait_for(&bob, &status).await?;
    info!(hops, "bob received the status");
    alice.disconnect(bob.address())?;
    bob.disconnect(alice.address())?;

    Node::connect_pair(&bob, &carol)?;
    let hops = wait_for(&carol, &status).await?;
    info!(hops, "carol received the status without meeting alice");

    for node in [&alice, &bob, &carol] {
        let snapshot = node.telemetry().await;
        info!(node = %snapshot.address, items = snapshot.items, links = snapshot.links, "final state");
        node.shutdown().await;
    }
    Ok(())
}
