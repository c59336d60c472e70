//! Publish a few policy stats objects and stream them back through a
//! label-filtered watcher.
//!
//! Run with `cargo run -p lookout-stats --example watch_stats`.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use lookout_stats::{new_policy_stats_store, PolicyStats, TrafficStats};

fn init_tracing() {
    let env = std::env::var("LOOKOUT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();

    let store = Arc::new(new_policy_stats_store());

    let mut watcher = store.watch_expr(None, "tier=web", "")?;
    let consumer = tokio::spawn(async move {
        while let Some(event) = watcher.recv().await {
            info!(
                kind = ?event.kind,
                name = %event.object.meta.name,
                packets = event.object.traffic.packets,
                bytes = event.object.traffic.bytes,
                "watch event"
            );
        }
        info!("watch channel closed");
    });

    store.create(
        PolicyStats::namespaced("prod", "np-web", TrafficStats::new(10, 1_000, 3))
            .with_labels([("tier", "web")]),
    )?;
    store.create(
        PolicyStats::namespaced("prod", "np-db", TrafficStats::new(4, 800, 1))
            .with_labels([("tier", "db")]),
    )?;

    // Fold in another collection round for the web policy.
    let mut updated = store.get("prod/np-web")?.expect("just created");
    updated.traffic.merge(&TrafficStats::new(5, 640, 2));
    store.update(updated)?;

    // Retiring the policy surfaces a goodbye event to the watcher.
    store.delete("prod/np-web")?;

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    store.stop();
    consumer.await?;
    Ok(())
}
