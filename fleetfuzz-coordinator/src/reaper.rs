// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::info;
use tokio::time::sleep;

use crate::registry::NodeRegistry;

/// How long a worker may stay silent before it is presumed dead. The sweep
/// runs once per TTL, so a dead worker disappears within 2x TTL of its last
/// report.
pub const NODE_TTL: Duration = Duration::from_secs(60 * 60);

/// Periodically evicts silent workers from the registry. Eviction is about
/// bookkeeping only; a reaped worker that reports again is simply
/// re-registered by its next `/state` post.
pub async fn run(registry: Arc<NodeRegistry>, ttl: Duration) {
    info!("reaper started ttl_secs={}", ttl.as_secs());
    loop {
        sleep(ttl).await;
        sweep(&registry, ttl, SystemTime::now()).await;
    }
}

/// One sweep at a given instant, split out so tests can drive the clock.
pub async fn sweep(registry: &NodeRegistry, ttl: Duration, now: SystemTime) {
    for (fuzzer_id, last_contact) in registry.last_contacts().await {
        if last_contact + ttl < now {
            info!("reaping silent fuzzer fuzzer_id={fuzzer_id}");
            registry.delete_node(&fuzzer_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use fleetfuzz::id::FuzzerId;
    use fleetfuzz::stats::FuzzerStats;

    use super::*;

    #[tokio::test]
    async fn test_fresh_node_survives_sweep() {
        let registry = NodeRegistry::new();
        let id = FuzzerId::from("box-0001");
        let reported = SystemTime::now();
        registry
            .set_stats_at(id.clone(), FuzzerStats::default(), reported)
            .await;

        sweep(&registry, NODE_TTL, reported + NODE_TTL / 2).await;

        assert!(registry.get_all_stats().await.contains_key(&id));
    }

    #[tokio::test]
    async fn test_silent_node_is_reaped() {
        let registry = NodeRegistry::new();
        let id = FuzzerId::from("box-0001");
        let reported = SystemTime::now();
        registry
            .set_stats_at(id.clone(), FuzzerStats::default(), reported)
            .await;

        sweep(&registry, NODE_TTL, reported + 2 * NODE_TTL).await;

        assert!(registry.get_all_stats().await.is_empty());
        assert!(registry.last_contacts().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_only_evicts_expired_nodes() {
        let registry = NodeRegistry::new();
        let now = SystemTime::now();
        registry
            .set_stats_at("old".into(), FuzzerStats::default(), now - 2 * NODE_TTL)
            .await;
        registry
            .set_stats_at("fresh".into(), FuzzerStats::default(), now)
            .await;

        sweep(&registry, NODE_TTL, now).await;

        let remaining = registry.get_all_stats().await;
        assert!(remaining.contains_key(&FuzzerId::from("fresh")));
        assert!(!remaining.contains_key(&FuzzerId::from("old")));
    }
}
