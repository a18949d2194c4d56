// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use metrics::gauge;
use tokio::time::sleep;

use crate::registry::NodeRegistry;
use crate::util::unix_time;

/// Periodically publishes per-node gauges from the registry, so operators
/// can chart fleet progress without scraping the admin page. Only reads
/// the stats view; runs concurrently with the reaper.
pub async fn run(registry: Arc<NodeRegistry>, interval: Duration) {
    info!("metrics poller started interval_secs={}", interval.as_secs());
    loop {
        sleep(interval).await;
        publish(&registry).await;
    }
}

async fn publish(registry: &NodeRegistry) {
    let all_stats = registry.get_all_stats().await;
    let now = unix_time();

    for (fuzzer_id, stats) in &all_stats {
        let id = fuzzer_id.to_string();

        gauge!("fuzzer.execs_per_sec", "fuzzer_id" => id.clone()).set(stats.execs_per_sec);
        gauge!("fuzzer.paths_total", "fuzzer_id" => id.clone()).set(stats.paths_total as f64);

        let secs_since_update = now.saturating_sub(stats.last_update);
        gauge!("fuzzer.secs_since_last_update", "fuzzer_id" => id.clone())
            .set(secs_since_update as f64);

        if stats.last_path > 0 {
            let secs_since_path = stats.last_update.saturating_sub(stats.last_path);
            gauge!("fuzzer.secs_since_last_path", "fuzzer_id" => id).set(secs_since_path as f64);
        }
    }

    info!("published node gauges n_fuzzers={}", all_stats.len());
}
