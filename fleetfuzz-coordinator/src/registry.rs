// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::time::SystemTime;

use fleetfuzz::id::FuzzerId;
use fleetfuzz::stats::FuzzerStats;
use metrics::counter;
use tokio::sync::RwLock;

/// In-memory map of the workers the coordinator believes are alive.
///
/// Two logically independent views live here: current stats (read by the
/// metrics poller and the admin page) and liveness (read by the reaper).
/// Each sits behind its own lock so the readers never contend with each
/// other; writers take both locks, always stats first.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    stats: RwLock<HashMap<FuzzerId, FuzzerStats>>,
    updates: RwLock<HashMap<FuzzerId, SystemTime>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_stats(&self, fuzzer_id: FuzzerId, stats: FuzzerStats) {
        self.set_stats_at(fuzzer_id, stats, SystemTime::now()).await
    }

    pub async fn set_stats_at(&self, fuzzer_id: FuzzerId, stats: FuzzerStats, now: SystemTime) {
        let mut stats_map = self.stats.write().await;
        let mut updates_map = self.updates.write().await;
        stats_map.insert(fuzzer_id.clone(), stats);
        updates_map.insert(fuzzer_id, now);
    }

    pub async fn delete_node(&self, fuzzer_id: &FuzzerId) {
        let mut stats_map = self.stats.write().await;
        let mut updates_map = self.updates.write().await;
        stats_map.remove(fuzzer_id);
        updates_map.remove(fuzzer_id);

        counter!("nodes.reaped", "fuzzer_id" => fuzzer_id.to_string()).increment(1);
    }

    /// Snapshot of every node's latest stats. Takes only the stats lock,
    /// so it runs concurrently with reaper liveness reads.
    pub async fn get_all_stats(&self) -> HashMap<FuzzerId, FuzzerStats> {
        self.stats.read().await.clone()
    }

    /// Snapshot of every node's last-contact time. Takes only the updates
    /// lock.
    pub async fn last_contacts(&self) -> HashMap<FuzzerId, SystemTime> {
        self.updates.read().await.clone()
    }
}
