// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::Duration;

use fleetfuzz::jitter::delay_with_jitter;
use fleetfuzz::layout::FleetDirs;
use log::{error, info};
use metrics::counter;

use crate::client::CoordinatorClient;

/// Periodically downloads every queue in the fleet and materializes them
/// in the local output tree, where the engine's sibling-queue discovery
/// imports them. All fuzzers on a machine share one tree, so one
/// downloader per machine is enough; the jittered tick keeps a large
/// fleet from stampeding the coordinator in lockstep.
pub struct QueueDownloader {
    client: Arc<CoordinatorClient>,
    dirs: FleetDirs,
    interval: Duration,
}

impl QueueDownloader {
    pub fn new(client: Arc<CoordinatorClient>, dirs: FleetDirs, interval: Duration) -> Self {
        Self {
            client,
            dirs,
            interval,
        }
    }

    pub async fn run(&self) {
        loop {
            delay_with_jitter(self.interval).await;
            self.download_queues().await;
        }
    }

    /// One download cycle. Failures are logged and counted; the next tick
    /// is the retry.
    pub async fn download_queues(&self) {
        info!("downloading fleet queues");

        let queues = match self.client.fetch_queues().await {
            Ok(queues) => queues,
            Err(err) => {
                error!("failed to download queues err={:#}", err);
                counter!("queue_download.fail").increment(1);
                return;
            }
        };

        if let Err(err) = self.dirs.write_queues(&queues).await {
            error!("failed to write queues to disk err={:#}", err);
            counter!("queue_download.fail").increment(1);
            return;
        }

        counter!("queue_download.success").increment(1);
    }
}
