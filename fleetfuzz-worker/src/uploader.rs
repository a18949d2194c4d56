// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{error, info};
use metrics::{counter, gauge};
use tokio::time::sleep;

use crate::client::CoordinatorClient;
use crate::fuzzer::AflFuzzer;

const NOT_FUZZING_POLL: Duration = Duration::from_secs(5);

/// Periodically uploads one fuzzer's state to the coordinator. Each
/// fuzzer process on a machine gets its own uploader.
pub struct StateUploader {
    fuzzer: Arc<AflFuzzer>,
    client: Arc<CoordinatorClient>,
    interval: Duration,
}

impl StateUploader {
    pub fn new(fuzzer: Arc<AflFuzzer>, client: Arc<CoordinatorClient>, interval: Duration) -> Self {
        Self {
            fuzzer,
            client,
            interval,
        }
    }

    /// Loops forever. Polls quickly until the engine has actually begun
    /// fuzzing, uploads immediately once it has, then settles into the
    /// configured sync interval.
    pub async fn run(&self) {
        loop {
            if self.fuzzer.has_begun_fuzzing().await {
                self.upload_state().await;
                break;
            }
            info!(
                "fuzzer not fuzzing yet - sleeping {}s before first upload fuzzer_id={}",
                NOT_FUZZING_POLL.as_secs(),
                self.fuzzer.id(),
            );
            sleep(NOT_FUZZING_POLL).await;
        }

        loop {
            sleep(self.interval).await;
            self.upload_state().await;
        }
    }

    /// One sync cycle: pause the engine, read its state, resume it, then
    /// ship the state. The resume happens whether or not the read or the
    /// upload worked; losing one cycle is fine, losing throughput to a
    /// fuzzer stuck in SIGSTOP is not.
    pub async fn upload_state(&self) {
        self.fuzzer.pause().await;
        let paused_at = Instant::now();
        let state = self.fuzzer.read_state().await;
        self.fuzzer.resume().await;

        let paused_secs = paused_at.elapsed().as_secs_f64();
        info!(
            "read fuzzer state fuzzer_id={} time_paused_s={:.3}",
            self.fuzzer.id(),
            paused_secs,
        );
        gauge!("state_upload.paused_seconds", "fuzzer_id" => self.fuzzer.id().to_string())
            .set(paused_secs);

        match self.try_upload(state).await {
            Ok(()) => {
                counter!("state_upload.success", "fuzzer_id" => self.fuzzer.id().to_string())
                    .increment(1);
            }
            Err(err) => {
                // Fail without bailing so the next cycle can retry.
                error!(
                    "failed to upload state fuzzer_id={} err={:#}",
                    self.fuzzer.id(),
                    err
                );
                counter!("state_upload.fail", "fuzzer_id" => self.fuzzer.id().to_string())
                    .increment(1);
            }
        }
    }

    async fn try_upload(&self, state: Result<fleetfuzz::state::FuzzerState>) -> Result<()> {
        let state = state?;
        self.client.upload_state(&state).await
    }
}
