// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetfuzz::config::FuzzerConfig;
use fleetfuzz::corpus::InputCorpus;
use fleetfuzz::http::SendRetry;
use fleetfuzz::id::FuzzerId;
use fleetfuzz::state::FuzzerState;
use log::info;
use tokio::fs;

// Sync traffic is in no hurry, so the timeouts are generous and every call
// rides the shared retry policy. The TLS handshake shares the connect
// budget.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRIES: usize = 3;

/// Wrapper around the coordinator API: uploading state, downloading the
/// fleet's queues, and fetching the run's target, seeds, dict, and config.
pub struct CoordinatorClient {
    address: String,
    client: reqwest::Client,
    retry_delay: Duration,
    max_retries: usize,
}

impl CoordinatorClient {
    pub fn new(address: String) -> Result<Self> {
        Self::with_retry(address, RETRY_DELAY, MAX_RETRIES)
    }

    fn with_retry(address: String, retry_delay: Duration, max_retries: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("unable to build http client")?;

        Ok(Self {
            address,
            client,
            retry_delay,
            max_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.address, path)
    }

    pub async fn fetch_fuzzer_config(&self) -> Result<FuzzerConfig> {
        let response = self
            .client
            .get(self.url("config"))
            .send_retry(self.retry_delay, self.max_retries)
            .await?;
        Ok(response.json().await?)
    }

    /// Downloads the seed corpus the engine bootstraps from.
    pub async fn fetch_inputs(&self) -> Result<InputCorpus> {
        let response = self
            .client
            .get(self.url("inputs"))
            .send_retry(self.retry_delay, self.max_retries)
            .await?;
        Ok(response.json().await?)
    }

    pub async fn fetch_dict(&self) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.url("dict"))
            .send_retry(self.retry_delay, self.max_retries)
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Every queue in the fleet, keyed by fuzzer id.
    pub async fn fetch_queues(&self) -> Result<HashMap<FuzzerId, InputCorpus>> {
        let response = self
            .client
            .get(self.url("queue"))
            .send_retry(self.retry_delay, self.max_retries)
            .await?;
        Ok(response.json().await?)
    }

    /// Downloads the target binary to `dst` and marks it executable.
    pub async fn fetch_target_binary(&self, dst: &Path) -> Result<()> {
        let response = self
            .client
            .get(self.url("target/binary"))
            .send_retry(self.retry_delay, self.max_retries)
            .await?;
        let body = response.bytes().await?;

        fs::write(dst, &body)
            .await
            .with_context(|| format!("unable to write target binary: {}", dst.display()))?;
        set_executable(dst).await?;

        info!("downloaded target binary path={} bytes={}", dst.display(), body.len());
        Ok(())
    }

    pub async fn upload_state(&self, state: &FuzzerState) -> Result<()> {
        self.client
            .post(self.url("state"))
            .json(state)
            .send_retry(self.retry_delay, self.max_retries)
            .await?;
        Ok(())
    }
}

#[cfg(target_family = "unix")]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path).await?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
        .await
        .with_context(|| format!("unable to mark executable: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};

    use super::*;

    /// Stub coordinator whose `/queue` fails with 418 for the first
    /// `failures` requests and succeeds afterwards.
    async fn flaky_stub(failures: usize) -> String {
        let served = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route(
            "/queue",
            get(move || {
                let served = served.clone();
                async move {
                    if served.fetch_add(1, Ordering::SeqCst) < failures {
                        StatusCode::IM_A_TEAPOT.into_response()
                    } else {
                        Json(HashMap::<FuzzerId, InputCorpus>::new()).into_response()
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_retries_until_eventual_success() {
        let address = flaky_stub(4).await;
        let client =
            CoordinatorClient::with_retry(address, Duration::from_millis(0), 5).unwrap();

        let queues = client.fetch_queues().await.unwrap();

        assert!(queues.is_empty());
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let address = flaky_stub(4).await;
        let client =
            CoordinatorClient::with_retry(address, Duration::from_millis(0), 3).unwrap();

        let err = client.fetch_queues().await.unwrap_err();

        assert!(err.to_string().contains("ran out of retries"));
    }
}
