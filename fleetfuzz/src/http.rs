// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Retry plumbing for worker-to-coordinator requests.
//!
//! Fleet sync is periodic and idempotent, so the policy is deliberately
//! blunt: any transport error or non-2xx response is worth retrying, with a
//! fixed delay between attempts, until the attempt budget runs out. The
//! caller's periodic loop is the real recovery mechanism; retries only
//! smooth over blips shorter than a sync interval.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Error, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use log::warn;
use reqwest::{RequestBuilder, Response};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Sends a freshly built request up to `max_retries` times, `retry_delay`
/// apart. `build_request` runs once per attempt because a `RequestBuilder`
/// is consumed by sending it.
pub async fn send_retry_reqwest<F>(
    build_request: F,
    retry_delay: Duration,
    max_retries: usize,
) -> Result<Response>
where
    F: Fn() -> Result<RequestBuilder> + Send + Sync,
{
    let attempts = AtomicUsize::new(0);
    let operation = || async {
        if attempts.fetch_add(1, Ordering::SeqCst) >= max_retries {
            return Err(backoff::Error::permanent(format_err!(
                "ran out of retries after {} attempts",
                max_retries
            )));
        }

        let request = build_request().map_err(backoff::Error::permanent)?;
        let response = request
            .send()
            .await
            .map_err(|err| backoff::Error::transient(Error::from(err)))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            warn!("request failed status_code={status}, will retry");
            Err(backoff::Error::transient(format_err!(
                "request failed with status {status}"
            )))
        }
    };

    let policy = ExponentialBackoff {
        initial_interval: retry_delay,
        current_interval: retry_delay,
        max_interval: retry_delay,
        multiplier: 1.0,
        randomization_factor: 0.0,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };

    let response = backoff::future::retry(policy, operation).await?;
    Ok(response)
}

#[async_trait]
pub trait SendRetry {
    async fn send_retry(self, retry_delay: Duration, max_retries: usize) -> Result<Response>;
    async fn send_retry_default(self) -> Result<Response>;
}

#[async_trait]
impl SendRetry for RequestBuilder {
    async fn send_retry(self, retry_delay: Duration, max_retries: usize) -> Result<Response> {
        send_retry_reqwest(
            || {
                self.try_clone().ok_or_else(|| {
                    format_err!("this request cannot be retried because it cannot be cloned")
                })
            },
            retry_delay,
            max_retries,
        )
        .await
    }

    async fn send_retry_default(self) -> Result<Response> {
        self.send_retry(DEFAULT_RETRY_DELAY, DEFAULT_MAX_RETRIES)
            .await
    }
}
