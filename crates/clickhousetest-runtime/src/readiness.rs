//! Readiness gate.
//!
//! Polls the control plane until a connection opens and answers a ping, or
//! the retry budget runs out. The first successful probe wins. Every sleep
//! and every in-flight attempt is raced against the cancellation token.

use clickhousetest_core::{
    ClientError, ConnectionOptions, DatabaseClient, DatabaseConnector, Error, Phase, Result,
    RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Wait until the instance at `options` accepts a control connection.
///
/// Returns the first connection whose ping succeeds. Connections that fail
/// their ping are closed before the next attempt. Fails with
/// [`Error::Timeout`] once `policy.attempts` probes have failed, regardless of
/// why they failed, and with [`Error::Cancelled`] as soon as `cancel` fires.
pub async fn wait_ready(
    connector: &dyn DatabaseConnector,
    options: &ConnectionOptions,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Arc<dyn DatabaseClient>> {
    let started = Instant::now();
    let address = options.address();
    info!(address = %address, attempts = policy.attempts, "Waiting for server to accept connections");

    let cancelled = || Error::Cancelled {
        phase: Phase::Readiness,
    };
    let mut last_error = None;

    for attempt in 1..=policy.attempts {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled()),
            outcome = probe(connector, options, policy.attempt_timeout) => outcome,
        };

        match outcome {
            Ok(client) => {
                info!(
                    address = %address,
                    attempt = attempt,
                    elapsed = ?started.elapsed(),
                    "Server is accepting connections"
                );
                return Ok(client);
            }
            Err(e) => {
                debug!(address = %address, attempt = attempt, error = %e, "Readiness probe failed, retrying...");
                last_error = Some(e);
            }
        }

        if attempt < policy.attempts {
            let delay = policy.next_delay();
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled()),
                () = sleep(delay) => {}
            }
        }
    }

    Err(Error::Timeout {
        phase: Phase::Readiness,
        address,
        attempts: policy.attempts,
        elapsed: started.elapsed(),
        last_error,
    })
}

/// One connect + ping attempt, bounded by `limit` when set.
async fn probe(
    connector: &dyn DatabaseConnector,
    options: &ConnectionOptions,
    limit: Option<Duration>,
) -> Result<Arc<dyn DatabaseClient>, ClientError> {
    let attempt = async {
        let client = connector.connect(options).await?;
        match client.ping().await {
            Ok(()) => Ok(client),
            Err(e) => {
                if let Err(close_err) = client.close().await {
                    debug!(error = %close_err, "Failed to close probe connection");
                }
                Err(e)
            }
        }
    };

    match limit {
        Some(limit) => timeout(limit, attempt)
            .await
            .unwrap_or_else(|_| Err(ClientError::Timeout(limit))),
        None => attempt.await,
    }
}
