//! Polling for long-running provider jobs (e.g. video generation).
//!
//! Jobs run under one global deadline that is separate from the retry
//! backoff policy. Hitting it is a hard failure and is never retried.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ProviderError;
use crate::telemetry::{SharedSink, TelemetryEvent};

/// Event recorded when a job reports completion.
pub const JOB_COMPLETED_EVENT: &str = "Job.Completed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPollConfig {
    pub poll_interval: Duration,
    /// Global deadline measured from the first poll.
    pub timeout: Duration,
}

impl Default for JobPollConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5_000),
            timeout: Duration::from_millis(600_000),
        }
    }
}

/// What one poll reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus<T> {
    Pending,
    Done(T),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {name} timed out after {elapsed_ms} ms")]
    TimedOut { name: String, elapsed_ms: u64 },

    #[error("job {name} failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: ProviderError,
    },

    #[error("job {name} cancelled")]
    Cancelled { name: String },
}

impl JobError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TimedOut { .. } => "TimedOut",
            Self::Failed { .. } => "Failed",
            Self::Cancelled { .. } => "Cancelled",
        }
    }
}

/// Poll `poll` every `poll_interval` until it reports `Done`.
///
/// Fails with [`JobError::TimedOut`] once `timeout` has elapsed, with
/// [`JobError::Failed`] on the first poll error, and with
/// [`JobError::Cancelled`] when `cancel` fires.
pub async fn poll_until_done<T, P, Fut>(
    name: &str,
    config: &JobPollConfig,
    telemetry: &SharedSink,
    cancel: &CancellationToken,
    mut poll: P,
) -> Result<T, JobError>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<JobStatus<T>, ProviderError>>,
{
    let started = Instant::now();

    let polling = async {
        let mut polls: u32 = 0;
        loop {
            polls += 1;
            match poll().await {
                Ok(JobStatus::Done(value)) => return Ok((value, polls)),
                Ok(JobStatus::Pending) => debug!(job = name, polls, "Job still pending"),
                Err(e) => return Err(e),
            }
            tokio::time::sleep(config.poll_interval).await;
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(JobError::Cancelled { name: name.to_string() }),
        res = tokio::time::timeout(config.timeout, polling) => match res {
            Ok(Ok(done)) => Ok(done),
            Ok(Err(source)) => Err(JobError::Failed { name: name.to_string(), source }),
            Err(_) => Err(JobError::TimedOut {
                name: name.to_string(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        },
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok((value, polls)) => {
            info!(job = name, polls, elapsed_ms, "Job completed");
            telemetry.record_event(
                TelemetryEvent::new(JOB_COMPLETED_EVENT)
                    .flow(name)
                    .duration_ms(elapsed_ms)
                    .attr("polls", polls),
            );
            Ok(value)
        }
        Err(err) => {
            warn!(job = name, elapsed_ms, error = %err, "Job did not complete");
            telemetry.record_error(
                &err,
                TelemetryEvent::new(format!("{name}.{}", err.kind()))
                    .flow(name)
                    .duration_ms(elapsed_ms),
            );
            Err(err)
        }
    }
}
