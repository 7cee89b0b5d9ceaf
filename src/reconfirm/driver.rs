//! Async owner loop: poll a coordinator until it converges

use crate::common::{Error, Result};
use crate::reconfirm::coordinator::{LogReconfirm, StepOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Poll `step()` every `poll_interval` until the coordinator converges.
///
/// Retryable errors (see [`Error::is_retryable`]) are logged and retried on
/// the next tick. Anything else ends the loop and is returned to the
/// caller; a fatal one means the caller must step down. With a `deadline`,
/// gives up with [`Error::Timeout`].
pub async fn drive_until_converged(
    reconfirm: Arc<LogReconfirm>,
    poll_interval: Duration,
    deadline: Option<Duration>,
) -> Result<u64> {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut polls = 0u64;

    loop {
        ticker.tick().await;
        polls += 1;

        match reconfirm.step() {
            Ok(StepOutcome::Converged) => {
                tracing::info!(
                    "Reconfirm converged: stream {} after {} polls in {:?}",
                    reconfirm.stream_id(),
                    polls,
                    started.elapsed()
                );
                return Ok(polls);
            }
            Ok(StepOutcome::RetryLater) => {}
            Err(e) if e.is_retryable() => {
                tracing::warn!("Reconfirm poll {} failed, retrying: {}", polls, e);
            }
            Err(e) => return Err(e),
        }

        if let Some(limit) = deadline {
            if started.elapsed() >= limit {
                return Err(Error::Timeout(format!(
                    "stream {} still in {} after {:?}",
                    reconfirm.stream_id(),
                    reconfirm.state(),
                    limit
                )));
            }
        }
    }
}

/// Spawn [`drive_until_converged`] using the coordinator's own config.
pub fn spawn_driver(reconfirm: Arc<LogReconfirm>) -> tokio::task::JoinHandle<Result<u64>> {
    let poll_interval = reconfirm.config().poll_interval();
    let deadline = reconfirm.config().converge_timeout();
    tokio::spawn(drive_until_converged(reconfirm, poll_interval, deadline))
}
