//! Retry policy for outbound delivery.
//!
//! The schedule and the transient/terminal classification are pure and
//! independent of real time: sleeping goes through [`Clock`] so tests can
//! substitute a recording fake.

use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tracing::debug;

/// Fixed backoff schedule. The leading zero makes the first attempt
/// immediate; once the last slot is spent the error is terminal.
pub(crate) const BACKOFF: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
];

/// The clock every retry delay passes through.
#[async_trait]
pub(crate) trait Clock {
    /// Wait for `delay` amount of time.
    async fn wait(&self, delay: Duration);
}

/// A clock that waits in real time.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RealClock;

#[async_trait]
impl Clock for RealClock {
    async fn wait(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Whether `err` is a connectivity failure worth another attempt.
///
/// Walks the error's source chain for an [`io::Error`] of the refused or
/// reset kinds. Every other failure, validation rejections included, is
/// terminal for the item that hit it.
pub(crate) fn is_transient(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(layer) = current {
        if let Some(io_err) = layer.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
            ) {
                return true;
            }
        }
        current = layer.source();
    }
    false
}

/// Drive `op` through the backoff schedule until it succeeds, fails with a
/// terminal error or exhausts the schedule. The last error observed is
/// returned in the latter two cases.
pub(crate) async fn send_with_retries<C, F, Fut, T, E>(clock: &C, mut op: F) -> Result<T, E>
where
    C: Clock + Sync,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let mut attempt = 0;
    loop {
        clock.wait(BACKOFF[attempt]).await;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt == BACKOFF.len() || !is_transient(&err) {
                    return Err(err);
                }
                counter!("retries_attempted").increment(1);
                debug!(
                    "transient delivery failure, attempt {attempt} of {total}: {err}",
                    total = BACKOFF.len()
                );
            }
        }
    }
}
