//! Bounded re-execution of view calls whose optimistic reads were
//! invalidated.
//!
//! The host itself never retries: a view call that observes a state
//! transition fails with [`HostError::StateInvalidated`]. This wrapper runs
//! the call again with backoff, and each attempt takes its own baseline.

use std::time::{Duration, Instant};

use tracing::debug;
use wasmhost_core::{HostError, HostResult};
use wasmhost_types::RetryConfig;

/// Run `f` until it succeeds, fails with a non-retryable error, runs out of
/// retries, or would sleep past `timeout`. `f` receives the 0-based attempt
/// number. The last error is returned when attempts are exhausted.
pub fn retry_on_invalidated<T, F>(cfg: &RetryConfig, timeout: Duration, mut f: F) -> HostResult<T>
where
    F: FnMut(usize) -> HostResult<T>,
{
    let deadline = Instant::now() + timeout;
    let mut attempt = 0usize;

    loop {
        match f(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || attempt >= cfg.retries {
                    return Err(err);
                }
                let backoff = cfg.backoff_for(attempt);
                if Instant::now() + backoff > deadline {
                    debug!(attempt, "view retry budget exhausted");
                    return Err(err);
                }
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, "view invalidated, retrying");
                std::thread::sleep(backoff);
                attempt += 1;
            }
        }
    }
}

/// Whether an error from [`retry_on_invalidated`] came from exhausted
/// retries rather than a hard failure.
pub fn gave_up(err: &HostError) -> bool {
    err.is_retryable()
}
