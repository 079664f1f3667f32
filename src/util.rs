use std::future::Future;
use std::iter::repeat;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::EngineError;

pub fn find_first_subpath<P: AsRef<Path>, F: Fn(&Path) -> bool>(
    root: impl AsRef<Path>,
    subpaths: &[P],
    search: F,
) -> Option<PathBuf> {
    subpaths
        .iter()
        .zip(repeat(root.as_ref()))
        .map(|(b, a)| a.join(b))
        .find(|it: &PathBuf| search(it))
}

/// Backoff before retry number `attempt` (starting at 1): `base * 2^(attempt-1)`
/// plus up to half of that again as jitter.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1 << attempt.saturating_sub(1).min(16));
    let jitter_ms = (exp.as_millis() as u64) / 2;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    exp + Duration::from_millis(jitter)
}

/// Runs `operation` up to `attempts` times, sleeping with exponential
/// backoff between tries. Only retryable errors are retried.
pub async fn retry<T, F, Fut>(attempts: u32, base_delay: Duration, mut operation: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = backoff(base_delay, attempt);
                warn!("Attempt {} of {} failed, retrying in {:?}: {}", attempt, attempts, delay, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
