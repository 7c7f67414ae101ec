use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_max: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            jitter_max: Some(Duration::from_millis(50)),
        }
    }
}

impl RetryConfig {
    /// Single attempt, used where retrying would duplicate a side effect.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Runs `f` until it succeeds, `should_retry` rejects the error, or the
/// attempt budget is spent. Backoff doubles up to `max_backoff`.
pub async fn retry_if<F, Fut, T, E, P>(config: &RetryConfig, mut f: F, should_retry: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempts_left = config.max_attempts.max(1);
    let mut backoff = config.base_backoff;

    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempts_left -= 1;
                if attempts_left == 0 || !should_retry(&e) {
                    return Err(e);
                }

                let wait = backoff + jitter(config.jitter_max);
                tracing::debug!(
                    "Retrying after {:?} ({} attempts left)",
                    wait,
                    attempts_left
                );
                tokio::time::sleep(wait).await;

                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }
}

fn jitter(jitter_max: Option<Duration>) -> Duration {
    match jitter_max {
        Some(max) if !max.is_zero() => {
            let max_ms = max.as_millis() as u64;
            Duration::from_millis(rand::random::<u64>() % (max_ms + 1))
        }
        _ => Duration::ZERO,
    }
}
