//! Startup - 起動時の接続リトライ
//!
//! 依存先（Redis など）がまだ立ち上がっていないことがあるので、
//! 固定間隔で決まった回数だけ試し、それでもだめなら `StartupError` で終了する。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::domain::StartupError;

/// Attempts and spacing for [`connect_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for StartupRetry {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay: Duration::from_secs(2),
        }
    }
}

/// Call `connect` until it succeeds or `retry.attempts` calls have failed.
pub async fn connect_with_retry<T, E, F, Fut>(
    component: &str,
    retry: StartupRetry,
    mut connect: F,
) -> Result<T, StartupError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = retry.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match connect().await {
            Ok(conn) => {
                if attempt > 1 {
                    tracing::info!(component, attempt, "connected");
                }
                return Ok(conn);
            }
            Err(e) => {
                last_error = e.to_string();
                tracing::warn!(component, attempt, max_attempts = attempts, error = %e, "connection failed");
                if attempt < attempts {
                    tokio::time::sleep(retry.delay).await;
                }
            }
        }
    }

    Err(StartupError::Exhausted {
        component: component.to_string(),
        attempts,
        message: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = connect_with_retry("redis", StartupRetry::default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err("connection refused")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let retry = StartupRetry {
            attempts: 4,
            delay: Duration::from_secs(2),
        };
        let result: Result<(), _> = connect_with_retry("redis", retry, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("connection refused") }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let StartupError::Exhausted {
            component,
            attempts,
            message,
        } = result.unwrap_err();
        assert_eq!(component, "redis");
        assert_eq!(attempts, 4);
        assert_eq!(message, "connection refused");
    }
}
