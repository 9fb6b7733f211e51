use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use flotilla_core::config::RetryConfig;
use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::{InferenceStream, Provider};
use flotilla_core::types::*;

/// A provider that retries failed calls whose error is marked retryable.
///
/// Only call establishment is retried; once a stream is open its events are
/// delivered as-is.
pub struct RetryingProvider {
    inner: Arc<dyn Provider>,
    retry_config: RetryConfig,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn Provider>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }

    async fn with_retries<T, F>(&self, cancel: &CancellationToken, mut call: F) -> Result<T>
    where
        F: FnMut() -> BoxFuture<'static, Result<T>>,
    {
        let max_retries = self.retry_config.max_retries;
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let backoff = calculate_backoff(attempt, &self.retry_config);
                    warn!(
                        provider = %self.inner.name(),
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying inference request"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FlotillaError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl Provider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn run_inference(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<InferenceResponse>> {
        Box::pin(async move {
            let inner = Arc::clone(&self.inner);
            let token = cancel.clone();
            self.with_retries(&cancel, move || {
                let inner = Arc::clone(&inner);
                let request = request.clone();
                let token = token.clone();
                async move { inner.run_inference(request, token).await }.boxed()
            })
            .await
        })
    }

    fn stream_inference(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Box<dyn InferenceStream>>> {
        Box::pin(async move {
            let inner = Arc::clone(&self.inner);
            let token = cancel.clone();
            self.with_retries(&cancel, move || {
                let inner = Arc::clone(&inner);
                let request = request.clone();
                let token = token.clone();
                async move { inner.stream_inference(request, token).await }.boxed()
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
        error: fn() -> FlotillaError,
    }

    impl Provider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn run_inference(
            &self,
            _request: InferenceRequest,
            _cancel: CancellationToken,
        ) -> BoxFuture<'_, Result<InferenceResponse>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.failures {
                    Err((self.error)())
                } else {
                    Ok(InferenceResponse {
                        id: format!("ok-{}", n),
                        ..Default::default()
                    })
                }
            })
        }

        fn stream_inference(
            &self,
            _request: InferenceRequest,
            _cancel: CancellationToken,
        ) -> BoxFuture<'_, Result<Box<dyn InferenceStream>>> {
            Box::pin(async { Err(FlotillaError::streaming_failed("unsupported")) })
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_retries_retryable_errors() {
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: 2,
            error: || FlotillaError::rate_limit("429"),
        });
        let provider = RetryingProvider::new(flaky.clone(), fast_retry());
        let resp = provider
            .run_inference(InferenceRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.id, "ok-2");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: 10,
            error: || FlotillaError::provider_unavailable("503"),
        });
        let provider = RetryingProvider::new(flaky.clone(), fast_retry());
        let err = provider
            .run_inference(InferenceRequest::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_errors_not_retried() {
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: 1,
            error: || FlotillaError::context_too_long("too big"),
        });
        let provider = RetryingProvider::new(flaky.clone(), fast_retry());
        assert!(provider
            .run_inference(InferenceRequest::default(), CancellationToken::new())
            .await
            .is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_bounds() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30000,
        };
        for attempt in 0..8 {
            let base = (1000u64 * 2u64.pow(attempt)).min(30000) as f64;
            let ms = calculate_backoff(attempt, &config).as_millis() as f64;
            assert!(ms >= base * 0.8 - 1.0 && ms <= base * 1.2 + 1.0);
        }
    }
}
