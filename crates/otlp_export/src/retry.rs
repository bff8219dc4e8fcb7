//! Retrying exporter wrapper.
//!
//! Retries transient failures with exponential backoff inside the flush task
//! that owns the batch. Spans are never put back on the queue, so a batch is
//! still delivered at most once.

use crate::config::RetryConfig;
use crate::exporter::{ExportError, SpanExporter};
use crate::span::SpanBatch;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{sleep, Instant};

/// An exporter wrapper that retries retryable failures with exponential
/// backoff.
///
/// The wait before retry `n` is `initial_interval * multiplier^(n-1)`, capped
/// at `max_interval`. Retrying stops once the next wait would end beyond
/// `max_elapsed_time` measured from the first attempt. Errors that are not
/// retryable (breaker rejections, TLS, 4xx) are returned immediately.
pub struct RetryingExporter<E: SpanExporter> {
    inner: E,
    config: RetryConfig,
    /// Retries issued across all flushes
    total_retries: AtomicU64,
    /// Flushes that failed at first and then got through
    recovered_exports: AtomicU64,
}

impl<E: SpanExporter> RetryingExporter<E> {
    pub fn new(inner: E, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
            recovered_exports: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn recovered_exports(&self) -> u64 {
        self.recovered_exports.load(Ordering::Relaxed)
    }
}

impl<E: SpanExporter> SpanExporter for RetryingExporter<E> {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let started = Instant::now();
        let max_elapsed = self.config.max_elapsed();
        let mut attempt: u32 = 0;

        loop {
            let last = match self.inner.export(batch.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        self.recovered_exports.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            attempt += 1;
            let delay = self.config.delay_for_attempt(attempt);
            if started.elapsed() + delay > max_elapsed {
                return Err(ExportError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(last),
                });
            }

            tracing::debug!(
                exporter = self.inner.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last,
                "Retrying export"
            );
            self.total_retries.fetch_add(1, Ordering::Relaxed);
            sleep(delay).await;
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
