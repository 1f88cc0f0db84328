//! Durable CDC event store.
//!
//! `write` succeeds once the event is persisted to at least one sink: the
//! primary CDC collection, or — after bounded retries of transport errors —
//! an append-only fallback file with one JSON event per line. A fallback
//! write still counts as success for the originating request; it is logged
//! and surfaced in metrics so operators can replay the file later.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etre_core::{CdcEvent, Error, EventFilter, Result};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::db::EventBackend;
use crate::metrics::Metrics;

use super::CdcWriter;

/// Retry discipline for the primary sink.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub retry_count: u32,
    pub retry_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_wait: Duration::from_millis(500),
        }
    }
}

pub struct CdcStore {
    backend: Arc<dyn EventBackend>,
    fallback_file: Option<PathBuf>,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl CdcStore {
    pub fn new(
        backend: Arc<dyn EventBackend>,
        fallback_file: Option<PathBuf>,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            fallback_file,
            retry,
            metrics,
        }
    }

    /// Durably record one event. Cancellation during a retry wait skips
    /// the remaining retries and goes straight to the fallback, so the
    /// event is still durably recorded.
    pub async fn write(&self, ctx: &CancellationToken, event: CdcEvent) -> Result<()> {
        self.metrics.cdc_writes.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 0u32;
        let err = loop {
            match self.backend.append_event(&event).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.retry.retry_count => {
                    attempt += 1;
                    tracing::warn!(
                        event_id = %event.id,
                        attempt,
                        error = %e,
                        "CDC write failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry.retry_wait) => {}
                        _ = ctx.cancelled() => break e,
                    }
                }
                Err(e) => break e,
            }
        };

        self.metrics.cdc_write_errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!(event_id = %event.id, error = %err, "CDC primary sink failed");

        match &self.fallback_file {
            Some(path) => self.write_fallback(path, &event).await,
            None => Err(Error::internal(format!("CDC write failed: {}", err))),
        }
    }

    async fn write_fallback(&self, path: &PathBuf, event: &CdcEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)
            .map_err(|e| Error::internal(format!("cannot encode CDC event: {}", e)))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| {
                Error::internal(format!("cannot open CDC fallback file {}: {}", path.display(), e))
            })?;
        file.write_all(line.as_bytes()).await.map_err(|e| {
            Error::internal(format!("cannot append to CDC fallback file: {}", e))
        })?;
        file.flush()
            .await
            .map_err(|e| Error::internal(format!("cannot flush CDC fallback file: {}", e)))?;

        self.metrics
            .cdc_fallback_writes
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(event_id = %event.id, file = %path.display(), "CDC event written to fallback file");
        Ok(())
    }

    /// Events matching the filter, ordered by `ts` ascending.
    pub async fn read(
        &self,
        ctx: &CancellationToken,
        filter: &EventFilter,
    ) -> Result<Vec<CdcEvent>> {
        if ctx.is_cancelled() {
            return Err(Error::internal("request cancelled"));
        }
        Ok(self.backend.read_events(filter).await?)
    }

    /// The backing store's native change stream, tailed by the broadcast
    /// server.
    pub async fn watch(&self) -> Result<tokio::sync::mpsc::Receiver<CdcEvent>> {
        Ok(self.backend.watch_events().await?)
    }
}

#[async_trait]
impl CdcWriter for CdcStore {
    /// Emission runs on a detached token: a committed mutation's event is
    /// recorded even when the originating request has been cancelled.
    async fn write(&self, event: CdcEvent) -> Result<()> {
        CdcStore::write(self, &CancellationToken::new(), event).await
    }
}
