//! Metric sinks
//!
//! The pipeline hands every decoded batch to a [`MetricSink`]. Production
//! uses [`influx::InfluxSink`]; decode-only runs use [`LogSink`]; tests use
//! [`MemorySink`].

#[cfg(feature = "influxdb")]
pub mod influx;
pub mod line_protocol;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::Metric;

pub use line_protocol::Precision;

/// Store that accepts decoded metrics
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// Write one batch; a failed batch is not retried
    async fn write(&self, metrics: &[Metric]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Logs every metric instead of storing it
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl MetricSink for LogSink {
    async fn connect(&self) -> Result<()> {
        info!("no metric store configured, logging decoded metrics");
        Ok(())
    }

    async fn write(&self, metrics: &[Metric]) -> Result<()> {
        for metric in metrics {
            info!(%metric, "decoded");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory sink that collects written metrics for assertions
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    metrics: Arc<Mutex<Vec<Metric>>>,
    failures: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a sink error
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Non-destructive snapshot of everything written so far
    pub fn snapshot(&self) -> Vec<Metric> {
        self.metrics
            .lock()
            .map(|metrics| metrics.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().map(|metrics| metrics.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetricSink for MemorySink {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, metrics: &[Metric]) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Sink("injected write failure".to_string()));
        }

        self.metrics
            .lock()
            .map_err(|_| Error::Sink("memory sink poisoned".to_string()))?
            .extend_from_slice(metrics);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
