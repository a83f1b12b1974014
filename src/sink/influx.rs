//! InfluxDB sink
//!
//! Writes through the `influxdb2` client against the 1.x compatibility API:
//! the database is used as bucket and `username:password` as token.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::line_protocol::{encode_batch, Precision};
use super::MetricSink;
use crate::error::{Error, Result};
use crate::model::Metric;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// InfluxDB connection settings
#[derive(Debug, Clone)]
pub struct InfluxOptions {
    pub url: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub precision: Precision,
}

pub struct InfluxSink {
    client: influxdb2::Client,
    url: String,
    bucket: String,
    precision: Precision,
}

impl InfluxSink {
    pub fn new(options: &InfluxOptions) -> Result<Self> {
        if options.database.is_empty() {
            return Err(Error::Config("influxdb database must be set".to_string()));
        }

        let token = if options.username.is_empty() && options.password.is_empty() {
            String::new()
        } else {
            format!("{}:{}", options.username, options.password)
        };

        Ok(Self {
            client: influxdb2::Client::new(options.url.as_str(), "", token),
            url: options.url.clone(),
            bucket: options.database.clone(),
            precision: options.precision,
        })
    }
}

#[async_trait]
impl MetricSink for InfluxSink {
    async fn connect(&self) -> Result<()> {
        match tokio::time::timeout(HEALTH_TIMEOUT, self.client.health()).await {
            Ok(Ok(_)) => {
                info!("connected to InfluxDB at {}", self.url);
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Sink(format!("InfluxDB health check failed: {}", e))),
            Err(_) => Err(Error::Sink(format!(
                "InfluxDB at {} did not answer within {:?}",
                self.url, HEALTH_TIMEOUT
            ))),
        }
    }

    async fn write(&self, metrics: &[Metric]) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }

        let body = encode_batch(metrics, self.precision);
        self.client
            .write_line_protocol("", &self.bucket, body)
            .await
            .map_err(|e| Error::Sink(format!("InfluxDB write failed: {}", e)))?;

        debug!("wrote {} point(s) to {}", metrics.len(), self.bucket);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
