//! The Things Network (v2) uplink decoder
//!
//! Envelope shape (only the keys we read):
//!
//! ```json
//! {
//!   "dev_id": "sodaq_one_gps_1",
//!   "payload_raw": "B8hBALggAQ==",
//!   "payload_fields": { "lat": 51.0017, "lon": 4.7136 },
//!   "metadata": {
//!     "time": "2018-03-13T19:21:22.827671626Z",
//!     "frequency": 868.3,
//!     "data_rate": "SF12BW125",
//!     "gateways": [
//!       { "gateway_id": "eui-008000000000b88d", "time": "...", "rssi": -84, "snr": 8 }
//!     ]
//!   }
//! }
//! ```
//!
//! Metrics carry the per-gateway receipt time.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::payload::{CoordinateFormat, Payload};
use super::{
    add_location_tags, check_metric_name, envelope_tags, null_as_default, Parser, LOCATION_DATA,
};
use crate::error::{Error, Result};
use crate::model::{FieldValue, Fields, Metric, Tags};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Uplink {
    #[serde(deserialize_with = "null_as_default")]
    dev_id: String,
    #[serde(deserialize_with = "null_as_default")]
    payload_raw: Payload,
    #[serde(deserialize_with = "null_as_default")]
    payload_fields: serde_json::Map<String, serde_json::Value>,
    #[serde(deserialize_with = "null_as_default")]
    metadata: Metadata,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Metadata {
    frequency: f64,
    #[serde(deserialize_with = "null_as_default")]
    data_rate: String,
    #[serde(deserialize_with = "null_as_default")]
    gateways: Vec<Gateway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Gateway {
    #[serde(deserialize_with = "null_as_default")]
    gateway_id: String,
    time: Option<DateTime<Utc>>,
    rssi: i64,
    snr: f64,
}

#[derive(Debug, Clone)]
pub struct TtnParser {
    metric_name: String,
    default_tags: Tags,
}

impl TtnParser {
    pub fn new(metric_name: &str) -> Result<Self> {
        check_metric_name(metric_name)?;
        Ok(Self {
            metric_name: metric_name.to_string(),
            default_tags: Tags::new(),
        })
    }
}

impl Parser for TtnParser {
    fn parse(&self, buf: &[u8]) -> Result<Vec<Metric>> {
        let message: Uplink = serde_json::from_slice(buf)
            .map_err(|e| Error::Format(format!("ttn: unmarshalling uplink: {}", e)))?;

        let gateways = &message.metadata.gateways;
        if gateways.is_empty() {
            return Err(Error::Validation(
                "ttn: wrong number of gateways (0)".to_string(),
            ));
        }

        let coverage = self.metric_name == LOCATION_DATA;

        let mut tags = envelope_tags(
            &self.default_tags,
            message.metadata.frequency,
            &message.metadata.data_rate,
        );
        tags.insert("device_id".to_string(), message.dev_id.clone());
        if coverage {
            add_location_tags(&mut tags, &message.payload_raw, CoordinateFormat::Full);
        }

        let mut fields = Fields::new();
        fields.insert(
            "size".to_string(),
            FieldValue::Integer(message.payload_raw.size() as i64),
        );

        let mut metrics = Vec::with_capacity(gateways.len());
        for gw in gateways {
            let mut metric = Metric::new(&self.metric_name, tags.clone(), fields.clone(), gw.time)?;

            if coverage {
                metric.add_field("rssi", gw.rssi);
                metric.add_field("snr", gw.snr);
            } else {
                metric.add_tag("rssi", gw.rssi.to_string());
                metric.add_tag("snr", gw.snr.to_string());
                for (key, value) in &message.payload_fields {
                    match FieldValue::from_json(value) {
                        Some(v) => metric.add_field(key.as_str(), v),
                        None => debug!("ttn: skipping non-scalar payload field {}", key),
                    }
                }
            }

            metric.add_tag("gateway_id", gw.gateway_id.as_str());
            metrics.push(metric);
        }

        Ok(metrics)
    }

    fn set_default_tags(&mut self, tags: Tags) {
        self.default_tags = tags;
    }

    fn metric_name(&self) -> &str {
        &self.metric_name
    }
}
