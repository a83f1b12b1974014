//! DingNet uplink decoder
//!
//! Same overall shape as the TTN envelope, but gateways are keyed by
//! `gtw_id`, there is no device id or decoded payload map, and all metrics
//! carry the envelope-level `metadata.time`.
//!
//! Coordinates are rendered with 4 decimals. For the data-rate maintenance
//! metrics (`adr`, `ddr`) a categorical `dr` field is derived from the
//! spreading factor.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::payload::{CoordinateFormat, Payload};
use super::{
    add_location_tags, check_metric_name, envelope_tags, null_as_default, Parser, LOCATION_DATA,
};
use crate::error::{Error, Result};
use crate::model::{FieldValue, Fields, Metric, Tags};

/// Metric names that track the data rate devices are using
pub const DATA_RATE_METRICS: [&str; 2] = ["adr", "ddr"];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Uplink {
    #[serde(deserialize_with = "null_as_default")]
    payload_raw: Payload,
    #[serde(deserialize_with = "null_as_default")]
    metadata: Metadata,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Metadata {
    time: Option<DateTime<Utc>>,
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
    gtw_id: String,
    rssi: i64,
    snr: f64,
}

/// EU868 data rate index for a 125 kHz spreading factor; unknown rates map to 0
fn data_rate_index(data_rate: &str) -> i64 {
    match data_rate {
        "SF7BW125" => 5,
        "SF8BW125" => 4,
        "SF9BW125" => 3,
        "SF10BW125" => 2,
        "SF11BW125" => 1,
        "SF12BW125" => 0,
        _ => 0,
    }
}

#[derive(Debug, Clone)]
pub struct DingNetParser {
    metric_name: String,
    default_tags: Tags,
}

impl DingNetParser {
    pub fn new(metric_name: &str) -> Result<Self> {
        check_metric_name(metric_name)?;
        Ok(Self {
            metric_name: metric_name.to_string(),
            default_tags: Tags::new(),
        })
    }
}

impl Parser for DingNetParser {
    fn parse(&self, buf: &[u8]) -> Result<Vec<Metric>> {
        let message: Uplink = serde_json::from_slice(buf)
            .map_err(|e| Error::Format(format!("dingnet: unmarshalling uplink: {}", e)))?;

        let metadata = &message.metadata;
        if metadata.gateways.is_empty() {
            return Err(Error::Validation(
                "dingnet: wrong number of gateways (0)".to_string(),
            ));
        }

        let coverage = self.metric_name == LOCATION_DATA;
        let tracks_data_rate = DATA_RATE_METRICS.contains(&self.metric_name.as_str());

        let mut tags = envelope_tags(&self.default_tags, metadata.frequency, &metadata.data_rate);
        if coverage {
            add_location_tags(&mut tags, &message.payload_raw, CoordinateFormat::Fixed(4));
        }

        let mut fields = Fields::new();
        fields.insert(
            "size".to_string(),
            FieldValue::Integer(message.payload_raw.size() as i64),
        );

        let mut metrics = Vec::with_capacity(metadata.gateways.len());
        for gw in &metadata.gateways {
            let mut metric =
                Metric::new(&self.metric_name, tags.clone(), fields.clone(), metadata.time)?;

            if coverage {
                metric.add_field("rssi", gw.rssi);
                metric.add_field("snr", gw.snr);
            } else {
                metric.add_tag("rssi", gw.rssi.to_string());
                metric.add_tag("snr", gw.snr.to_string());
                if tracks_data_rate {
                    metric.add_field("dr", data_rate_index(&metadata.data_rate));
                }
            }

            metric.add_tag("gateway_id", gw.gtw_id.as_str());
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
