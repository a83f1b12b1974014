//! InfluxDB line protocol encoding
//!
//! `measurement[,tag=value...] field=value[,field=value...] [timestamp]`
//!
//! Timestamps are always emitted in nanoseconds after being truncated to the
//! configured [`Precision`], so the write endpoint can use its default unit.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{FieldValue, Metric};

/// Timestamp resolution kept when writing points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Precision {
    Nanoseconds,
    Microseconds,
    #[default]
    Milliseconds,
    Seconds,
}

impl Precision {
    fn nanos_per_unit(&self) -> i64 {
        match self {
            Precision::Nanoseconds => 1,
            Precision::Microseconds => 1_000,
            Precision::Milliseconds => 1_000_000,
            Precision::Seconds => 1_000_000_000,
        }
    }

    /// Nanoseconds since the epoch, truncated to this precision
    pub fn truncate(&self, time: DateTime<Utc>) -> Option<i64> {
        let nanos = time.timestamp_nanos_opt()?;
        Some(nanos - nanos.rem_euclid(self.nanos_per_unit()))
    }
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ns" | "n" => Ok(Precision::Nanoseconds),
            "us" | "u" => Ok(Precision::Microseconds),
            "ms" => Ok(Precision::Milliseconds),
            "s" => Ok(Precision::Seconds),
            other => Err(Error::Config(format!("invalid precision: {:?}", other))),
        }
    }
}

impl TryFrom<String> for Precision {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_measurement(s: &str) -> String {
    escape(s, &[',', ' '])
}

fn escape_key(s: &str) -> String {
    escape(s, &[',', '=', ' '])
}

fn field_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Integer(i) => format!("{}i", i),
        FieldValue::Float(f) => f.to_string(),
        FieldValue::Boolean(b) => b.to_string(),
        FieldValue::String(s) => format!("\"{}\"", escape(s, &['"', '\\'])),
    }
}

/// Encode one metric as a single line (no trailing newline). Tags with an
/// empty key or value are left out, the store rejects them.
pub fn encode_metric(metric: &Metric, precision: Precision) -> String {
    let mut line = escape_measurement(metric.name());

    for (key, value) in metric.tags() {
        if key.is_empty() || value.is_empty() {
            continue;
        }
        line.push_str(&format!(",{}={}", escape_key(key), escape_key(value)));
    }

    for (i, (key, value)) in metric.fields().iter().enumerate() {
        let sep = if i == 0 { ' ' } else { ',' };
        line.push_str(&format!("{}{}={}", sep, escape_key(key), field_value(value)));
    }

    if let Some(ts) = metric.time().and_then(|t| precision.truncate(t)) {
        line.push_str(&format!(" {}", ts));
    }

    line
}

/// Encode a batch, one line per metric
pub fn encode_batch(metrics: &[Metric], precision: Precision) -> String {
    metrics
        .iter()
        .map(|m| encode_metric(m, precision))
        .collect::<Vec<_>>()
        .join("\n")
}
