//! Uplink decoders
//!
//! Each supported provider publishes its own JSON envelope describing one
//! LoRa transmission and the gateways that heard it. A [`Parser`] turns
//! one such envelope into one [`Metric`] per reporting gateway.
//!
//! Supported providers:
//! - [`ttn::TtnParser`]: The Things Network v2 uplink JSON
//! - [`dingnet::DingNetParser`]: DingNet uplink JSON
//!
//! New providers get a new [`ParserKind`] variant and a module of their own.

pub mod dingnet;
pub mod payload;
pub mod ttn;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::model::{Metric, Tags};
use payload::{CoordinateFormat, Payload};

/// Metric name that turns on location/power enrichment
pub const LOCATION_DATA: &str = "coverage";

/// Decodes raw uplink messages into metrics
pub trait Parser: Send + Sync {
    /// Decode one envelope; yields one metric per gateway
    fn parse(&self, buf: &[u8]) -> Result<Vec<Metric>>;

    /// Tags copied onto every metric before the envelope's own tags
    fn set_default_tags(&mut self, tags: Tags);

    fn metric_name(&self) -> &str;
}

/// Supported provider envelope formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserKind {
    Ttn,
    DingNet,
}

impl ParserKind {
    pub const ALL: [ParserKind; 2] = [ParserKind::Ttn, ParserKind::DingNet];

    pub fn name(&self) -> &'static str {
        match self {
            ParserKind::Ttn => "ttn",
            ParserKind::DingNet => "dingnet",
        }
    }
}

impl fmt::Display for ParserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ParserKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ParserKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Selection(format!("unknown parser type: {:?}", s)))
    }
}

impl TryFrom<u8> for ParserKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        ParserKind::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| Error::Selection(format!("unknown parser type: {}", value)))
    }
}

/// Build the decoder for `kind`, emitting metrics named `metric_name`
pub fn create_parser(kind: ParserKind, metric_name: &str) -> Result<Box<dyn Parser>> {
    match kind {
        ParserKind::Ttn => Ok(Box::new(ttn::TtnParser::new(metric_name)?)),
        ParserKind::DingNet => Ok(Box::new(dingnet::DingNetParser::new(metric_name)?)),
    }
}

fn check_metric_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("metric name cannot be empty".to_string()));
    }
    Ok(())
}

/// Treat an explicit JSON `null` like a missing key
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Default tags overlaid with the radio metadata every provider reports
fn envelope_tags(defaults: &Tags, frequency: f64, data_rate: &str) -> Tags {
    let mut tags = defaults.clone();
    tags.insert("frequency".to_string(), frequency.to_string());
    tags.insert("data_rate".to_string(), data_rate.to_string());
    tags
}

/// Best-effort power and location tags; invalid payloads add nothing
fn add_location_tags(tags: &mut Tags, payload: &Payload, format: CoordinateFormat) {
    if let Ok(power) = payload.power() {
        tags.insert("power".to_string(), power.to_string());
    }
    if let Ok((lat, lon)) = payload.location() {
        tags.insert("latitude".to_string(), format.format(lat));
        tags.insert("longitude".to_string(), format.format(lon));
    }
}
