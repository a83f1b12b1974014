//! Bridge LoRa gateway uplinks from an MQTT broker into a time-series store.
//!
//! Broker messages carry a provider's uplink envelope (TTN or DingNet JSON).
//! [`parser`] turns each envelope into one [`model::Metric`] per gateway that
//! heard the transmission, and [`pipeline::run_receiver`] hands the batch to a
//! [`sink::MetricSink`].

pub mod config;
pub mod error;
pub mod model;
pub mod mqtt;
pub mod parser;
pub mod pipeline;
pub mod sink;

pub use error::{Error, Result};
