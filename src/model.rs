//! Normalized time-series data point
//!
//! A [`Metric`] is what every decoder produces and every sink consumes:
//! a measurement name, indexed string tags, at least one scalar field and
//! an optional timestamp. `None` means the source carried no time and the
//! store decides ("now").

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Scalar value of a metric field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
}

impl FieldValue {
    /// Convert a JSON value, skipping anything that is not a scalar
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(FieldValue::Boolean(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(FieldValue::Integer(i)),
                None => n.as_f64().map(FieldValue::Float),
            },
            serde_json::Value::String(s) => Some(FieldValue::String(s.clone())),
            _ => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Float(x) => write!(f, "{}", x),
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::String(s) => write!(f, "{}", s),
        }
    }
}

pub type Tags = BTreeMap<String, String>;
pub type Fields = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    name: String,
    tags: Tags,
    fields: Fields,
    time: Option<DateTime<Utc>>,
}

impl Metric {
    /// Create a metric; the name must be non-empty and at least one field is required
    pub fn new(
        name: impl Into<String>,
        tags: Tags,
        fields: Fields,
        time: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Validation("missing measurement name".to_string()));
        }
        if fields.is_empty() {
            return Err(Error::Validation(format!(
                "{}: missing field(s), at least one required",
                name
            )));
        }

        Ok(Self {
            name,
            tags,
            fields,
            time,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }

    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn remove_tag(&mut self, key: &str) {
        self.tags.remove(key);
    }

    pub fn has_field(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Remove a field. Fails while only one field is left.
    pub fn remove_field(&mut self, key: &str) -> Result<()> {
        if self.fields.len() == 1 {
            return Err(Error::Invariant(format!(
                "{}: can't remove last field, at least one required",
                self.name
            )));
        }
        self.fields.remove(key);
        Ok(())
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (k, v) in &self.tags {
            write!(f, " {}={}", k, v)?;
        }
        write!(f, " |")?;
        for (k, v) in &self.fields {
            write!(f, " {}={}", k, v)?;
        }
        if let Some(t) = self.time {
            write!(f, " @ {}", t.to_rfc3339())?;
        }
        Ok(())
    }
}
