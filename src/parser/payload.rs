//! Compact binary payload carried as base64 inside provider envelopes
//!
//! Layout used by the coverage-mapping devices (all big-endian):
//!
//! ```text
//!   byte  0..3   latitude  (u24, degrees * 10_000)
//!   byte  3..6   longitude (u24, degrees * 10_000)
//!   byte  6      transmit power (i8, dBm), optional
//! ```
//!
//! Only 6 and 7 byte payloads carry a location; only 7 byte payloads carry
//! a power value. Decoding itself accepts any length.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Buf;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Fixed-point scale of the coordinate fields
const COORDINATE_SCALE: f64 = 10_000.0;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    size: usize,
    bytes: Vec<u8>,
}

impl Payload {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            size: bytes.len(),
            bytes,
        }
    }

    /// Decode from the quoted JSON text form, e.g. `"B8hBALggAQ=="`
    pub fn decode(text: &str) -> Result<Self> {
        let unquoted: String = serde_json::from_str(text)
            .map_err(|e| Error::Format(format!("unquoting raw payload: {}", e)))?;
        Self::from_base64(&unquoted)
    }

    /// Decode from bare standard (padded) base64
    pub fn from_base64(input: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(input)
            .map_err(|e| Error::Format(format!("base64 decoding raw payload: {}", e)))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Encode into the quoted JSON text form accepted by [`Payload::decode`]
    pub fn encode(&self) -> String {
        format!("\"{}\"", self.to_base64())
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Latitude and longitude in degrees
    pub fn location(&self) -> Result<(f64, f64)> {
        if !self.is_valid() {
            return Err(Error::InvalidPayload);
        }

        let mut buf = &self.bytes[..];
        let latitude = buf.get_uint(3) as f64 / COORDINATE_SCALE;
        let longitude = buf.get_uint(3) as f64 / COORDINATE_SCALE;

        Ok((latitude, longitude))
    }

    /// Transmit power in dBm (7 byte payloads only)
    pub fn power(&self) -> Result<i8> {
        if self.bytes.len() != 7 {
            return Err(Error::InvalidPayload);
        }
        Ok(self.bytes[6] as i8)
    }

    pub fn is_valid(&self) -> bool {
        (6..=7).contains(&self.bytes.len())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Payload::from_base64(&raw).map_err(serde::de::Error::custom)
    }
}

/// How a decoded coordinate is rendered into a tag value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateFormat {
    /// Shortest decimal that round-trips
    Full,
    /// Fixed number of decimals
    Fixed(usize),
}

impl CoordinateFormat {
    pub fn format(&self, value: f64) -> String {
        match self {
            CoordinateFormat::Full => value.to_string(),
            CoordinateFormat::Fixed(decimals) => format!("{:.*}", decimals, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_quoted_base64() {
        let payload = Payload::from_bytes(vec![0x00, 0x01, 0x02, 0x03]);
        let out = payload.encode();

        assert!(out.starts_with('"') && out.ends_with('"'));
        let decoded = STANDARD.decode(&out[1..out.len() - 1]).unwrap();
        assert_eq!(decoded, payload.bytes());
        assert_eq!(decoded.len(), payload.size());
    }

    #[test]
    fn test_roundtrip_preserves_size_and_bytes() {
        for bytes in [vec![], vec![0x00, 0x01, 0x02, 0x03], vec![0xFF; 7]] {
            let original = Payload::from_bytes(bytes.clone());
            let decoded = Payload::decode(&original.encode()).unwrap();
            assert_eq!(decoded.size(), bytes.len());
            assert_eq!(decoded.bytes(), &bytes[..]);
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn test_decode_rejects_unquoted_text() {
        let result = Payload::decode("B8hBALggAQ==");
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let result = Payload::decode("\"not base64!\"");
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[test]
    fn test_location_and_power_from_seven_bytes() {
        // 0x07C841 = 510017, 0x00B820 = 47136, power = 1
        let payload = Payload::decode("\"B8hBALggAQ==\"").unwrap();
        assert_eq!(payload.size(), 7);
        assert!(payload.is_valid());

        let (lat, lon) = payload.location().unwrap();
        assert_eq!(lat, 51.0017);
        assert_eq!(lon, 4.7136);
        assert_eq!(payload.power().unwrap(), 1);
    }

    #[test]
    fn test_six_bytes_have_location_but_no_power() {
        let payload = Payload::from_bytes(vec![0x07, 0xC8, 0x41, 0x00, 0xB8, 0x20]);
        assert!(payload.location().is_ok());
        assert!(matches!(payload.power(), Err(Error::InvalidPayload)));
    }

    #[test]
    fn test_power_is_signed() {
        let payload = Payload::from_bytes(vec![0, 0, 0, 0, 0, 0, 0xF6]);
        assert_eq!(payload.power().unwrap(), -10);
    }

    #[test]
    fn test_invalid_lengths() {
        for len in [0usize, 1, 5, 8, 12] {
            let payload = Payload::from_bytes(vec![0xAA; len]);
            assert!(!payload.is_valid());
            assert!(matches!(payload.location(), Err(Error::InvalidPayload)));
            assert!(matches!(payload.power(), Err(Error::InvalidPayload)));
        }
    }

    #[test]
    fn test_serde_in_envelope() {
        #[derive(Deserialize, Serialize)]
        struct Envelope {
            payload_raw: Payload,
        }

        let env: Envelope = serde_json::from_str(r#"{"payload_raw": "AQID"}"#).unwrap();
        assert_eq!(env.payload_raw.bytes(), &[1, 2, 3]);
        assert_eq!(serde_json::to_string(&env).unwrap(), r#"{"payload_raw":"AQID"}"#);

        let bad = serde_json::from_str::<Envelope>(r#"{"payload_raw": "A"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_coordinate_format() {
        assert_eq!(CoordinateFormat::Full.format(51.0017), "51.0017");
        assert_eq!(CoordinateFormat::Full.format(4.7), "4.7");
        assert_eq!(CoordinateFormat::Fixed(4).format(4.7), "4.7000");
    }
}
