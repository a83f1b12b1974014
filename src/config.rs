use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::Tags;
use crate::mqtt::BrokerOptions;
use crate::parser::{ParserKind, LOCATION_DATA};
use crate::sink::Precision;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub influxdb: Option<InfluxConfig>,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub qos: i32,
    /// Generated when absent
    pub client_id: Option<String>,
    pub topic: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub precision: Precision,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    #[serde(default = "default_parser_kind")]
    pub kind: String,
    #[serde(default = "default_metric_name")]
    pub metric_name: String,
    #[serde(default)]
    pub default_tags: Tags,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_keep_alive() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    1
}

fn default_parser_kind() -> String {
    ParserKind::Ttn.name().to_string()
}

fn default_metric_name() -> String {
    LOCATION_DATA.to_string()
}

/// `lora-bridge-` plus four random characters
pub fn generate_client_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("lora-bridge-{}", &suffix[..4])
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file {:?}: {}", path, e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }
}

impl MqttConfig {
    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            qos: self.qos,
            client_id: self
                .client_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(generate_client_id),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            channel_capacity: self.channel_capacity,
            debug: self.debug,
        }
    }
}

#[cfg(feature = "influxdb")]
impl InfluxConfig {
    pub fn options(&self) -> crate::sink::influx::InfluxOptions {
        crate::sink::influx::InfluxOptions {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            precision: self.precision,
        }
    }
}

impl ParserConfig {
    pub fn kind(&self) -> Result<ParserKind> {
        self.kind.parse()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig {
                url: "tcp://localhost:1883".to_string(),
                username: None,
                password: None,
                qos: 0,
                client_id: None,
                topic: "+/devices/+/up".to_string(),
                debug: false,
                keep_alive_secs: default_keep_alive(),
                channel_capacity: default_channel_capacity(),
            },
            influxdb: None,
            parser: ParserConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            kind: default_parser_kind(),
            metric_name: default_metric_name(),
            default_tags: Tags::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [mqtt]
        url = "tcp://broker.local:1883"
        username = "app"
        password = "key"
        qos = 1
        client_id = "bridge-01"
        topic = "+/devices/+/up"
        debug = true
        keep_alive_secs = 60
        channel_capacity = 8

        [influxdb]
        url = "http://localhost:8086"
        username = "admin"
        password = "secret"
        database = "lora"
        precision = "s"

        [parser]
        kind = "dingnet"
        metric_name = "adr"

        [parser.default_tags]
        site = "leuven"

        [logging]
        level = "debug"
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(FULL).unwrap();

        let options = config.mqtt.broker_options();
        assert_eq!(options.url, "tcp://broker.local:1883");
        assert_eq!(options.client_id, "bridge-01");
        assert_eq!(options.qos, 1);
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert_eq!(options.channel_capacity, 8);
        assert!(options.debug);

        let influx = config.influxdb.unwrap();
        assert_eq!(influx.database, "lora");
        assert_eq!(influx.precision, Precision::Seconds);

        assert_eq!(config.parser.kind().unwrap(), ParserKind::DingNet);
        assert_eq!(config.parser.metric_name, "adr");
        assert_eq!(config.parser.default_tags["site"], "leuven");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(
            r##"
            [mqtt]
            url = "tcp://localhost:1883"
            topic = "#"
            "##,
        )
        .unwrap();

        assert!(config.influxdb.is_none());
        assert_eq!(config.mqtt.qos, 0);
        assert_eq!(config.mqtt.channel_capacity, 1);
        assert_eq!(config.parser.kind().unwrap(), ParserKind::Ttn);
        assert_eq!(config.parser.metric_name, LOCATION_DATA);
        assert_eq!(config.logging.level, "info");

        let options = config.mqtt.broker_options();
        assert!(options.client_id.starts_with("lora-bridge-"));
        assert_eq!(options.client_id.len(), "lora-bridge-".len() + 4);
    }

    #[test]
    fn test_invalid_precision_rejected() {
        let content = r##"
            [mqtt]
            url = "tcp://localhost:1883"
            topic = "#"

            [influxdb]
            url = "http://localhost:8086"
            database = "lora"
            precision = "minutes"
        "##;
        assert!(matches!(Config::parse(content), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_parser_kind() {
        let parser = ParserConfig {
            kind: "loriot".to_string(),
            ..Default::default()
        };
        assert!(matches!(parser.kind(), Err(Error::Selection(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/lora-bridge.toml")),
            Err(Error::Config(_))
        ));
    }
}
