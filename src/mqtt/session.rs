//! Broker session seam
//!
//! The client only needs three requests from a live broker connection.
//! [`rumqttc::AsyncClient`] provides them in production; tests plug in a
//! recording fake. All calls are non-blocking: they queue the request for
//! the event loop, so they are safe to issue while the client lock is held.

use rumqttc::{AsyncClient, MqttOptions, QoS};

use super::BrokerOptions;
use crate::error::{Error, Result};

const DEFAULT_PORT: u16 = 1883;

pub trait Session: Send + Sync {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;
    fn unsubscribe(&self, topic: &str) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
}

impl Session for AsyncClient {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.try_subscribe(topic, qos)
            .map_err(|e| Error::Transport(format!("subscribing to {}: {}", topic, e)))
    }

    fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.try_unsubscribe(topic)
            .map_err(|e| Error::Transport(format!("unsubscribing from {}: {}", topic, e)))
    }

    fn disconnect(&self) -> Result<()> {
        self.try_disconnect()
            .map_err(|e| Error::Transport(format!("disconnecting: {}", e)))
    }
}

/// Map a configured QoS level onto the MQTT delivery guarantee
pub fn qos_from_level(level: i32) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        _ => Err(Error::Config(format!("invalid QoS: {}", level))),
    }
}

/// Split `scheme://host:port` into host and port
pub fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let rest = match url.split_once("://") {
        Some(("tcp", rest)) | Some(("mqtt", rest)) => rest,
        Some((scheme, _)) => {
            return Err(Error::Config(format!(
                "unsupported broker scheme: {}",
                scheme
            )))
        }
        None => url,
    };
    let rest = rest.trim_end_matches('/');

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("invalid broker port {:?}: {}", port, e)))?;
            (host, port)
        }
        None => (rest, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(Error::Config(format!("missing broker host in {:?}", url)));
    }

    Ok((host.to_string(), port))
}

/// Build rumqttc connection options
pub(crate) fn mqtt_options(options: &BrokerOptions) -> Result<MqttOptions> {
    let (host, port) = parse_broker_url(&options.url)?;

    let mut mqtt = MqttOptions::new(options.client_id.as_str(), host, port);
    mqtt.set_keep_alive(options.keep_alive);

    if let (Some(username), Some(password)) = (&options.username, &options.password) {
        if !username.is_empty() && !password.is_empty() {
            mqtt.set_credentials(username.as_str(), password.as_str());
        }
    }

    Ok(mqtt)
}
