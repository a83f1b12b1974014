//! Uplink Simulator
//!
//! Publishes TTN-style uplink envelopes to an MQTT broker so the bridge can
//! be exercised end to end without radios or a network server.
//!
//! Usage: cargo run --bin uplink-sim [broker_url] [topic]

use std::env;

use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, QoS};
use serde_json::json;
use tokio::time::{sleep, Duration};

use lora_bridge::config::generate_client_id;
use lora_bridge::mqtt::parse_broker_url;
use lora_bridge::parser::payload::Payload;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let url = env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://localhost:1883".to_string());
    let topic = env::args()
        .nth(2)
        .unwrap_or_else(|| "sim/devices/node-1/up".to_string());

    let (host, port) = parse_broker_url(&url)?;

    println!("LoRa Uplink Simulator");
    println!("  Broker: {}:{}", host, port);
    println!("  Topic:  {}", topic);
    println!();

    let mut options = MqttOptions::new(generate_client_id(), host, port);
    options.set_keep_alive(Duration::from_secs(10));
    let (client, mut events) = AsyncClient::new(options, 16);

    // Drive the connection in the background
    let driver = tokio::spawn(async move {
        loop {
            match events.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(e) => {
                    eprintln!("   Connection error: {}", e);
                    break;
                }
            }
        }
    });

    let scenarios = vec![
        (
            "Coverage uplink (7-byte payload, one gateway)",
            uplink(&[0x07, 0xC8, 0x41, 0x00, 0xB8, 0x20, 0x01], &["eui-a840411d8a2c4150"]),
        ),
        (
            "Coverage uplink without power (6-byte payload)",
            uplink(&[0x07, 0xC8, 0x30, 0x00, 0xB7, 0xF8], &["eui-a840411d8a2c4150"]),
        ),
        (
            "Bad payload length (8 bytes, no location tags)",
            uplink(&[1, 2, 3, 4, 5, 6, 7, 8], &["eui-a840411d8a2c4150"]),
        ),
        (
            "Fan-out (heard by three gateways)",
            uplink(
                &[0x07, 0xC8, 0x41, 0x00, 0xB8, 0x20, 0x0E],
                &["eui-a840411d8a2c4150", "eui-b827ebfffe6b4a1c", "eui-0000024b080e0b7d"],
            ),
        ),
    ];

    for (desc, envelope) in &scenarios {
        let body = serde_json::to_vec(envelope)?;

        println!("Publishing: {}", desc);
        println!("   Size: {} bytes", body.len());

        client
            .publish(topic.as_str(), QoS::AtLeastOnce, false, body)
            .await?;

        sleep(Duration::from_secs(1)).await;
    }

    client.disconnect().await?;
    let _ = tokio::time::timeout(Duration::from_secs(2), driver).await;

    println!("Simulation complete!");
    Ok(())
}

fn uplink(payload: &[u8], gateways: &[&str]) -> serde_json::Value {
    let now = Utc::now();
    let gateways: Vec<_> = gateways
        .iter()
        .enumerate()
        .map(|(i, id)| {
            json!({
                "gateway_id": id,
                "time": now.to_rfc3339(),
                "channel": i,
                "rssi": -80 - 7 * i as i64,
                "snr": 9.5 - 3.0 * i as f64,
            })
        })
        .collect();

    json!({
        "app_id": "sim",
        "dev_id": "node-1",
        "port": 1,
        "counter": 0,
        "payload_raw": Payload::from_bytes(payload.to_vec()),
        "metadata": {
            "time": now.to_rfc3339(),
            "frequency": 868.1,
            "modulation": "LORA",
            "data_rate": "SF7BW125",
            "coding_rate": "4/5",
            "gateways": gateways,
        }
    })
}
