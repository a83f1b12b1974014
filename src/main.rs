use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use lora_bridge::config::Config;
use lora_bridge::mqtt::MqttClient;
use lora_bridge::parser::{create_parser, ParserKind};
use lora_bridge::pipeline::run_receiver;
use lora_bridge::sink::{LogSink, MetricSink};

#[derive(Parser)]
#[command(name = "lora-bridge")]
#[command(about = "Store LoRa gateway coverage reported over MQTT in a time-series database")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "lora-bridge.toml")]
    config: PathBuf,

    /// Force debug logging
    #[arg(short, long)]
    debug: bool,

    /// Metric name (overrides [parser] metric_name)
    #[arg(short, long)]
    metric_name: Option<String>,

    /// Uplink format (overrides [parser] kind)
    #[arg(short, long)]
    parser: Option<String>,

    /// Print the supported uplink formats and exit
    #[arg(long)]
    list_parsers: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.list_parsers {
        for (index, kind) in ParserKind::ALL.iter().enumerate() {
            println!("{}: {}", index, kind);
        }
        return Ok(());
    }

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {:?}", cli.config))?;

    // Initialize tracing/logging
    let level = if cli.debug {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)),
        )
        .init();

    info!("lora-bridge v{}", env!("CARGO_PKG_VERSION"));

    // Decoder
    let kind = match &cli.parser {
        Some(name) => name.parse::<ParserKind>(),
        None => config.parser.kind(),
    }
    .context("selecting uplink parser")?;
    let metric_name = cli
        .metric_name
        .as_deref()
        .unwrap_or(&config.parser.metric_name);

    let mut parser = create_parser(kind, metric_name).context("creating uplink parser")?;
    parser.set_default_tags(config.parser.default_tags.clone());
    info!("decoding {} uplinks as {:?} metrics", kind, metric_name);

    // Sink
    let sink = build_sink(&config)?;
    sink.connect().await.context("connecting to metric store")?;

    // Broker
    let mut options = config.mqtt.broker_options();
    options.debug |= cli.debug;
    let client = MqttClient::new(options, info_span!("mqtt"));
    client
        .connect()
        .await
        .with_context(|| format!("connecting to broker {}", config.mqtt.url))?;
    client
        .subscribe(&config.mqtt.topic)
        .await
        .with_context(|| format!("subscribing to {}", config.mqtt.topic))?;

    let incoming = client
        .incoming()
        .await
        .context("delivery channel already taken")?;
    let done = client.done().await.context("client is not connected")?;

    let receiver = run_receiver(incoming, done, parser.as_ref(), sink.as_ref());
    tokio::pin!(receiver);

    info!("Bridge running. Press Ctrl+C to stop.");
    let stopped_early = tokio::select! {
        stats = &mut receiver => Some(stats),
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for Ctrl+C")?;
            None
        }
    };

    match stopped_early {
        Some(stats) => warn!("receiver stopped early: {:?}", stats),
        None => {
            info!("Shutting down...");
            client.close().await;
            receiver.await;
        }
    }

    client.close().await;
    if let Err(e) = sink.close().await {
        error!("closing metric store: {}", e);
    }

    Ok(())
}

#[cfg(feature = "influxdb")]
fn build_sink(config: &Config) -> anyhow::Result<Box<dyn MetricSink>> {
    use lora_bridge::sink::influx::InfluxSink;

    match &config.influxdb {
        Some(influx) => {
            let sink = InfluxSink::new(&influx.options()).context("configuring InfluxDB sink")?;
            Ok(Box::new(sink))
        }
        None => {
            info!("no [influxdb] section, running decode only");
            Ok(Box::new(LogSink))
        }
    }
}

#[cfg(not(feature = "influxdb"))]
fn build_sink(config: &Config) -> anyhow::Result<Box<dyn MetricSink>> {
    if config.influxdb.is_some() {
        info!("InfluxDB configured but influxdb feature not enabled");
    }
    info!("Running in decode only mode");
    Ok(Box::new(LogSink))
}
