//! Receive loop: broker messages -> decoder -> sink

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::mqtt::InboundMessage;
use crate::parser::Parser;
use crate::sink::MetricSink;

/// Counters reported when the receive loop stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Messages taken off the delivery channel
    pub received: u64,
    /// Messages the decoder refused
    pub rejected: u64,
    /// Metrics accepted by the sink
    pub written: u64,
    /// Metrics lost to failed sink writes
    pub dropped: u64,
}

/// Decode and store messages until `done` is set or the channel closes.
///
/// A set done signal wins over messages still queued. One failing message
/// or sink write never stops the loop.
pub async fn run_receiver(
    mut incoming: mpsc::Receiver<InboundMessage>,
    mut done: watch::Receiver<bool>,
    parser: &dyn Parser,
    sink: &dyn MetricSink,
) -> ReceiverStats {
    let mut stats = ReceiverStats::default();

    loop {
        if *done.borrow() {
            debug!("done signalled, stopping receiver");
            break;
        }

        let message = tokio::select! {
            biased;
            changed = done.changed() => {
                if changed.is_err() {
                    break;
                }
                None
            }
            message = incoming.recv() => match message {
                Some(message) => Some(message),
                None => break,
            },
        };
        let Some(message) = message else {
            continue;
        };

        stats.received += 1;

        let metrics = match parser.parse(&message.payload) {
            Ok(metrics) => metrics,
            Err(e) => {
                stats.rejected += 1;
                warn!(
                    topic = %message.topic,
                    error = %e,
                    "unable to parse message: {}",
                    String::from_utf8_lossy(&message.payload)
                );
                continue;
            }
        };

        match sink.write(&metrics).await {
            Ok(()) => {
                stats.written += metrics.len() as u64;
                debug!(topic = %message.topic, "stored {} metric(s)", metrics.len());
            }
            Err(e) => {
                stats.dropped += metrics.len() as u64;
                error!(topic = %message.topic, error = %e, "failed to write metrics");
            }
        }
    }

    info!(
        "receiver stopped: {} received, {} rejected, {} written, {} dropped",
        stats.received, stats.rejected, stats.written, stats.dropped
    );
    stats
}
