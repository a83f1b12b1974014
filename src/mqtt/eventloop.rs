//! rumqttc event loop driver
//!
//! rumqttc reconnects by itself on the next `poll` after an error. This task
//! keeps polling, forwards publishes to the delivery channel and turns
//! connection errors and CONNACKs into the client's lost/connected handlers.

use std::time::Duration;

use rumqttc::{Event, EventLoop, Outgoing, Packet};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{InboundMessage, MqttClient};
use crate::error::{Error, Result};

/// Upper bound on the backoff exponent (2^5 = 32s)
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Delay before polling again after the `attempt`-th consecutive failure
pub(crate) fn reconnect_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt.min(MAX_BACKOFF_EXPONENT)))
}

/// Poll until the broker acknowledges the connection
pub(crate) async fn await_connack(events: &mut EventLoop, limit: Duration) -> Result<()> {
    let wait = async {
        loop {
            match events.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    debug!("CONNACK: {:?}", ack.code);
                    return Ok(());
                }
                Ok(_) => continue,
                Err(e) => return Err(Error::Transport(format!("connecting: {}", e))),
            }
        }
    };

    tokio::time::timeout(limit, wait)
        .await
        .map_err(|_| Error::Transport(format!("no CONNACK within {:?}", limit)))?
}

fn is_done(done: &watch::Receiver<bool>) -> bool {
    *done.borrow()
}

/// Drive the connection until the client is closed
pub(crate) async fn run(
    client: MqttClient,
    mut events: EventLoop,
    tx: mpsc::Sender<InboundMessage>,
    mut done: watch::Receiver<bool>,
    trace_events: bool,
) {
    let mut attempt: u32 = 0;

    loop {
        let event = tokio::select! {
            biased;
            _ = done.changed() => None,
            event = events.poll() => Some(event),
        };
        let Some(event) = event else {
            // Keep polling so the queued DISCONNECT is flushed
            continue_after_done(&mut events).await;
            break;
        };

        match event {
            Ok(event) => {
                if trace_events {
                    debug!("mqtt event: {:?}", event);
                }

                match event {
                    Event::Incoming(Packet::ConnAck(_)) => {
                        attempt = 0;
                        client.connected().await;
                    }
                    Event::Incoming(Packet::Publish(publish)) => {
                        if is_done(&done) {
                            continue;
                        }

                        let message = InboundMessage {
                            topic: publish.topic,
                            payload: publish.payload,
                        };

                        // Waits while the consumer is behind
                        let stopped = tokio::select! {
                            biased;
                            _ = done.changed() => true,
                            sent = tx.send(message) => {
                                if sent.is_err() {
                                    debug!("no receiver for inbound message, dropping");
                                }
                                false
                            }
                        };
                        if stopped {
                            continue_after_done(&mut events).await;
                            break;
                        }
                    }
                    Event::Outgoing(Outgoing::Disconnect) => {
                        debug!("disconnect sent");
                        break;
                    }
                    _ => {}
                }
            }
            Err(e) => {
                if is_done(&done) {
                    break;
                }

                client.connection_lost(&e.to_string()).await;

                let delay = reconnect_backoff(attempt);
                attempt = attempt.saturating_add(1);
                debug!("retrying in {:?}", delay);

                tokio::select! {
                    _ = done.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!("event loop stopped");
}

/// Flush the pending DISCONNECT after close; gives up on the first error
async fn continue_after_done(events: &mut EventLoop) {
    loop {
        match events.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => return,
            Ok(event) => {
                if let Event::Incoming(Packet::Publish(publish)) = event {
                    debug!("discarding message on {} received after close", publish.topic);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(reconnect_backoff(0), Duration::from_secs(1));
        assert_eq!(reconnect_backoff(1), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(3), Duration::from_secs(8));
        assert_eq!(reconnect_backoff(5), Duration::from_secs(32));
        assert_eq!(reconnect_backoff(12), Duration::from_secs(32));
        assert_eq!(reconnect_backoff(u32::MAX), Duration::from_secs(32));
    }
}
