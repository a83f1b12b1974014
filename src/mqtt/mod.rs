//! MQTT transport client
//!
//! Connects to the uplink broker, keeps track of the topics the caller
//! wants, and replays those subscriptions after every unplanned
//! disconnect/reconnect cycle.
//!
//! ## States
//! ```text
//! Disconnected ──connect()──> Connecting ──CONNACK──> Connected
//!                                                      │    ▲
//!                                          (connection │    │ CONNACK
//!                                              lost)   ▼    │ (replay topics)
//!                                                   Reconnecting
//! Connected | Reconnecting ──close()──> Disconnected
//! ```
//!
//! Lifecycle calls, subscription bookkeeping and both connection handlers
//! run under one lock. Inbound messages are not: the event-loop task hands
//! them one by one to a bounded channel and waits while it is full, which
//! stops it from reading the broker socket until the consumer catches up.
//! Keep-alive pings stall with it (see [`BrokerOptions::keep_alive`]).

mod eventloop;
pub mod session;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, QoS};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

use crate::error::{Error, Result};
pub use session::{parse_broker_url, qos_from_level, Session};

/// Pending requests rumqttc may buffer before `try_*` calls fail
const REQUEST_CAPACITY: usize = 64;

/// How long the initial connect may wait for CONNACK
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time given to in-flight broker operations on close
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// `tcp://host:port`
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// 0, 1 or 2; anything else fails `connect`
    pub qos: i32,
    pub client_id: String,
    /// Ping interval. No pings go out while the event loop waits on a full
    /// delivery channel, so the broker drops the connection once the
    /// consumer has been stalled for 1.5x this long; the client then
    /// reconnects and replays its subscriptions.
    pub keep_alive: Duration,
    /// Inbound messages buffered before the event loop waits
    pub channel_capacity: usize,
    /// Trace every broker event
    pub debug: bool,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            url: "tcp://localhost:1883".to_string(),
            username: None,
            password: None,
            qos: 0,
            client_id: "lora-bridge".to_string(),
            keep_alive: Duration::from_secs(30),
            channel_capacity: 1,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// A message received on one of the subscribed topics
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    session: Option<Arc<dyn Session>>,
    qos: Option<QoS>,
    /// topic -> currently wanted; rows are never removed
    subscriptions: HashMap<String, bool>,
    reconnecting: bool,
    incoming: Option<mpsc::Receiver<InboundMessage>>,
    done: Option<watch::Sender<bool>>,
    driver: Option<JoinHandle<()>>,
}

impl Inner {
    fn live_session(&self, op: &str) -> Result<(Arc<dyn Session>, QoS)> {
        match (self.state, &self.session, self.qos) {
            (ConnectionState::Connected, Some(session), Some(qos)) => Ok((session.clone(), qos)),
            _ => Err(Error::State(format!("trying to {} while not connected", op))),
        }
    }
}

struct Shared {
    options: BrokerOptions,
    span: Span,
    inner: Mutex<Inner>,
}

/// MQTT client with automatic re-subscription
#[derive(Clone)]
pub struct MqttClient {
    shared: Arc<Shared>,
}

impl MqttClient {
    /// Create a client (does not connect yet). Broker events and lifecycle
    /// messages are logged inside `span`.
    pub fn new(options: BrokerOptions, span: Span) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                span,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.shared.options
    }

    /// Connect and wait for the broker to accept the session
    pub async fn connect(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;

        let qos = qos_from_level(self.shared.options.qos)?;
        let mqtt_options = session::mqtt_options(&self.shared.options)?;

        if inner.state != ConnectionState::Disconnected {
            return Err(Error::State(format!(
                "trying to connect while {}",
                inner.state
            )));
        }
        inner.state = ConnectionState::Connecting;

        let (client, mut events) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        if let Err(e) = eventloop::await_connack(&mut events, CONNECT_TIMEOUT).await {
            inner.state = ConnectionState::Disconnected;
            return Err(e);
        }

        let (tx, done) = self.attach(&mut inner, Arc::new(client), qos);
        let driver = eventloop::run(self.clone(), events, tx, done, self.shared.options.debug)
            .instrument(self.shared.span.clone());
        inner.driver = Some(tokio::spawn(driver));

        self.shared
            .span
            .in_scope(|| info!("connected to {}", self.shared.options.url));
        Ok(())
    }

    /// Install a fresh session: empty subscription set, new delivery and
    /// done channels.
    fn attach(
        &self,
        inner: &mut Inner,
        session: Arc<dyn Session>,
        qos: QoS,
    ) -> (mpsc::Sender<InboundMessage>, watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel(self.shared.options.channel_capacity.max(1));
        let (done_tx, done_rx) = watch::channel(false);

        inner.session = Some(session);
        inner.qos = Some(qos);
        inner.subscriptions = HashMap::new();
        inner.reconnecting = false;
        inner.incoming = Some(rx);
        inner.done = Some(done_tx);
        inner.state = ConnectionState::Connected;

        (tx, done_rx)
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        let (session, qos) = inner.live_session("subscribe")?;

        session.subscribe(topic, qos)?;
        inner.subscriptions.insert(topic.to_string(), true);

        self.shared
            .span
            .in_scope(|| info!("subscribing to topic: {}", topic));
        Ok(())
    }

    /// Unsubscribe; the topics are kept in the set but no longer replayed
    pub async fn unsubscribe(&self, topics: &[&str]) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        let (session, _) = inner.live_session("unsubscribe")?;

        for topic in topics {
            session.unsubscribe(topic)?;
            inner.subscriptions.insert(topic.to_string(), false);

            self.shared
                .span
                .in_scope(|| info!("un-subscribing from topic: {}", topic));
        }
        Ok(())
    }

    /// Signal shutdown and disconnect. Safe to call more than once.
    pub async fn close(&self) {
        let driver = {
            let mut inner = self.shared.inner.lock().await;
            if inner.state == ConnectionState::Disconnected {
                return;
            }

            if let Some(done) = &inner.done {
                done.send_replace(true);
            }
            if let Some(session) = inner.session.take() {
                if let Err(e) = session.disconnect() {
                    self.shared
                        .span
                        .in_scope(|| warn!("disconnect request failed: {}", e));
                }
            }
            inner.state = ConnectionState::Disconnected;
            inner.reconnecting = false;
            inner.driver.take()
        };

        if let Some(mut handle) = driver {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                debug!("event loop still busy after grace period, aborting");
                handle.abort();
            }
        }

        self.shared.span.in_scope(|| info!("disconnected"));
    }

    /// Take the delivery channel (once per connection)
    pub async fn incoming(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.shared.inner.lock().await.incoming.take()
    }

    /// Shutdown signal; flips to `true` on [`MqttClient::close`]
    pub async fn done(&self) -> Option<watch::Receiver<bool>> {
        self.shared
            .inner
            .lock()
            .await
            .done
            .as_ref()
            .map(|done| done.subscribe())
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.inner.lock().await.state
    }

    /// Snapshot of topic -> wanted
    pub async fn subscriptions(&self) -> HashMap<String, bool> {
        self.shared.inner.lock().await.subscriptions.clone()
    }

    /// Connection-lost handler, called by the event loop
    pub(crate) async fn connection_lost(&self, reason: &str) {
        let mut inner = self.shared.inner.lock().await;
        if inner.state == ConnectionState::Disconnected {
            return;
        }

        warn!("disconnected ({}), reconnecting...", reason);
        inner.reconnecting = true;
        inner.state = ConnectionState::Reconnecting;
    }

    /// On-connect handler, called by the event loop for every CONNACK after
    /// the first one. Replays wanted topics when coming back from a drop.
    pub(crate) async fn connected(&self) {
        let mut inner = self.shared.inner.lock().await;
        if inner.state == ConnectionState::Disconnected {
            return;
        }

        info!("connected");
        inner.state = ConnectionState::Connected;

        if !inner.reconnecting {
            return;
        }

        if let (Some(session), Some(qos)) = (inner.session.clone(), inner.qos) {
            for (topic, wanted) in &inner.subscriptions {
                if *wanted {
                    debug!("re-subscribing to topic: {}", topic);
                    if let Err(e) = session.subscribe(topic, qos) {
                        warn!("re-subscribe failed: {}", e);
                    }
                }
            }
        }
        inner.reconnecting = false;
    }

    /// Connect over an already established session (no network)
    #[cfg(test)]
    pub(crate) async fn connect_with_session(
        &self,
        session: Arc<dyn Session>,
    ) -> Result<mpsc::Sender<InboundMessage>> {
        let mut inner = self.shared.inner.lock().await;
        let qos = qos_from_level(self.shared.options.qos)?;
        let (tx, _) = self.attach(&mut inner, session, qos);
        Ok(tx)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeSession;
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn client() -> MqttClient {
        MqttClient::new(BrokerOptions::default(), Span::none())
    }

    async fn connected_client() -> (MqttClient, Arc<FakeSession>) {
        let client = client();
        let session = Arc::new(FakeSession::default());
        client.connect_with_session(session.clone()).await.unwrap();
        (client, session)
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_qos() {
        for qos in [3, -1] {
            let options = BrokerOptions {
                url: "tcp://127.0.0.1:1".to_string(),
                qos,
                ..Default::default()
            };
            let client = MqttClient::new(options, Span::none());
            assert!(matches!(client.connect().await, Err(Error::Config(_))));
            assert_eq!(client.state().await, ConnectionState::Disconnected);
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let options = BrokerOptions {
            url: "ssl://broker:8883".to_string(),
            ..Default::default()
        };
        let client = MqttClient::new(options, Span::none());
        assert!(matches!(client.connect().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let client = client();
        assert!(matches!(client.subscribe("/test").await, Err(Error::State(_))));
        assert!(matches!(
            client.unsubscribe(&["/test"]).await,
            Err(Error::State(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let (client, session) = connected_client().await;
        assert_eq!(client.state().await, ConnectionState::Connected);

        client.subscribe("/test").await.unwrap();
        assert_eq!(session.subscribed(), vec!["/test"]);
        assert_eq!(client.subscriptions().await.get("/test"), Some(&true));

        client.unsubscribe(&["/test", "/other"]).await.unwrap();
        let subs = client.subscriptions().await;
        assert_eq!(subs.get("/test"), Some(&false));
        assert_eq!(subs.get("/other"), Some(&false));
        assert_eq!(
            *session.unsubscribed.lock().unwrap(),
            vec!["/test".to_string(), "/other".to_string()]
        );
    }

    #[tokio::test]
    async fn test_reconnect_replays_subscriptions() {
        let (client, session) = connected_client().await;
        client.subscribe("t1").await.unwrap();

        client.connection_lost("broker went away").await;
        assert_eq!(client.state().await, ConnectionState::Reconnecting);
        assert!(matches!(client.subscribe("t2").await, Err(Error::State(_))));

        client.connected().await;
        assert_eq!(client.state().await, ConnectionState::Connected);
        assert_eq!(session.subscribed(), vec!["t1", "t1"]);

        // A second cycle replays again
        client.connection_lost("again").await;
        client.connected().await;
        assert_eq!(session.subscribed(), vec!["t1", "t1", "t1"]);
    }

    #[tokio::test]
    async fn test_reconnect_skips_unsubscribed_topics() {
        let (client, session) = connected_client().await;
        client.subscribe("t1").await.unwrap();
        client.subscribe("t2").await.unwrap();
        client.unsubscribe(&["t1"]).await.unwrap();

        client.connection_lost("drop").await;
        client.connected().await;

        assert_eq!(session.subscribed(), vec!["t1", "t2", "t2"]);
    }

    #[tokio::test]
    async fn test_connack_without_drop_does_not_replay() {
        let (client, session) = connected_client().await;
        client.subscribe("t1").await.unwrap();

        client.connected().await;
        assert_eq!(session.subscribed(), vec!["t1"]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_signals_done() {
        let (client, session) = connected_client().await;
        let done = client.done().await.unwrap();
        assert!(!*done.borrow());

        client.close().await;
        assert!(*done.borrow());
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert_eq!(*session.disconnects.lock().unwrap(), 1);

        client.close().await;
        assert_eq!(*session.disconnects.lock().unwrap(), 1);
        assert!(matches!(client.subscribe("t1").await, Err(Error::State(_))));
    }

    #[tokio::test]
    async fn test_handlers_ignored_after_close() {
        let (client, session) = connected_client().await;
        client.subscribe("t1").await.unwrap();
        client.close().await;

        client.connection_lost("late").await;
        client.connected().await;
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert_eq!(session.subscribed(), vec!["t1"]);
    }

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    /// Read one MQTT packet: (fixed header byte, body)
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Accept a session, answer CONNECT and one SUBSCRIBE; returns the
    /// SUBSCRIBE body
    async fn accept_session(listener: &TcpListener) -> (TcpStream, Vec<u8>) {
        let (mut conn, _) = listener.accept().await.unwrap();
        let (kind, _) = read_packet(&mut conn).await.unwrap();
        assert_eq!(kind, 0x10);
        conn.write_all(&CONNACK).await.unwrap();

        let (kind, body) = read_packet(&mut conn).await.unwrap();
        assert_eq!(kind, 0x82);
        conn.write_all(&[0x90, 0x03, body[0], body[1], 0x00])
            .await
            .unwrap();
        (conn, body)
    }

    #[tokio::test]
    async fn test_event_loop_delivers_and_resubscribes_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let (mut first, _) = accept_session(&listener).await;
            // QoS 0 PUBLISH "hi" on t1, then hang up
            first
                .write_all(&[0x30, 0x06, 0x00, 0x02, b't', b'1', b'h', b'i'])
                .await
                .unwrap();
            drop(first);

            // The client comes back on its own and subscribes again
            accept_session(&listener).await
        });

        let options = BrokerOptions {
            url: format!("tcp://127.0.0.1:{}", port),
            ..Default::default()
        };
        let client = MqttClient::new(options, Span::none());
        client.connect().await.unwrap();
        assert_eq!(client.state().await, ConnectionState::Connected);
        client.subscribe("t1").await.unwrap();

        let mut rx = client.incoming().await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.topic, "t1");
        assert_eq!(&msg.payload[..], b"hi");

        let (_second, replayed) = tokio::time::timeout(Duration::from_secs(10), broker)
            .await
            .unwrap()
            .unwrap();
        // packet id, then topic filter "t1"
        assert_eq!(&replayed[2..6], &[0x00, 0x02, b't', b'1']);
        assert_eq!(client.state().await, ConnectionState::Connected);

        client.close().await;
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_delivery_channel_preserves_order() {
        let client = client();
        let tx = client
            .connect_with_session(Arc::new(FakeSession::default()))
            .await
            .unwrap();
        let mut rx = client.incoming().await.unwrap();
        assert!(client.incoming().await.is_none());

        let sender = tokio::spawn(async move {
            for i in 0..5u8 {
                tx.send(InboundMessage {
                    topic: "t1".to_string(),
                    payload: Bytes::from(vec![i]),
                })
                .await
                .unwrap();
            }
        });

        for i in 0..5u8 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.payload[..], [i]);
        }
        sender.await.unwrap();
    }
}
