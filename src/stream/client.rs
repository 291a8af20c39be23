use super::{Frame, StreamEndpoint, invoke_guarded};
use crate::auth::AccessToken;
use crate::error::{Error, HandlerError};
use crate::model::Event;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) type EventCallback = Arc<dyn Fn(Event) -> Result<(), HandlerError> + Send + Sync>;
pub(crate) type LifecycleCallback = Arc<dyn Fn() -> Result<(), HandlerError> + Send + Sync>;
pub(crate) type ErrorCallback = Arc<dyn Fn(&Error) -> Result<(), HandlerError> + Send + Sync>;

/// A single streaming connection, without any opinion on when to reconnect.
#[async_trait::async_trait]
pub(crate) trait StreamClient: Send + Sync {
    /// Open a new connection, closing the current one first.
    async fn open(&self, token: &AccessToken) -> Result<(), Error>;
    /// Close the connection. Does nothing when there is none.
    async fn close(&self) -> Result<(), Error>;
    /// Send a liveness frame. Does nothing when not connected.
    async fn ping(&self);
    fn is_connected(&self) -> bool;
    fn is_connecting(&self) -> bool;
    fn set_on_event_callback(&self, callback: EventCallback);
    fn set_on_connected_callback(&self, callback: LifecycleCallback);
    fn set_on_disconnected_callback(&self, callback: LifecycleCallback);
    fn set_on_error_callback(&self, callback: ErrorCallback);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    /// The socket is open but the backend has not proven the connection yet.
    Connecting,
    Connected,
}

struct Connection {
    phase: Phase,
    /// Bumped on every open and close, so that a reader task of a replaced socket can tell it
    /// is no longer current.
    generation: u64,
}

#[derive(Default, Clone)]
struct Callbacks {
    on_event: Option<EventCallback>,
    on_connected: Option<LifecycleCallback>,
    on_disconnected: Option<LifecycleCallback>,
    on_error: Option<ErrorCallback>,
}

/// State shared between the client and the reader task of the current socket.
struct Shared {
    endpoint: Arc<dyn StreamEndpoint>,
    connection: parking_lot::Mutex<Connection>,
    callbacks: parking_lot::Mutex<Callbacks>,
}

pub(crate) struct WebSocketClient {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<SplitSink<Socket, Message>>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketClient {
    pub(crate) fn new(endpoint: Arc<dyn StreamEndpoint>) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint,
                connection: parking_lot::Mutex::new(Connection {
                    phase: Phase::Disconnected,
                    generation: 0,
                }),
                callbacks: Default::default(),
            }),
            writer: tokio::sync::Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl StreamClient for WebSocketClient {
    async fn open(&self, token: &AccessToken) -> Result<(), Error> {
        self.close().await?;
        let request = self.shared.endpoint.connect_request(token).await?;
        let generation = self.shared.begin_connecting();
        let (socket, response) = match tokio_tungstenite::connect_async(request).await {
            Ok(connected) => connected,
            Err(e) => {
                self.shared.abandon(generation);
                return Err(Error::WebsocketConnect(e));
            }
        };
        debug!(?response, "event stream socket opened");
        let (writer, reader) = socket.split();
        *self.writer.lock().await = Some(writer);
        let task = tokio::spawn(Arc::clone(&self.shared).read(reader, generation));
        if let Some(previous) = self.reader.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.abandon_current();
        let Some(mut writer) = self.writer.lock().await.take() else {
            return Ok(());
        };
        debug!("closing the event stream socket");
        match writer.close().await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(Error::Websocket(e)),
        }
    }

    async fn ping(&self) {
        if !self.is_connected() {
            return;
        }
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return;
        };
        debug!("sending ping");
        let ping = Message::Ping(Bytes::from_static(b"still there?"));
        if let Err(e) = writer.send(ping).await {
            warn!(error = &e as &dyn std::error::Error, "could not send a ping");
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.phase() == Phase::Connected
    }

    fn is_connecting(&self) -> bool {
        self.shared.phase() == Phase::Connecting
    }

    fn set_on_event_callback(&self, callback: EventCallback) {
        self.shared.callbacks.lock().on_event = Some(callback);
    }

    fn set_on_connected_callback(&self, callback: LifecycleCallback) {
        self.shared.callbacks.lock().on_connected = Some(callback);
    }

    fn set_on_disconnected_callback(&self, callback: LifecycleCallback) {
        self.shared.callbacks.lock().on_disconnected = Some(callback);
    }

    fn set_on_error_callback(&self, callback: ErrorCallback) {
        self.shared.callbacks.lock().on_error = Some(callback);
    }
}

impl Shared {
    fn phase(&self) -> Phase {
        self.connection.lock().phase
    }

    fn begin_connecting(&self) -> u64 {
        let mut connection = self.connection.lock();
        connection.generation += 1;
        connection.phase = Phase::Connecting;
        connection.generation
    }

    /// Forget about the socket of `generation` without notifying anybody.
    fn abandon(&self, generation: u64) {
        let mut connection = self.connection.lock();
        if connection.generation == generation {
            connection.phase = Phase::Disconnected;
        }
    }

    fn abandon_current(&self) {
        let mut connection = self.connection.lock();
        connection.generation += 1;
        connection.phase = Phase::Disconnected;
    }

    async fn read(self: Arc<Self>, mut reader: SplitStream<Socket>, generation: u64) {
        while let Some(result) = reader.next().await {
            match result {
                Ok(Message::Text(text)) => self.on_message_received(text.as_bytes()),
                Ok(Message::Binary(bytes)) => self.on_message_received(&bytes),
                // tungstenite queues the pong itself.
                Ok(Message::Ping(_)) => debug!("got a ping"),
                Ok(Message::Pong(_)) => debug!("got a pong!"),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "event stream closed by the backend");
                    break;
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    self.on_socket_error(Error::Websocket(e));
                    break;
                }
            }
        }
        self.on_socket_closed(generation);
    }

    /// Handle one inbound payload. Never fails: a bad frame is logged and the stream goes on.
    fn on_message_received(&self, payload: &[u8]) {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        let frame = match self.endpoint.decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    error = &e as &dyn std::error::Error,
                    payload = %String::from_utf8_lossy(payload),
                    "could not decode an event stream frame"
                );
                return;
            }
        };
        self.on_connection_proven();
        match frame {
            Frame::Handshake { connection_id } => {
                debug!(%connection_id, "event stream handshake received");
            }
            Frame::Skipped { kind } => debug!(%kind, "skipping an event stream frame"),
            Frame::Event(event) => {
                debug!(?event, "received an event");
                let callback = self.callbacks.lock().on_event.clone();
                if let Some(callback) = callback {
                    invoke_guarded("event", || callback(event));
                }
            }
        }
    }

    fn on_connection_proven(&self) {
        {
            let mut connection = self.connection.lock();
            if connection.phase != Phase::Connecting {
                return;
            }
            connection.phase = Phase::Connected;
        }
        info!("event stream connected");
        let callback = self.callbacks.lock().on_connected.clone();
        if let Some(callback) = callback {
            invoke_guarded("connected", || callback());
        }
    }

    fn on_socket_error(&self, error: Error) {
        error!(error = &error as &dyn std::error::Error, "event stream socket error");
        let callback = self.callbacks.lock().on_error.clone();
        if let Some(callback) = callback {
            invoke_guarded("error", || callback(&error));
        }
    }

    fn on_socket_closed(&self, generation: u64) {
        let previous = {
            let mut connection = self.connection.lock();
            if connection.generation != generation {
                return;
            }
            std::mem::replace(&mut connection.phase, Phase::Disconnected)
        };
        match previous {
            Phase::Connected => {
                info!("event stream disconnected");
                let callback = self.callbacks.lock().on_disconnected.clone();
                if let Some(callback) = callback {
                    invoke_guarded("disconnected", || callback());
                }
            }
            // The handshake itself failed; telling anybody would only invite a reconnect storm.
            Phase::Connecting => warn!("event stream closed before the connection was established"),
            Phase::Disconnected => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendor::husqvarna::HusqvarnaEndpoint;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client() -> WebSocketClient {
        client_for(Arc::new(HusqvarnaEndpoint::new("app-key".into())))
    }

    fn client_for(endpoint: Arc<dyn StreamEndpoint>) -> WebSocketClient {
        WebSocketClient::new(endpoint)
    }

    struct SkippingEndpoint;

    #[async_trait::async_trait]
    impl StreamEndpoint for SkippingEndpoint {
        async fn connect_request(
            &self,
            _: &AccessToken,
        ) -> Result<tungstenite::handshake::client::Request, Error> {
            unimplemented!("never connects")
        }

        fn decode(&self, payload: &[u8]) -> Result<Frame, serde_json::Error> {
            Ok(Frame::Skipped {
                kind: String::from_utf8_lossy(payload).into_owned(),
            })
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> LifecycleCallback {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn collecting(events: &Arc<parking_lot::Mutex<Vec<Event>>>) -> EventCallback {
        let events = Arc::clone(events);
        Arc::new(move |event| {
            events.lock().push(event);
            Ok(())
        })
    }

    const HANDSHAKE: &[u8] = br#"{"connectionId":"abc=","ready":true}"#;
    const STATUS: &[u8] =
        br#"{"id":"m-1","type":"status-event","attributes":{"battery":{"batteryPercent":80}}}"#;

    #[test]
    fn bad_frames_are_swallowed() {
        let client = client();
        let events = Arc::default();
        client.set_on_event_callback(collecting(&events));
        client.shared.begin_connecting();
        let payloads: [&[u8]; 6] = [
            b"",
            b"   ",
            b"{",
            b"not json",
            b"[1,2]",
            b"\"status-event\"",
        ];
        for payload in payloads {
            client.shared.on_message_received(payload);
        }
        assert!(events.lock().is_empty());
        assert!(client.is_connecting());
    }

    #[test]
    fn handshake_proves_the_connection() {
        let client = client();
        let connected = Arc::new(AtomicUsize::new(0));
        client.set_on_connected_callback(counting(&connected));
        client.shared.begin_connecting();
        assert!(client.is_connecting());
        assert!(!client.is_connected());
        client.shared.on_message_received(HANDSHAKE);
        assert!(client.is_connected());
        client.shared.on_message_received(HANDSHAKE);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn skipped_frames_prove_the_connection_only() {
        let client = client_for(Arc::new(SkippingEndpoint));
        let events = Arc::default();
        client.set_on_event_callback(collecting(&events));
        client.shared.begin_connecting();
        client.shared.on_message_received(b"DEVICE");
        assert!(client.is_connected());
        assert!(events.lock().is_empty());
    }

    #[test]
    fn events_reach_the_callback() {
        let client = client();
        let events = Arc::default();
        client.set_on_event_callback(collecting(&events));
        client.shared.begin_connecting();
        client.shared.on_message_received(STATUS);
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Status(s) if s.battery_percent == Some(80)));
        assert!(client.is_connected());
    }

    #[test]
    fn failing_callbacks_do_not_escape() {
        let client = client();
        client.set_on_event_callback(Arc::new(|_: Event| -> Result<(), HandlerError> {
            Err("consumer went away".into())
        }));
        client.set_on_connected_callback(Arc::new(|| -> Result<(), HandlerError> {
            panic!("connected handler exploded")
        }));
        client.shared.begin_connecting();
        client.shared.on_message_received(STATUS);
        assert!(client.is_connected());
    }

    #[test]
    fn close_while_connecting_is_not_a_disconnect() {
        let client = client();
        let disconnected = Arc::new(AtomicUsize::new(0));
        client.set_on_disconnected_callback(counting(&disconnected));
        let generation = client.shared.begin_connecting();
        client.shared.on_socket_closed(generation);
        assert_eq!(disconnected.load(Ordering::SeqCst), 0);
        assert!(!client.is_connecting());
    }

    #[test]
    fn close_while_connected_is_a_disconnect() {
        let client = client();
        let disconnected = Arc::new(AtomicUsize::new(0));
        client.set_on_disconnected_callback(counting(&disconnected));
        let generation = client.shared.begin_connecting();
        client.shared.on_message_received(HANDSHAKE);
        client.shared.on_socket_closed(generation);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert!(!client.is_connected());
    }

    #[test]
    fn stale_reader_cannot_disconnect_a_newer_socket() {
        let client = client();
        let disconnected = Arc::new(AtomicUsize::new(0));
        client.set_on_disconnected_callback(counting(&disconnected));
        let stale = client.shared.begin_connecting();
        client.shared.begin_connecting();
        client.shared.on_message_received(HANDSHAKE);
        client.shared.on_socket_closed(stale);
        assert!(client.is_connected());
        assert_eq!(disconnected.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn socket_errors_reach_the_error_callback() {
        let client = client();
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        client.set_on_error_callback(Arc::new(move |_: &Error| -> Result<(), HandlerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("and fails itself".into())
        }));
        client
            .shared
            .on_socket_error(Error::Websocket(tungstenite::Error::ConnectionClosed));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_and_ping_without_a_connection_are_no_ops() {
        let client = client();
        let disconnected = Arc::new(AtomicUsize::new(0));
        client.set_on_disconnected_callback(counting(&disconnected));
        client.ping().await;
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(!client.is_connected());
        assert_eq!(disconnected.load(Ordering::SeqCst), 0);
    }
}
