//! Connection management: state reporting, message dispatch, and reconnection.

use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tokio_util::sync::CancellationToken;

use crate::transport::{Connector, Transport, TransportEvent, TransportEvents};
use crate::types::{ConnectionConfig, ConnectionState, Error, Payload};
use crate::websocket::WsConnector;

type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;
type MessageHandler = Arc<dyn Fn(Payload) + Send + Sync>;

fn default_state_handler() -> StateHandler {
    Arc::new(|_: ConnectionState| {})
}

fn default_message_handler() -> MessageHandler {
    Arc::new(|payload: Payload| tracing::debug!(?payload, "Message from server"))
}

/// A persistent, self-healing connection to a single server endpoint.
///
/// Construction starts the first connection attempt. Whenever the transport
/// closes, a new attempt is made after the configured retry delay, until
/// [`close`](ServerConnection::close) is called or the connection is dropped.
///
/// Handlers run on the runtime's driver task. They may call back into the
/// same connection (`send`, `close`, handler registration).
pub struct ServerConnection<C: Connector = WsConnector> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Connector> {
    endpoint: String,
    config: ConnectionConfig,
    connector: C,
    /// Held while handlers run and while closing, so that `close` returning
    /// means no handler is running or will run.
    dispatch: ReentrantMutex<()>,
    inner: Mutex<Inner<C::Transport>>,
    /// Cancels the pending retry and stops the driver task.
    shutdown: CancellationToken,
}

struct Inner<T> {
    transport: Option<T>,
    shutting_down: bool,
    on_state_change: StateHandler,
    on_message: MessageHandler,
}

impl ServerConnection<WsConnector> {
    /// Connect to a `ws://` or `wss://` endpoint.
    ///
    /// Must be called from within a tokio runtime. Only a malformed endpoint
    /// or a missing runtime is reported here; transport failures show up as
    /// state changes followed by automatic retries.
    pub fn connect(endpoint: impl Into<String>, config: ConnectionConfig) -> Result<Self, Error> {
        let endpoint = endpoint.into();
        let url = url::Url::parse(&endpoint)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidEndpoint(format!(
                "unsupported scheme '{}' in {endpoint}",
                url.scheme()
            )));
        }
        Self::with_connector(endpoint, config, WsConnector)
    }
}

impl<C: Connector> ServerConnection<C> {
    /// Start a connection using a custom [`Connector`].
    pub fn with_connector(
        endpoint: impl Into<String>,
        config: ConnectionConfig,
        connector: C,
    ) -> Result<Self, Error> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let shared = Arc::new(Shared {
            endpoint: endpoint.into(),
            config,
            connector,
            dispatch: ReentrantMutex::new(()),
            inner: Mutex::new(Inner {
                transport: None,
                shutting_down: false,
                on_state_change: default_state_handler(),
                on_message: default_message_handler(),
            }),
            shutdown: CancellationToken::new(),
        });

        if let Some(events) = shared.open_transport() {
            runtime.spawn(run_driver(Arc::clone(&shared), events));
        }

        Ok(Self { shared })
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Current transport state. `Closed` when no transport is held.
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().current_state()
    }

    /// Replace the state-change handler and immediately call it once with
    /// the current state.
    ///
    /// After [`close`](ServerConnection::close) the handler is stored but
    /// never called.
    pub fn on_state_change<F>(&self, handler: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let handler: StateHandler = Arc::new(handler);
        let _dispatch = self.shared.dispatch.lock();
        let state = {
            let mut inner = self.shared.inner.lock();
            inner.on_state_change = Arc::clone(&handler);
            if inner.shutting_down {
                return;
            }
            inner.current_state()
        };
        handler(state);
    }

    /// Replace the message handler. Only messages received from now on are
    /// delivered to it.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.shared.inner.lock().on_message = Arc::new(handler);
    }

    /// Send a payload if the transport can take it.
    ///
    /// Never fails: when the transport is not open the payload is dropped
    /// and the failure is logged. Payloads are not buffered across reconnects.
    pub fn send(&self, payload: impl Into<Payload>) {
        let payload = payload.into();
        let inner = self.shared.inner.lock();
        let Some(transport) = inner.transport.as_ref() else {
            tracing::debug!(len = payload.len(), "No transport, dropping message");
            return;
        };
        if let Err(e) = transport.send(payload) {
            tracing::warn!("Failed to send message to server: {e}");
        }
    }

    /// Shut the connection down for good.
    ///
    /// Cancels any pending retry and closes the transport. Once this returns
    /// no handler will be called again and no new transport is created.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl<C: Connector> Drop for ServerConnection<C> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl<T: Transport> Inner<T> {
    fn current_state(&self) -> ConnectionState {
        self.transport
            .as_ref()
            .map_or(ConnectionState::Closed, T::state)
    }
}

impl<C: Connector> Shared<C> {
    /// Create a fresh transport, replacing the previous one.
    ///
    /// Returns `None` once shut down. Callers must drop the previous event
    /// subscription before calling this.
    fn open_transport(&self) -> Option<TransportEvents> {
        let _dispatch = self.dispatch.lock();
        let (events, handler) = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return None;
            }
            if let Some(mut old) = inner.transport.take() {
                old.close();
            }
            tracing::info!(endpoint = %self.endpoint, "Connecting");
            let (transport, events) = self.connector.connect(&self.endpoint);
            inner.transport = Some(transport);
            (events, Arc::clone(&inner.on_state_change))
        };
        handler(ConnectionState::Connecting);
        Some(events)
    }

    /// Report a state transition. Returns `false` once shut down.
    fn report_state(&self, state: ConnectionState) -> bool {
        let _dispatch = self.dispatch.lock();
        let handler = {
            let inner = self.inner.lock();
            if inner.shutting_down {
                return false;
            }
            Arc::clone(&inner.on_state_change)
        };
        handler(state);
        true
    }

    /// Forward an inbound payload. Returns `false` once shut down.
    fn deliver(&self, payload: Payload) -> bool {
        let _dispatch = self.dispatch.lock();
        let handler = {
            let inner = self.inner.lock();
            if inner.shutting_down {
                return false;
            }
            Arc::clone(&inner.on_message)
        };
        handler(payload);
        true
    }

    fn close(&self) {
        let _dispatch = self.dispatch.lock();
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            return;
        }
        inner.shutting_down = true;
        self.shutdown.cancel();
        if let Some(mut transport) = inner.transport.take() {
            transport.close();
        }
        tracing::info!(endpoint = %self.endpoint, "Connection closed");
    }
}

// ---------------------------------------------------------------------------
// Driver task
// ---------------------------------------------------------------------------

enum Outcome {
    Closed,
    Shutdown,
}

/// Pump events of the current transport, then reconnect after the retry
/// delay. Exits on shutdown.
async fn run_driver<C: Connector>(shared: Arc<Shared<C>>, mut events: TransportEvents) {
    let retry_delay = shared.config.retry_delay();

    loop {
        if let Outcome::Shutdown = pump_events(&shared, &mut events).await {
            return;
        }

        if !shared.report_state(ConnectionState::Closed) {
            return;
        }
        tracing::info!(
            retry_delay_ms = shared.config.retry_delay_ms,
            "Connection closed, reconnecting"
        );

        tokio::select! {
            () = tokio::time::sleep(retry_delay) => {}
            () = shared.shutdown.cancelled() => return,
        }

        // Detach from the old transport before creating its replacement
        drop(events);
        events = match shared.open_transport() {
            Some(events) => events,
            None => return,
        };
    }
}

async fn pump_events<C: Connector>(shared: &Shared<C>, events: &mut TransportEvents) -> Outcome {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            () = shared.shutdown.cancelled() => return Outcome::Shutdown,
        };

        let alive = match event {
            Some(TransportEvent::Opened) => {
                tracing::info!(endpoint = %shared.endpoint, "Connected");
                shared.report_state(ConnectionState::Open)
            }
            Some(TransportEvent::Message(payload)) => shared.deliver(payload),
            Some(TransportEvent::Errored(e)) => {
                tracing::warn!("Transport error: {e}");
                true
            }
            Some(TransportEvent::Closed) | None => return Outcome::Closed,
        };
        if !alive {
            return Outcome::Shutdown;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc;

    // Scripted transport: tests decide when events fire.

    struct Link {
        events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
        state: Arc<Mutex<ConnectionState>>,
        sent: Arc<Mutex<Vec<Payload>>>,
        closed: Arc<AtomicBool>,
    }

    impl Link {
        fn emit(&self, event: TransportEvent) {
            if let Some(events) = self.events.lock().as_ref() {
                let _ = events.send(event);
            }
        }

        fn open(&self) {
            *self.state.lock() = ConnectionState::Open;
            self.emit(TransportEvent::Opened);
        }

        fn drop_connection(&self) {
            *self.state.lock() = ConnectionState::Closed;
            self.emit(TransportEvent::Closed);
        }

        fn error(&self) {
            self.emit(TransportEvent::Errored(Error::TransportGone));
        }

        /// End the event stream without a `Closed` event.
        fn hang_up(&self) {
            *self.state.lock() = ConnectionState::Closed;
            self.events.lock().take();
        }

        fn deliver(&self, payload: impl Into<Payload>) {
            self.emit(TransportEvent::Message(payload.into()));
        }

        fn is_subscribed(&self) -> bool {
            self.events
                .lock()
                .as_ref()
                .is_some_and(|events| !events.is_closed())
        }
    }

    struct ScriptedTransport {
        state: Arc<Mutex<ConnectionState>>,
        sent: Arc<Mutex<Vec<Payload>>>,
        closed: Arc<AtomicBool>,
    }

    impl Transport for ScriptedTransport {
        fn state(&self) -> ConnectionState {
            *self.state.lock()
        }

        fn send(&self, payload: Payload) -> Result<(), Error> {
            let state = self.state();
            if state != ConnectionState::Open {
                return Err(Error::NotOpen(state));
            }
            self.sent.lock().push(payload);
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct ScriptedConnector {
        links: Arc<Mutex<Vec<Arc<Link>>>>,
    }

    impl ScriptedConnector {
        fn count(&self) -> usize {
            self.links.lock().len()
        }

        fn link(&self, index: usize) -> Arc<Link> {
            Arc::clone(&self.links.lock()[index])
        }

        fn subscribed(&self) -> usize {
            self.links.lock().iter().filter(|l| l.is_subscribed()).count()
        }
    }

    impl Connector for ScriptedConnector {
        type Transport = ScriptedTransport;

        fn connect(&self, _endpoint: &str) -> (ScriptedTransport, TransportEvents) {
            // At most one live subscription at any time
            assert_eq!(self.subscribed(), 0, "previous transport still subscribed");

            let (tx, rx) = mpsc::unbounded_channel();
            let link = Arc::new(Link {
                events: Mutex::new(Some(tx)),
                state: Arc::new(Mutex::new(ConnectionState::Connecting)),
                sent: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(AtomicBool::new(false)),
            });
            let transport = ScriptedTransport {
                state: Arc::clone(&link.state),
                sent: Arc::clone(&link.sent),
                closed: Arc::clone(&link.closed),
            };
            self.links.lock().push(link);
            (transport, rx)
        }
    }

    type Recorded<T> = Arc<Mutex<Vec<T>>>;

    fn record_states(conn: &ServerConnection<ScriptedConnector>) -> Recorded<ConnectionState> {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        conn.on_state_change(move |s| sink.lock().push(s));
        states
    }

    fn record_messages(conn: &ServerConnection<ScriptedConnector>) -> Recorded<Payload> {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&messages);
        conn.on_message(move |m| sink.lock().push(m));
        messages
    }

    fn connect(retry_delay_ms: u64) -> (ServerConnection<ScriptedConnector>, ScriptedConnector) {
        let connector = ScriptedConnector::default();
        let conn = ServerConnection::with_connector(
            "ws://server.test/ws",
            ConnectionConfig { retry_delay_ms },
            connector.clone(),
        )
        .unwrap();
        (conn, connector)
    }

    /// Let the driver task process everything queued so far.
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    use ConnectionState::{Closed, Connecting, Open};

    #[tokio::test(start_paused = true)]
    async fn construction_starts_connecting() {
        let (conn, connector) = connect(1000);
        assert_eq!(connector.count(), 1);
        assert_eq!(conn.state(), Connecting);
        assert_eq!(conn.endpoint(), "ws://server.test/ws");
    }

    #[tokio::test(start_paused = true)]
    async fn reports_connecting_then_open() {
        let (conn, connector) = connect(1000);
        let states = record_states(&conn);

        connector.link(0).open();
        settle().await;

        assert_eq!(*states.lock(), vec![Connecting, Open]);
        assert_eq!(conn.state(), Open);
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_sees_current_state() {
        let (conn, connector) = connect(1000);
        connector.link(0).open();
        settle().await;

        let states = record_states(&conn);
        assert_eq!(*states.lock(), vec![Open]);
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_state_handler_stops_old_one() {
        let (conn, connector) = connect(1000);
        let first = record_states(&conn);
        let second = record_states(&conn);

        connector.link(0).open();
        settle().await;

        assert_eq!(*first.lock(), vec![Connecting]);
        assert_eq!(*second.lock(), vec![Connecting, Open]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_retry_delay() {
        let (conn, connector) = connect(1000);
        let states = record_states(&conn);

        connector.link(0).open();
        connector.link(0).drop_connection();
        settle().await;
        assert_eq!(*states.lock(), vec![Connecting, Open, Closed]);
        assert_eq!(connector.count(), 1);

        tokio::time::advance(Duration::from_millis(999)).await;
        settle().await;
        assert_eq!(connector.count(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(connector.count(), 2);
        assert_eq!(*states.lock(), vec![Connecting, Open, Closed, Connecting]);
        assert!(connector.link(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn schedules_exactly_one_retry_per_close() {
        let (_conn, connector) = connect(500);

        connector.link(0).drop_connection();
        settle().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        // The new transport never closed, so nothing else is scheduled
        assert_eq!(connector.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_retry_indefinitely() {
        let (conn, connector) = connect(100);
        let states = record_states(&conn);

        for attempt in 0..5 {
            connector.link(attempt).drop_connection();
            settle().await;
            tokio::time::advance(Duration::from_millis(100)).await;
            settle().await;
        }

        assert_eq!(connector.count(), 6);
        assert_eq!(connector.subscribed(), 1);
        let expected: Vec<_> = std::iter::once(Connecting)
            .chain(std::iter::repeat_n([Closed, Connecting], 5).flatten())
            .collect();
        assert_eq!(*states.lock(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_alone_does_not_reconnect() {
        let (conn, connector) = connect(100);
        let states = record_states(&conn);

        connector.link(0).open();
        connector.link(0).error();
        settle().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(*states.lock(), vec![Connecting, Open]);
        assert_eq!(connector.count(), 1);
        assert!(connector.link(0).is_subscribed());
    }

    #[tokio::test(start_paused = true)]
    async fn event_stream_end_counts_as_close() {
        let (conn, connector) = connect(100);
        let states = record_states(&conn);

        connector.link(0).open();
        settle().await;
        connector.link(0).hang_up();
        settle().await;
        assert_eq!(*states.lock(), vec![Connecting, Open, Closed]);
        assert_eq!(connector.count(), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(connector.count(), 2);
        assert_eq!(*states.lock(), vec![Connecting, Open, Closed, Connecting]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_transport_events_are_ignored() {
        let (conn, connector) = connect(100);
        let messages = record_messages(&conn);

        connector.link(0).drop_connection();
        settle().await;
        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(connector.count(), 2);

        // The first transport is detached; anything it emits goes nowhere
        assert!(!connector.link(0).is_subscribed());
        connector.link(0).deliver("stale");
        connector.link(1).open();
        connector.link(1).deliver("fresh");
        settle().await;

        assert_eq!(*messages.lock(), vec![Payload::from("fresh")]);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_pass_through_in_order() {
        let (conn, connector) = connect(1000);
        let messages = record_messages(&conn);

        let link = connector.link(0);
        link.open();
        link.deliver("one");
        link.deliver(vec![0u8, 159, 146, 150]);
        link.deliver("three");
        settle().await;

        assert_eq!(
            *messages.lock(),
            vec![
                Payload::from("one"),
                Payload::from(vec![0u8, 159, 146, 150]),
                Payload::from("three"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn message_handler_is_not_replayed() {
        let (conn, connector) = connect(1000);
        let link = connector.link(0);
        link.open();
        link.deliver("before");
        settle().await;

        let messages = record_messages(&conn);
        link.deliver("after");
        settle().await;
        assert_eq!(*messages.lock(), vec![Payload::from("after")]);
    }

    #[tokio::test(start_paused = true)]
    async fn send_goes_to_open_transport() {
        let (conn, connector) = connect(1000);
        connector.link(0).open();
        settle().await;

        conn.send("ping");
        assert_eq!(*connector.link(0).sent.lock(), vec![Payload::from("ping")]);
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_not_open_is_dropped() {
        let (conn, connector) = connect(1000);

        // Connecting: the transport refuses, nothing is raised
        conn.send("ping");
        assert!(connector.link(0).sent.lock().is_empty());

        // Closed and waiting for retry: dropped, not buffered for later
        connector.link(0).drop_connection();
        settle().await;
        conn.send("lost");
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        connector.link(1).open();
        settle().await;
        assert!(connector.link(1).sent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_connecting_stops_everything() {
        let (conn, connector) = connect(1000);
        let states = record_states(&conn);
        let messages = record_messages(&conn);

        conn.close();
        assert!(connector.link(0).closed.load(Ordering::SeqCst));
        assert_eq!(conn.state(), Closed);

        // The discarded transport eventually reports its close
        connector.link(0).deliver("late");
        connector.link(0).drop_connection();
        settle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(connector.count(), 1);
        assert_eq!(*states.lock(), vec![Connecting]);
        assert!(messages.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_retry() {
        let (conn, connector) = connect(1000);
        let states = record_states(&conn);

        connector.link(0).drop_connection();
        settle().await;
        conn.close();
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(connector.count(), 1);
        assert_eq!(*states.lock(), vec![Connecting, Closed]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_state_echo_after_close() {
        let (conn, _connector) = connect(1000);
        conn.close();
        let states = record_states(&conn);
        assert!(states.lock().is_empty());
        // Idempotent
        conn.close();
    }

    #[tokio::test(start_paused = true)]
    async fn drop_closes_connection() {
        let (conn, connector) = connect(1000);
        drop(conn);
        assert!(connector.link(0).closed.load(Ordering::SeqCst));

        connector.link(0).drop_connection();
        settle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(connector.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_may_close_connection() {
        let (conn, connector) = connect(1000);
        let conn = Arc::new(conn);
        let states = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&conn);
        let sink = Arc::clone(&states);
        conn.on_state_change(move |s| {
            sink.lock().push(s);
            if s == Open
                && let Some(conn) = weak.upgrade()
            {
                conn.close();
            }
        });

        connector.link(0).open();
        connector.link(0).drop_connection();
        settle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(*states.lock(), vec![Connecting, Open]);
        assert_eq!(connector.count(), 1);
    }

    #[test]
    fn construction_outside_runtime_fails() {
        let result = ServerConnection::with_connector(
            "ws://server.test/ws",
            ConnectionConfig::default(),
            ScriptedConnector::default(),
        );
        assert!(matches!(result, Err(Error::NoRuntime)));
    }

    #[tokio::test]
    async fn rejects_non_websocket_endpoint() {
        let result = ServerConnection::connect("http://server.test/", ConnectionConfig::default());
        assert!(matches!(result, Err(Error::InvalidEndpoint(_))));

        let result = ServerConnection::connect("not a url", ConnectionConfig::default());
        assert!(matches!(result, Err(Error::Url(_))));
    }
}
