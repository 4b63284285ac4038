//! WebSocket transport built on tokio-tungstenite.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::transport::{Connector, Transport, TransportEvent, TransportEvents};
use crate::types::{ConnectionState, Error, Payload};

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Connects to `ws://` and `wss://` endpoints.
///
/// Each call to [`connect`](Connector::connect) spawns one task that owns the
/// socket for the lifetime of that attempt, so it must be called from within
/// a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Transport = WsTransport;

    fn connect(&self, endpoint: &str) -> (WsTransport, TransportEvents) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();

        tokio::spawn(run_socket(
            endpoint.to_string(),
            SocketChannels {
                state: state_tx,
                outbound: outbound_rx,
                events: event_tx,
            },
            cancel.clone(),
        ));

        let transport = WsTransport {
            state: state_rx,
            outbound: outbound_tx,
            _guard: cancel.clone().drop_guard(),
            cancel,
        };
        (transport, event_rx)
    }
}

// ---------------------------------------------------------------------------
// Transport handle
// ---------------------------------------------------------------------------

/// Handle to one WebSocket connection attempt.
///
/// Dropping the handle tears the socket down.
pub struct WsTransport {
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::UnboundedSender<tungstenite::Message>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl Transport for WsTransport {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn send(&self, payload: Payload) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::NotOpen(ConnectionState::Closed));
        }
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(Error::NotOpen(state));
        }
        let frame = match payload {
            Payload::Text(text) => tungstenite::Message::text(text),
            Payload::Binary(data) => tungstenite::Message::binary(data),
        };
        self.outbound.send(frame).map_err(|_| Error::TransportGone)
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Socket task
// ---------------------------------------------------------------------------

struct SocketChannels {
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::UnboundedReceiver<tungstenite::Message>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl SocketChannels {
    fn emit(&self, event: TransportEvent) {
        // The subscriber may already be detached; its events are discarded.
        let _ = self.events.send(event);
    }

    fn finish(self) {
        self.state.send_replace(ConnectionState::Closed);
        self.emit(TransportEvent::Closed);
    }
}

async fn run_socket(url: String, mut ch: SocketChannels, cancel: CancellationToken) {
    let connected = tokio::select! {
        result = tokio_tungstenite::connect_async(url.as_str()) => result,
        () = cancel.cancelled() => {
            tracing::debug!("Connection attempt cancelled");
            ch.finish();
            return;
        }
    };

    let (mut ws_write, mut ws_read) = match connected {
        Ok((ws, _resp)) => ws.split(),
        Err(e) => {
            ch.emit(TransportEvent::Errored(e.into()));
            ch.finish();
            return;
        }
    };

    ch.state.send_replace(ConnectionState::Open);
    ch.emit(TransportEvent::Opened);

    loop {
        tokio::select! {
            frame = ws_read.next() => {
                match handle_frame(&ch, frame) {
                    FrameAction::Continue => {}
                    FrameAction::CloseReceived => {
                        flush_close_reply(&mut ws_write).await;
                        break;
                    }
                    FrameAction::Ended => break,
                }
            }

            msg = ch.outbound.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = ws_write.send(msg).await {
                    ch.emit(TransportEvent::Errored(e.into()));
                    break;
                }
            }

            () = cancel.cancelled() => {
                close_socket(&mut ws_write, &mut ws_read).await;
                break;
            }
        }
    }

    ch.finish();
}

const CLOSE_ACK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

enum FrameAction {
    Continue,
    /// The server started the close handshake; the session is over.
    CloseReceived,
    Ended,
}

/// Forward one inbound frame.
fn handle_frame(
    ch: &SocketChannels,
    frame: Option<Result<tungstenite::Message, tungstenite::Error>>,
) -> FrameAction {
    match frame {
        Some(Ok(tungstenite::Message::Text(text))) => {
            ch.emit(TransportEvent::Message(Payload::Text(
                text.as_str().to_owned(),
            )));
        }
        Some(Ok(tungstenite::Message::Binary(data))) => {
            ch.emit(TransportEvent::Message(Payload::Binary(data)));
        }
        Some(Ok(tungstenite::Message::Close(frame))) => {
            tracing::debug!(?frame, "Server sent close frame");
            return FrameAction::CloseReceived;
        }
        Some(Ok(_)) => {
            // Ping/pong are answered by tungstenite
        }
        Some(Err(e)) => {
            ch.emit(TransportEvent::Errored(e.into()));
            return FrameAction::Ended;
        }
        None => {
            tracing::debug!("WebSocket stream ended");
            return FrameAction::Ended;
        }
    }
    FrameAction::Continue
}

/// Push out the close reply tungstenite queued when the server's close frame
/// arrived. The server may never tear down TCP, so this is bounded.
async fn flush_close_reply(ws_write: &mut WsWrite) {
    match tokio::time::timeout(CLOSE_ACK_TIMEOUT, ws_write.flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Failed to flush close reply: {e}"),
        Err(_) => tracing::debug!("Timed out flushing close reply"),
    }
}

/// Send a close frame and give the server a moment to acknowledge it.
async fn close_socket(ws_write: &mut WsWrite, ws_read: &mut WsRead) {
    if let Err(e) = ws_write.close().await {
        tracing::debug!("Failed to send close frame: {e}");
        return;
    }
    let drain = async { while let Some(Ok(_)) = ws_read.next().await {} };
    let _ = tokio::time::timeout(CLOSE_ACK_TIMEOUT, drain).await;
}
