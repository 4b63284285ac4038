//! Broadcast echo server: every message a client sends is relayed to all
//! connected clients, the sender included.
//!
//! WebSocket upgrades are only accepted on `/ws` and paths below it; any
//! other path is answered with `404 Not Found`.

use std::net::SocketAddr;

use clap::Args;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::error::CliResult;

/// Messages buffered per client before a slow client starts skipping.
const BROADCAST_CAPACITY: usize = 256;

#[derive(Args)]
/// Clients connect to `ws://<bind>:<port>/ws`.
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8888)]
    pub port: u16,
}

pub async fn run_serve(args: ServeArgs) -> CliResult<()> {
    let listener = TcpListener::bind((args.bind.as_str(), args.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "Server started");

    tokio::select! {
        result = serve(listener) => result,
        () = super::shutdown_signal() => Ok(()),
    }
}

async fn serve(listener: TcpListener) -> CliResult<()> {
    let (tx, _) = broadcast::channel::<tungstenite::Message>(BROADCAST_CAPACITY);

    loop {
        let (tcp, peer) = listener.accept().await?;
        // Subscribe before the handshake so the client sees everything sent
        // after its connection is established.
        let rx = tx.subscribe();
        tokio::spawn(handle_session(tcp, peer, tx.clone(), rx));
    }
}

async fn handle_session(
    tcp: TcpStream,
    peer: SocketAddr,
    tx: broadcast::Sender<tungstenite::Message>,
    mut rx: broadcast::Receiver<tungstenite::Message>,
) {
    let ws = match tokio_tungstenite::accept_hdr_async(tcp, route).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(%peer, "WebSocket handshake failed: {e}");
            return;
        }
    };
    tracing::info!(%peer, "Client connected");
    let (mut ws_write, mut ws_read) = ws.split();

    loop {
        tokio::select! {
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(msg @ tungstenite::Message::Text(_))) => {
                        if let Ok(text) = msg.to_text() {
                            println!("{text}");
                        }
                        let _ = tx.send(msg);
                    }
                    Some(Ok(msg @ tungstenite::Message::Binary(_))) => {
                        let _ = tx.send(msg);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(%peer, "read: {e}");
                        break;
                    }
                    None => break,
                }
            }

            msg = rx.recv() => {
                match msg {
                    Ok(msg) => {
                        if let Err(e) = ws_write.send(msg).await {
                            tracing::warn!(%peer, "write: {e}");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%peer, skipped, "Client lagging, skipped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    tracing::info!(%peer, "Client disconnected");
}

fn is_ws_path(path: &str) -> bool {
    path == "/ws" || path.starts_with("/ws/")
}

#[allow(clippy::result_large_err)]
fn route(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if is_ws_path(request.uri().path()) {
        return Ok(response);
    }
    let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
    *rejection.status_mut() = StatusCode::NOT_FOUND;
    Err(rejection)
}
