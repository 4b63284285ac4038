//! Persistent, self-healing client connection to a single message server.
//!
//! Keeps one logical connection to an endpoint alive over an unreliable
//! transport: whenever the transport closes, a new one is created after a
//! fixed retry delay, until the application closes the connection.
//!
//! # Features
//! - State-change notifications (`connecting` → `open` → `closed`), with an
//!   immediate echo of the current state on subscription
//! - Opaque message pass-through in transport delivery order
//! - Fire-and-forget sends that never fail the caller
//! - WebSocket transport (`ws://` / `wss://`) out of the box, or any
//!   [`Connector`] implementation
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), server_connection::Error> {
//! use server_connection::{ConnectionConfig, ConnectionState, Payload, ServerConnection};
//!
//! let conn = ServerConnection::connect("ws://localhost:8888/ws", ConnectionConfig::default())?;
//! conn.on_state_change(|state| {
//!     if state == ConnectionState::Open {
//!         println!("connected");
//!     }
//! });
//! conn.on_message(|payload| {
//!     if let Payload::Text(text) = payload {
//!         println!("got: {text}");
//!     }
//! });
//! conn.send("hello");
//! conn.close();
//! # Ok(())
//! # }
//! ```

mod connection;
mod transport;
mod types;
mod websocket;

pub use connection::ServerConnection;
pub use transport::{Connector, Transport, TransportEvent, TransportEvents};
pub use types::{ConnectionConfig, ConnectionState, Error, Payload};
pub use websocket::{WsConnector, WsTransport};
