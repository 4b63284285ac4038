//! Transport capability boundary.
//!
//! A [`Connector`] starts connection attempts. Each attempt yields a
//! [`Transport`] handle plus the receiving end of its event stream. The
//! receiver is the event subscription: dropping it detaches the subscriber,
//! and events the transport emits afterwards are discarded.

use tokio::sync::mpsc;

use crate::types::{ConnectionState, Error, Payload};

/// Events emitted by a transport, in the order it observes them.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection attempt succeeded.
    Opened,
    /// A message arrived from the server.
    Message(Payload),
    /// Diagnostic error. A `Closed` event normally follows.
    Errored(Error),
    /// The transport is closed, either after a failed attempt, a drop, or an
    /// explicit [`Transport::close`].
    Closed,
}

/// Event subscription for a single transport.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A single bidirectional message channel to the server.
pub trait Transport: Send + 'static {
    fn state(&self) -> ConnectionState;

    /// Best-effort send. Fails synchronously when the transport cannot
    /// currently accept data.
    fn send(&self, payload: Payload) -> Result<(), Error>;

    /// Request teardown. The transport eventually emits `Closed`.
    fn close(&mut self);
}

/// Factory for transports bound to an endpoint.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Begin an asynchronous connection attempt. Must not block; connect
    /// failures are reported as `Errored` + `Closed` on the returned events.
    fn connect(&self, endpoint: &str) -> (Self::Transport, TransportEvents);
}
