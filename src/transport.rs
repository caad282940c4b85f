//! Transport channel seam.
//!
//! The transport mapping layer (framing of PDUs over TCP, heartbeats, connection
//! establishment) is provided by the surrounding system. The service instances only see the
//! [TransportChannel] trait and receive the channel events through [ChannelObserver].
use crate::pdu::PeerAbortDiagnostic;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Regular release of the connection after an UNBIND exchange.
    Regular,
    /// The peer aborted the association with the given diagnostic.
    PeerAbort(PeerAbortDiagnostic),
    CommunicationFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("sending pdu failed: {0}")]
    SendFailed(String),
}

/// Receiver of the events of a transport channel. The callbacks may be invoked from any
/// thread of the transport implementation.
pub trait ChannelObserver: Send + Sync {
    fn on_connected(&self);

    fn on_disconnected(&self, reason: DisconnectReason);

    fn on_pdu_received(&self, raw: Vec<u8>);
}

pub trait TransportChannel: Send {
    /// Register the observer of the channel events. A channel has at most one observer,
    /// registering a new one replaces the previous one.
    fn register_observer(&mut self, observer: Arc<dyn ChannelObserver>);

    /// Connect to the peer. Used by the initiator of the association.
    fn connect(&mut self) -> Result<(), ChannelError>;

    /// Accept a connection from the peer. Used by the responder of the association.
    fn listen(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }

    fn send_pdu(&mut self, raw: &[u8]) -> Result<(), ChannelError>;

    /// Release the connection.
    fn disconnect(&mut self);

    /// Abort the connection, signalling the diagnostic to the peer.
    fn abort(&mut self, diagnostic: u8);
}
