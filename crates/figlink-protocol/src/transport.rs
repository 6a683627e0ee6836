//! The duplex transport seam.
//!
//! A [`Transport`] opens links; a [`TransportLink`] is a pair of channels to
//! and from a pump task that owns the actual socket. Successful return of
//! [`Transport::open`] means the link is open; everything after that arrives
//! as [`TransportEvent`]s on the inbound channel. When the pump ends it drops
//! its inbound sender, so `recv()` returning `None` also means the link is gone.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Normal closure.
pub const NORMAL_CLOSE: u16 = 1000;
/// The peer is going away (shutdown, navigation).
pub const GOING_AWAY: u16 = 1001;
/// Closed locally after too many unanswered keepalive PINGs.
pub const KEEPALIVE_TIMEOUT_CLOSE: u16 = 4000;

/// A frame written to the link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// An encoded envelope.
    Text(String),
    /// Close the link with the given code; the pump exits afterwards.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Something that happened on an open link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived.
    Frame(String),
    /// The peer closed the link. `code` is `None` when the link ended
    /// without a close frame.
    Closed {
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },
    /// The link failed.
    Error(String),
}

impl TransportEvent {
    /// Whether this event is a close the peer meant to make.
    #[must_use]
    pub fn is_intentional_close(&self) -> bool {
        matches!(
            self,
            Self::Closed {
                code: Some(NORMAL_CLOSE | GOING_AWAY),
                ..
            }
        )
    }
}

/// Opening a link failed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peer could not be reached or refused the handshake.
    #[error("failed to connect to {address}: {reason}")]
    Connect {
        /// Address that was dialed.
        address: String,
        /// Underlying failure.
        reason: String,
    },
    /// The address cannot be dialed by this transport.
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
}

/// Channel ends of an open link.
#[derive(Debug)]
pub struct TransportLink {
    /// Frames to write.
    pub outbound: mpsc::Sender<OutboundFrame>,
    /// Events read from the link.
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Something that can open duplex text links.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a link to `address`.
    async fn open(&self, address: &str) -> Result<TransportLink, TransportError>;
}
