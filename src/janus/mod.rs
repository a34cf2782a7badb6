//! Janus VideoRoom signaling
//!
//! This module provides the client side of the VideoRoom plugin with:
//! - Transaction correlation between requests and long-poll deliveries
//! - Room membership and publisher roster tracking
//! - The per-role plugin handle state machine
//! - Session lifecycle and the long-poll router

pub mod calls;
pub mod handle;
pub mod protocol;
pub mod role;
pub mod room;
pub mod session;
pub mod transaction;

pub use handle::{HandleEvent, HandleOptions, HandleState, Notification, PluginHandle};
pub use protocol::{
    Envelope, FeederId, HandleId, IceCandidate, PublisherInfo, SdpType, SessionDescription, SessionId,
};
pub use role::{RemoteAction, Role};
pub use room::Room;
pub use session::{PollSettings, Session, SessionContext};
pub use transaction::TransactionManager;

use crate::media::MediaError;
use crate::transport::TransportError;
use std::error::Error;
use std::fmt;

/// Signaling errors surfaced by sessions and plugin handles
#[derive(Debug, Clone)]
pub enum JanusError {
    /// RPC failed at the transport level
    Transport(TransportError),
    /// Response shape was not one of the expected discriminators
    ProtocolViolation(String),
    /// Media engine rejected a create/set step
    Negotiation(MediaError),
    /// Gateway answered with a `janus: "error"` envelope or a plugin error
    Server { code: i64, reason: String },
    /// Operation issued in a state that does not allow it
    InvalidState(String),
    /// Transaction id already pending
    DuplicateTransaction(String),
    /// No response arrived for the transaction before it expired
    Timeout(String),
    /// Local description created twice in one negotiation round
    MultipleLocalDescriptions,
}

impl JanusError {
    /// Whether the failure must move the handle to ERROR
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JanusError::Transport(_) | JanusError::ProtocolViolation(_) | JanusError::Negotiation(_)
        )
    }
}

impl fmt::Display for JanusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JanusError::Transport(e) => write!(f, "Transport failure: {}", e),
            JanusError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            JanusError::Negotiation(e) => write!(f, "Negotiation failure: {}", e),
            JanusError::Server { code, reason } => write!(f, "Server error {}: {}", code, reason),
            JanusError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            JanusError::DuplicateTransaction(id) => write!(f, "Transaction already pending: {}", id),
            JanusError::Timeout(id) => write!(f, "Transaction {} expired without a response", id),
            JanusError::MultipleLocalDescriptions => write!(f, "Multiple SDP create"),
        }
    }
}

impl Error for JanusError {}

impl From<TransportError> for JanusError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Decode(msg) => JanusError::ProtocolViolation(msg),
            TransportError::Server { code, reason } => JanusError::Server { code, reason },
            other => JanusError::Transport(other),
        }
    }
}

impl From<MediaError> for JanusError {
    fn from(err: MediaError) -> Self {
        JanusError::Negotiation(err)
    }
}
