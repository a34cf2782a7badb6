//! Signaling transport for the Janus HTTP API
//!
//! The handle state machine only sees the [`SignalingTransport`] contract.
//! The HTTP request / long-poll implementation lives in [`http`].

pub mod http;

pub use http::HttpTransport;

use crate::janus::protocol::{
    Envelope, HandleId, IceCandidate, RoomRequest, ServerInfo, SessionDescription, SessionId,
};
use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::fmt;

/// Transport-level failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Request could not be sent or the connection failed
    Http(String),
    /// Gateway answered with a non-2xx status
    Status(u16),
    /// Response body was not the expected JSON shape
    Decode(String),
    /// Gateway rejected the request with a `janus: "error"` envelope
    Server { code: i64, reason: String },
    /// Call was cancelled locally before it completed
    Cancelled,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Http(msg) => write!(f, "HTTP request failed: {}", msg),
            TransportError::Status(code) => write!(f, "Unexpected HTTP status {}", code),
            TransportError::Decode(msg) => write!(f, "Invalid response body: {}", msg),
            TransportError::Server { code, reason } => write!(f, "Gateway error {}: {}", code, reason),
            TransportError::Cancelled => write!(f, "Call cancelled"),
        }
    }
}

impl Error for TransportError {}

/// RPC surface of the gateway consumed by sessions and plugin handles.
///
/// Every call carries the transaction id chosen by the caller, so that
/// responses delivered later over the long poll can be correlated.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// `POST /janus` with `{janus:"create"}`
    async fn create_session(&self, transaction: &str) -> Result<Envelope, TransportError>;

    /// `GET /janus/info`
    async fn server_info(&self) -> Result<ServerInfo, TransportError>;

    /// `POST /janus/{session}` with `{janus:"attach", plugin}`
    async fn attach(&self, session: SessionId, transaction: &str, plugin: &str) -> Result<Envelope, TransportError>;

    /// Plugin message carrying a join body
    async fn join(
        &self,
        session: SessionId,
        handle: HandleId,
        transaction: &str,
        body: &RoomRequest,
    ) -> Result<Envelope, TransportError>;

    /// Plugin message carrying a configure body and the local offer
    async fn offer(
        &self,
        session: SessionId,
        handle: HandleId,
        transaction: &str,
        body: &RoomRequest,
        jsep: &SessionDescription,
    ) -> Result<Envelope, TransportError>;

    /// Plugin message carrying a start body and the local answer; returns the raw body
    async fn send(
        &self,
        session: SessionId,
        handle: HandleId,
        transaction: &str,
        body: &RoomRequest,
        jsep: &SessionDescription,
    ) -> Result<Value, TransportError>;

    async fn trickle(
        &self,
        session: SessionId,
        handle: HandleId,
        transaction: &str,
        candidate: &IceCandidate,
    ) -> Result<Envelope, TransportError>;

    async fn trickle_completed(
        &self,
        session: SessionId,
        handle: HandleId,
        transaction: &str,
    ) -> Result<Envelope, TransportError>;

    async fn detach(&self, session: SessionId, handle: HandleId, transaction: &str) -> Result<(), TransportError>;

    async fn hangup(&self, session: SessionId, handle: HandleId, transaction: &str) -> Result<(), TransportError>;

    async fn destroy(&self, session: SessionId, transaction: &str) -> Result<(), TransportError>;

    /// Long poll: `GET /janus/{session}?maxev=N`, returns zero or more raw envelopes
    async fn poll(&self, session: SessionId, max_events: u32) -> Result<Vec<Value>, TransportError>;
}
