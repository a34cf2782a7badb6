//! janus-videoroom - Janus VideoRoom signaling client
//!
//! Publishes into a VideoRoom over the gateway's HTTP long-poll transport and
//! subscribes to every other publisher in the room.

pub mod args;
pub mod client;
pub mod config;
pub mod janus;
pub mod media;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-exports
pub use client::VideoRoomClient;
pub use config::{Config, MediaConfig, VideoCodec};
pub use janus::{JanusError, PluginHandle, Session};
pub use transport::{HttpTransport, SignalingTransport, TransportError};
