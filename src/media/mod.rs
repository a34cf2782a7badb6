//! Media engine seam
//!
//! The plugin handle drives SDP creation, description application and ICE
//! candidate handling through [`MediaEngine`]. Codec and bitrate rewriting of
//! remote descriptions is delegated to an [`SdpTransform`].

#[cfg(feature = "webrtc-engine")]
pub mod webrtc_engine;

#[cfg(feature = "webrtc-engine")]
pub use webrtc_engine::WebRtcEngineFactory;

use crate::janus::protocol::{IceCandidate, PeerType, SessionDescription};
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Media engine failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Offer or answer creation failed
    CreateFailed(String),
    /// Applying a local or remote description failed
    SetFailed(String),
    /// ICE candidate could not be applied
    IceFailed(String),
    /// Peer connection could not be built
    ConnectionFailed(String),
    /// Engine does not implement the operation
    Unsupported(String),
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::CreateFailed(msg) => write!(f, "SDP create failed: {}", msg),
            MediaError::SetFailed(msg) => write!(f, "SDP set failed: {}", msg),
            MediaError::IceFailed(msg) => write!(f, "ICE error: {}", msg),
            MediaError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            MediaError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
        }
    }
}

impl Error for MediaError {}

/// Peer connection operations used during negotiation.
///
/// Local ICE candidates are not returned from here; the factory hands the
/// engine a channel on which gathered candidates (and `None` at the end of
/// gathering) are published.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, sdp: &SessionDescription) -> Result<(), MediaError>;

    async fn set_remote_description(&self, sdp: &SessionDescription) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    async fn remove_ice_candidates(&self, candidates: &[IceCandidate]) -> Result<(), MediaError>;

    /// Stop the data channel, if one was opened
    async fn close_data_channel(&self) {}

    /// Stop RTC event logging, if enabled
    async fn stop_event_log(&self) {}

    /// Tear down the peer connection
    async fn close(&self);
}

/// Builds one engine per plugin handle
#[async_trait]
pub trait MediaEngineFactory: Send + Sync {
    async fn create(
        &self,
        peer_type: PeerType,
        local_candidates: mpsc::UnboundedSender<Option<IceCandidate>>,
    ) -> Result<Arc<dyn MediaEngine>, MediaError>;
}

/// Rewrites a description before it is handed to the engine
pub trait SdpTransform: Send + Sync {
    fn apply(&self, sdp: SessionDescription) -> SessionDescription;
}

/// Leaves descriptions untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl SdpTransform for PassThrough {
    fn apply(&self, sdp: SessionDescription) -> SessionDescription {
        sdp
    }
}

/// Moves the preferred video codec's payload types to the front of the `m=video` line.
#[derive(Debug, Clone)]
pub struct PreferVideoCodec {
    codec: String,
}

impl PreferVideoCodec {
    pub fn new(codec: impl Into<String>) -> Self {
        Self { codec: codec.into() }
    }

    fn payload_types(&self, lines: &[&str]) -> Vec<String> {
        let wanted = self.codec.to_ascii_lowercase();
        lines
            .iter()
            .filter_map(|line| line.strip_prefix("a=rtpmap:"))
            .filter_map(|rest| {
                let (pt, encoding) = rest.split_once(' ')?;
                let name = encoding.split('/').next()?;
                (name.to_ascii_lowercase() == wanted).then(|| pt.to_string())
            })
            .collect()
    }
}

impl SdpTransform for PreferVideoCodec {
    fn apply(&self, mut sdp: SessionDescription) -> SessionDescription {
        let lines: Vec<&str> = sdp.sdp.lines().collect();
        let preferred = self.payload_types(&lines);
        if preferred.is_empty() {
            return sdp;
        }

        let rewritten: Vec<String> = lines
            .iter()
            .map(|line| {
                if !line.starts_with("m=video ") {
                    return line.to_string();
                }
                let fields: Vec<&str> = line.split(' ').collect();
                if fields.len() < 4 {
                    return line.to_string();
                }
                // m=video <port> <proto> <pt>...
                let mut reordered: Vec<&str> = fields[..3].to_vec();
                reordered.extend(fields[3..].iter().filter(|pt| preferred.iter().any(|p| p.as_str() == **pt)));
                reordered.extend(fields[3..].iter().filter(|pt| !preferred.iter().any(|p| p.as_str() == **pt)));
                reordered.join(" ")
            })
            .collect();

        let mut out = rewritten.join("\r\n");
        if sdp.sdp.ends_with('\n') {
            out.push_str("\r\n");
        }
        sdp.sdp = out;
        sdp
    }
}

/// Build the transform selected by the `media.preferred_video_codec` setting
pub fn transform_for(preferred_video_codec: Option<&str>) -> Arc<dyn SdpTransform> {
    match preferred_video_codec {
        Some(codec) if !codec.is_empty() => Arc::new(PreferVideoCodec::new(codec)),
        _ => Arc::new(PassThrough),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\nm=video 9 UDP/TLS/RTP/SAVPF 96 98 100\r\na=rtpmap:96 VP8/90000\r\na=rtpmap:98 VP9/90000\r\na=rtpmap:100 H264/90000\r\n";

    #[test]
    fn test_pass_through() {
        let sdp = SessionDescription::offer(OFFER);
        assert_eq!(PassThrough.apply(sdp.clone()), sdp);
    }

    #[test]
    fn test_prefer_h264() {
        let out = PreferVideoCodec::new("H264").apply(SessionDescription::offer(OFFER));
        assert!(out.sdp.contains("m=video 9 UDP/TLS/RTP/SAVPF 100 96 98\r\n"));
        assert!(out.sdp.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"));
        assert!(out.sdp.ends_with("\r\n"));
    }

    #[test]
    fn test_unknown_codec_leaves_sdp_untouched() {
        let sdp = SessionDescription::answer(OFFER);
        assert_eq!(PreferVideoCodec::new("AV1").apply(sdp.clone()), sdp);
    }

    #[test]
    fn test_transform_selection() {
        let sdp = SessionDescription::offer(OFFER);
        assert_eq!(transform_for(None).apply(sdp.clone()), sdp);
        assert_eq!(transform_for(Some("")).apply(sdp.clone()), sdp);
        assert_ne!(transform_for(Some("vp9")).apply(sdp.clone()), sdp);
    }
}
