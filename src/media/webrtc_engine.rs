//! webrtc-rs backed media engine
//!
//! One `RTCPeerConnection` per plugin handle. Publishers announce send-only
//! audio/video tracks (and optionally a data channel); subscribers answer the
//! gateway's offer and get their transceivers from it.

use super::{MediaEngine, MediaEngineFactory, MediaError};
use crate::config::{IceServerConfig, MediaConfig};
use crate::janus::protocol::{IceCandidate, PeerType, SdpType, SessionDescription};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecRegistry, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "janus-videoroom";
const DATA_CHANNEL_LABEL: &str = "data";

/// Creates webrtc-rs peer connections from the `[media]` settings
pub struct WebRtcEngineFactory {
    ice_servers: Vec<IceServerConfig>,
    audio: bool,
    video: bool,
    data_channel: bool,
}

impl WebRtcEngineFactory {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            audio: config.audio,
            video: config.video,
            data_channel: config.data_channel,
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    async fn add_publisher_tracks(&self, pc: &Arc<RTCPeerConnection>) -> Result<(), MediaError> {
        if self.audio {
            let track = Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_owned(),
                STREAM_ID.to_owned(),
            ));
            pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| MediaError::ConnectionFailed(format!("add audio track: {}", e)))?;
        }
        if self.video {
            let track = Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_owned(),
                STREAM_ID.to_owned(),
            ));
            pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| MediaError::ConnectionFailed(format!("add video track: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaEngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        peer_type: PeerType,
        local_candidates: mpsc::UnboundedSender<Option<IceCandidate>>,
    ) -> Result<Arc<dyn MediaEngine>, MediaError> {
        let mut codecs = CodecRegistry::default();
        codecs
            .register_default_codecs()
            .map_err(|e| MediaError::ConnectionFailed(format!("codec registration: {}", e)))?;
        let registry = register_default_interceptors(Registry::new(), &mut codecs)
            .map_err(|e| MediaError::ConnectionFailed(format!("interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(|e| MediaError::ConnectionFailed(e.to_string()))?,
        );

        let mut data_channel = None;
        if peer_type == PeerType::Publisher {
            self.add_publisher_tracks(&pc).await?;
            if self.data_channel {
                let dc = pc
                    .create_data_channel(DATA_CHANNEL_LABEL, None)
                    .await
                    .map_err(|e| MediaError::ConnectionFailed(format!("data channel: {}", e)))?;
                data_channel = Some(dc);
            }
        }

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let local_candidates = local_candidates.clone();
            Box::pin(async move {
                let gathered = match candidate {
                    Some(c) => match c.to_json() {
                        Ok(init) => Some(IceCandidate::new(init.candidate, init.sdp_mid, init.sdp_mline_index)),
                        Err(e) => {
                            warn!("Failed to serialize local candidate: {}", e);
                            return;
                        }
                    },
                    None => None,
                };
                let _ = local_candidates.send(gathered);
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state| {
            Box::pin(async move {
                info!("{} peer connection state: {}", peer_type_label(peer_type), state);
            })
        }));

        Ok(Arc::new(WebRtcEngine {
            pc,
            data_channel: Mutex::new(data_channel),
        }))
    }
}

fn peer_type_label(peer_type: PeerType) -> &'static str {
    match peer_type {
        PeerType::Publisher => "Publisher",
        PeerType::Subscriber => "Subscriber",
    }
}

/// A single webrtc-rs peer connection
pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
}

fn to_rtc(sdp: &SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let converted = match sdp.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(sdp.sdp.clone()),
    };
    converted.map_err(|e| MediaError::SetFailed(format!("invalid {}: {}", sdp.sdp_type.as_str(), e)))
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::CreateFailed(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::CreateFailed(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, sdp: &SessionDescription) -> Result<(), MediaError> {
        self.pc
            .set_local_description(to_rtc(sdp)?)
            .await
            .map_err(|e| MediaError::SetFailed(e.to_string()))
    }

    async fn set_remote_description(&self, sdp: &SessionDescription) -> Result<(), MediaError> {
        self.pc
            .set_remote_description(to_rtc(sdp)?)
            .await
            .map_err(|e| MediaError::SetFailed(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::IceFailed(e.to_string()))
    }

    async fn remove_ice_candidates(&self, candidates: &[IceCandidate]) -> Result<(), MediaError> {
        // webrtc-rs has no candidate removal
        warn!("Ignoring removal of {} remote candidate(s)", candidates.len());
        Ok(())
    }

    async fn close_data_channel(&self) {
        let channel = self.data_channel.lock().take();
        if let Some(dc) = channel {
            if let Err(e) = dc.close().await {
                warn!("Failed to close data channel: {}", e);
            }
        }
    }

    async fn close(&self) {
        match self.pc.close().await {
            Ok(()) => debug!("Peer connection closed"),
            Err(e) => warn!("Failed to close peer connection: {}", e),
        }
    }
}
