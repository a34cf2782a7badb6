//! Janus wire protocol
//!
//! Request bodies posted to the gateway and the envelopes it answers with,
//! either inline in the HTTP response or later over the long poll.
//! The `janus` field is the envelope discriminator; VideoRoom plugin payloads
//! are discriminated again by their `videoroom` field.

use super::JanusError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Plugin package name the handles attach to
pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

/// Server-assigned session identifier
pub type SessionId = u64;

/// Server-assigned plugin handle identifier
pub type HandleId = u64;

/// Publisher id inside a room, used as the `feed` of a subscriber
pub type FeederId = u64;

/// SDP type carried in a `jsep` object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

/// Session description, also the wire shape of `jsep`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate as trickled to and from the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> Self {
        Self { candidate: candidate.into(), sdp_mid, sdp_mline_index }
    }
}

/// Room role requested in a join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerType {
    Publisher,
    Subscriber,
}

/// Body of a plugin `message` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum RoomRequest {
    Join {
        room: u64,
        ptype: PeerType,
        display: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        feed: Option<FeederId>,
    },
    Configure {
        audio: bool,
        video: bool,
    },
    Start {
        room: u64,
    },
}

/// `candidate` member of a trickle request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TrickleCandidate {
    Candidate(IceCandidate),
    Completed { completed: bool },
}

impl TrickleCandidate {
    pub fn completed() -> Self {
        TrickleCandidate::Completed { completed: true }
    }
}

/// Requests posted to the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum Request {
    Create {
        transaction: String,
    },
    Attach {
        plugin: String,
        transaction: String,
    },
    Message {
        transaction: String,
        body: RoomRequest,
        #[serde(skip_serializing_if = "Option::is_none")]
        jsep: Option<SessionDescription>,
    },
    Trickle {
        transaction: String,
        candidate: TrickleCandidate,
    },
    Detach {
        transaction: String,
    },
    Hangup {
        transaction: String,
    },
    Destroy {
        transaction: String,
    },
}

impl Request {
    pub fn transaction(&self) -> &str {
        match self {
            Request::Create { transaction }
            | Request::Attach { transaction, .. }
            | Request::Message { transaction, .. }
            | Request::Trickle { transaction, .. }
            | Request::Detach { transaction }
            | Request::Hangup { transaction }
            | Request::Destroy { transaction } => transaction,
        }
    }

    pub fn to_json(&self) -> Result<String, JanusError> {
        serde_json::to_string(self)
            .map_err(|e| JanusError::ProtocolViolation(format!("Failed to serialize request: {}", e)))
    }
}

/// `data` member of a `success` envelope (session create, attach)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SuccessData {
    pub id: u64,
}

/// `error` member of an `error` envelope
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    #[serde(default)]
    pub reason: String,
}

/// `plugindata` member of an `event` envelope
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginData {
    pub plugin: String,
    #[serde(default)]
    pub data: Value,
}

impl PluginData {
    /// Decode the VideoRoom payload by its `videoroom` discriminator.
    pub fn videoroom(&self) -> Result<VideoRoomData, JanusError> {
        VideoRoomData::deserialize(&self.data)
            .map_err(|e| JanusError::ProtocolViolation(format!("Invalid videoroom payload: {}", e)))
    }
}

/// One publisher as listed by the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherInfo {
    pub id: FeederId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
}

impl PublisherInfo {
    pub fn new(id: FeederId) -> Self {
        Self { id, display: None, audio_codec: None, video_codec: None }
    }
}

/// VideoRoom `event` payload: roster changes, negotiation acks, plugin errors
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RoomEvent {
    #[serde(default)]
    pub room: Option<u64>,
    #[serde(default)]
    pub publishers: Option<Vec<PublisherInfo>>,
    /// Publisher id that left, or `"ok"` when this participant left
    #[serde(default)]
    pub leaving: Option<Value>,
    #[serde(default)]
    pub unpublished: Option<Value>,
    #[serde(default)]
    pub configured: Option<String>,
    #[serde(default)]
    pub started: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RoomEvent {
    pub fn leaving_id(&self) -> Option<FeederId> {
        self.leaving.as_ref().and_then(Value::as_u64)
    }

    pub fn unpublished_id(&self) -> Option<FeederId> {
        self.unpublished.as_ref().and_then(Value::as_u64)
    }
}

/// VideoRoom plugin payloads, closed over the `videoroom` discriminator
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "videoroom", rename_all = "lowercase")]
pub enum VideoRoomData {
    /// Subscriber join confirmation, usually accompanied by an offer
    Attached {
        #[serde(default)]
        room: Option<u64>,
        #[serde(default)]
        id: Option<FeederId>,
        #[serde(default)]
        display: Option<String>,
    },
    /// Publisher join confirmation with the current roster
    Joined {
        #[serde(default)]
        room: Option<u64>,
        id: FeederId,
        #[serde(default)]
        private_id: Option<u64>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        publishers: Vec<PublisherInfo>,
    },
    Event(RoomEvent),
    #[serde(other)]
    Unrecognized,
}

/// Media lifecycle notification pushed for a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebRtcEvent {
    Media { kind: Option<String>, receiving: Option<bool> },
    Up,
    SlowLink { uplink: Option<bool>, lost: Option<u64> },
    Hangup { reason: Option<String> },
}

/// Envelopes returned inline or delivered over the long poll
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum Envelope {
    Ack {
        #[serde(default)]
        transaction: Option<String>,
    },
    Keepalive {
        #[serde(default)]
        transaction: Option<String>,
    },
    Success {
        #[serde(default)]
        transaction: Option<String>,
        #[serde(default)]
        sender: Option<HandleId>,
        #[serde(default)]
        data: Option<SuccessData>,
    },
    Event {
        #[serde(default)]
        transaction: Option<String>,
        #[serde(default)]
        sender: Option<HandleId>,
        #[serde(default)]
        plugindata: Option<PluginData>,
        #[serde(default)]
        jsep: Option<SessionDescription>,
    },
    Media {
        #[serde(default)]
        sender: Option<HandleId>,
        #[serde(rename = "type", default)]
        kind: Option<String>,
        #[serde(default)]
        receiving: Option<bool>,
    },
    Webrtcup {
        #[serde(default)]
        sender: Option<HandleId>,
    },
    Slowlink {
        #[serde(default)]
        sender: Option<HandleId>,
        #[serde(default)]
        uplink: Option<bool>,
        #[serde(default)]
        lost: Option<u64>,
    },
    Hangup {
        #[serde(default)]
        sender: Option<HandleId>,
        #[serde(default)]
        reason: Option<String>,
    },
    Error {
        #[serde(default)]
        transaction: Option<String>,
        #[serde(default)]
        sender: Option<HandleId>,
        error: ErrorBody,
    },
    #[serde(other)]
    Unrecognized,
}

impl Envelope {
    pub fn from_json(json: &str) -> Result<Self, JanusError> {
        serde_json::from_str(json)
            .map_err(|e| JanusError::ProtocolViolation(format!("Invalid envelope: {}", e)))
    }

    pub fn from_value(value: Value) -> Result<Self, JanusError> {
        serde_json::from_value(value)
            .map_err(|e| JanusError::ProtocolViolation(format!("Invalid envelope: {}", e)))
    }

    /// Discriminator name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Ack { .. } => "ack",
            Envelope::Keepalive { .. } => "keepalive",
            Envelope::Success { .. } => "success",
            Envelope::Event { .. } => "event",
            Envelope::Media { .. } => "media",
            Envelope::Webrtcup { .. } => "webrtcup",
            Envelope::Slowlink { .. } => "slowlink",
            Envelope::Hangup { .. } => "hangup",
            Envelope::Error { .. } => "error",
            Envelope::Unrecognized => "unrecognized",
        }
    }

    pub fn transaction(&self) -> Option<&str> {
        match self {
            Envelope::Ack { transaction }
            | Envelope::Keepalive { transaction }
            | Envelope::Success { transaction, .. }
            | Envelope::Event { transaction, .. }
            | Envelope::Error { transaction, .. } => transaction.as_deref(),
            _ => None,
        }
    }

    /// Handle the envelope was pushed for, if any
    pub fn sender(&self) -> Option<HandleId> {
        match self {
            Envelope::Success { sender, .. }
            | Envelope::Event { sender, .. }
            | Envelope::Media { sender, .. }
            | Envelope::Webrtcup { sender }
            | Envelope::Slowlink { sender, .. }
            | Envelope::Hangup { sender, .. }
            | Envelope::Error { sender, .. } => *sender,
            _ => None,
        }
    }

    /// Media lifecycle view of `media`/`webrtcup`/`slowlink`/`hangup`
    pub fn webrtc_event(&self) -> Option<WebRtcEvent> {
        match self {
            Envelope::Media { kind, receiving, .. } => Some(WebRtcEvent::Media {
                kind: kind.clone(),
                receiving: *receiving,
            }),
            Envelope::Webrtcup { .. } => Some(WebRtcEvent::Up),
            Envelope::Slowlink { uplink, lost, .. } => Some(WebRtcEvent::SlowLink {
                uplink: *uplink,
                lost: *lost,
            }),
            Envelope::Hangup { reason, .. } => Some(WebRtcEvent::Hangup { reason: reason.clone() }),
            _ => None,
        }
    }
}

/// Response of `GET /janus/info`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub version_string: Option<String>,
    #[serde(default)]
    pub plugins: HashMap<String, Value>,
}

impl ServerInfo {
    pub fn supports(&self, plugin: &str) -> bool {
        self.plugins.contains_key(plugin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_message_shape() {
        let request = Request::Message {
            transaction: "tx1".to_string(),
            body: RoomRequest::Join {
                room: 1234,
                ptype: PeerType::Subscriber,
                display: "cam".to_string(),
                feed: Some(7),
            },
            jsep: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "janus": "message",
                "transaction": "tx1",
                "body": {"request": "join", "room": 1234, "ptype": "subscriber", "display": "cam", "feed": 7}
            })
        );
    }

    #[test]
    fn test_publisher_join_omits_feed() {
        let body = RoomRequest::Join {
            room: 1,
            ptype: PeerType::Publisher,
            display: "me".to_string(),
            feed: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("feed").is_none());
        assert_eq!(value["ptype"], "publisher");
    }

    #[test]
    fn test_configure_carries_offer_jsep() {
        let request = Request::Message {
            transaction: "tx2".to_string(),
            body: RoomRequest::Configure { audio: true, video: true },
            jsep: Some(SessionDescription::offer("v=0")),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["body"]["request"], "configure");
        assert_eq!(value["jsep"], json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn test_trickle_completed_shape() {
        let request = Request::Trickle {
            transaction: "tx3".to_string(),
            candidate: TrickleCandidate::completed(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, json!({"janus": "trickle", "transaction": "tx3", "candidate": {"completed": true}}));
    }

    #[test]
    fn test_parse_joined_event() {
        let envelope = Envelope::from_value(json!({
            "janus": "event",
            "sender": 42,
            "transaction": "abc",
            "plugindata": {
                "plugin": "janus.plugin.videoroom",
                "data": {"videoroom": "joined", "room": 1234, "id": 99, "publishers": [{"id": 7, "display": "bob"}]}
            }
        }))
        .unwrap();

        assert_eq!(envelope.transaction(), Some("abc"));
        assert_eq!(envelope.sender(), Some(42));
        match envelope {
            Envelope::Event { plugindata: Some(data), jsep: None, .. } => match data.videoroom().unwrap() {
                VideoRoomData::Joined { id, publishers, .. } => {
                    assert_eq!(id, 99);
                    assert_eq!(publishers.len(), 1);
                    assert_eq!(publishers[0].display.as_deref(), Some("bob"));
                }
                other => panic!("Expected Joined, got {:?}", other),
            },
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_discriminators_are_unrecognized() {
        let envelope = Envelope::from_json(r#"{"janus": "timeout", "session_id": 1}"#).unwrap();
        assert_eq!(envelope, Envelope::Unrecognized);

        let data = PluginData {
            plugin: VIDEOROOM_PLUGIN.to_string(),
            data: json!({"videoroom": "destroyed", "room": 1}),
        };
        assert_eq!(data.videoroom().unwrap(), VideoRoomData::Unrecognized);
    }

    #[test]
    fn test_missing_videoroom_tag_is_protocol_violation() {
        let data = PluginData {
            plugin: VIDEOROOM_PLUGIN.to_string(),
            data: json!({"room": 1}),
        };
        assert!(matches!(data.videoroom(), Err(JanusError::ProtocolViolation(_))));
    }

    #[test]
    fn test_leaving_ok_is_not_an_id() {
        let event: RoomEvent = serde_json::from_value(json!({"leaving": "ok"})).unwrap();
        assert_eq!(event.leaving_id(), None);
        let event: RoomEvent = serde_json::from_value(json!({"leaving": 7, "unpublished": 7})).unwrap();
        assert_eq!(event.leaving_id(), Some(7));
        assert_eq!(event.unpublished_id(), Some(7));
    }

    #[test]
    fn test_webrtc_lifecycle_view() {
        let envelope = Envelope::from_json(r#"{"janus": "slowlink", "sender": 3, "uplink": true, "lost": 12}"#).unwrap();
        assert_eq!(
            envelope.webrtc_event(),
            Some(WebRtcEvent::SlowLink { uplink: Some(true), lost: Some(12) })
        );
        let envelope = Envelope::from_json(r#"{"janus": "error", "transaction": "t", "error": {"code": 458, "reason": "No such session"}}"#).unwrap();
        assert_eq!(envelope.kind(), "error");
        assert_eq!(envelope.webrtc_event(), None);
    }
}
