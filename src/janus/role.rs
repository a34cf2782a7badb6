//! Room role strategy
//!
//! A handle is either the publisher of this client or a subscriber bound to
//! one remote feed. The role decides the join parameters and how remote
//! descriptions and roster events are handled.

use super::protocol::{FeederId, PeerType, PublisherInfo, SdpType, SessionDescription};
use super::room::Room;
use std::fmt;

/// What the handle does with a received remote description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAction {
    /// Notify the application only
    Propagate,
    /// Notify, apply the offer and answer it locally
    AcceptOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Publisher,
    Subscriber { feeder_id: FeederId },
}

impl Role {
    pub fn subscriber(feeder_id: FeederId) -> Self {
        Role::Subscriber { feeder_id }
    }

    pub fn peer_type(&self) -> PeerType {
        match self {
            Role::Publisher => PeerType::Publisher,
            Role::Subscriber { .. } => PeerType::Subscriber,
        }
    }

    /// Feed a subscriber joins with
    pub fn feeder_id(&self) -> Option<FeederId> {
        match self {
            Role::Publisher => None,
            Role::Subscriber { feeder_id } => Some(*feeder_id),
        }
    }

    pub fn on_remote_description(&self, sdp: &SessionDescription) -> RemoteAction {
        match (self, sdp.sdp_type) {
            (Role::Subscriber { .. }, SdpType::Offer) => RemoteAction::AcceptOffer,
            _ => RemoteAction::Propagate,
        }
    }

    /// Diff a reported roster into `room`; returns publishers to subscribe to.
    pub fn on_room_event(
        &self,
        room: &mut Room,
        publishers: &[PublisherInfo],
        leaving: Option<FeederId>,
    ) -> Vec<PublisherInfo> {
        match self {
            Role::Publisher => room.update_publishers(publishers, leaving),
            Role::Subscriber { .. } => Vec::new(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => write!(f, "publisher"),
            Role::Subscriber { feeder_id } => write!(f, "subscriber:{}", feeder_id),
        }
    }
}
