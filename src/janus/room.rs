//! Room membership state
//!
//! Tracks the identity a handle holds in its room and the publisher roster
//! seen so far, and computes which publishers are new on each roster event.

use super::protocol::{FeederId, HandleId, PublisherInfo, SessionId};
use log::debug;

/// Per-negotiation membership state of one plugin handle
#[derive(Debug, Clone)]
pub struct Room {
    session_id: SessionId,
    handle_id: HandleId,
    room_id: u64,
    publisher_id: Option<FeederId>,
    publishers: Vec<PublisherInfo>,
}

impl Room {
    pub fn new(session_id: SessionId, handle_id: HandleId, room_id: u64) -> Self {
        Self {
            session_id,
            handle_id,
            room_id,
            publisher_id: None,
            publishers: Vec::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    pub fn room_id(&self) -> u64 {
        self.room_id
    }

    pub fn publisher_id(&self) -> Option<FeederId> {
        self.publisher_id
    }

    /// Record the id confirmed by the join response. Set at most once.
    pub fn set_publisher_id(&mut self, id: FeederId) -> bool {
        if self.publisher_id.is_some() {
            return false;
        }
        self.publisher_id = Some(id);
        true
    }

    pub fn publishers(&self) -> &[PublisherInfo] {
        &self.publishers
    }

    pub fn contains(&self, id: FeederId) -> bool {
        self.publishers.iter().any(|p| p.id == id)
    }

    /// Merge a reported roster and return the publishers not seen before.
    ///
    /// Entries matching `leaving` never count as new. Reporting the same
    /// roster again yields an empty delta. Departures are removed separately
    /// through [`Room::remove_publisher`].
    pub fn update_publishers(&mut self, current: &[PublisherInfo], leaving: Option<FeederId>) -> Vec<PublisherInfo> {
        let mut fresh: Vec<PublisherInfo> = Vec::new();
        for info in current {
            if Some(info.id) == leaving || self.contains(info.id) || fresh.iter().any(|p| p.id == info.id) {
                continue;
            }
            fresh.push(info.clone());
        }
        self.publishers.extend(fresh.iter().cloned());
        if !fresh.is_empty() {
            debug!(
                "Room {}: {} new publisher(s), roster size {}",
                self.room_id,
                fresh.len(),
                self.publishers.len()
            );
        }
        fresh
    }

    /// Drop a departed publisher from the retained roster
    pub fn remove_publisher(&mut self, id: FeederId) -> Option<PublisherInfo> {
        let index = self.publishers.iter().position(|p| p.id == id)?;
        Some(self.publishers.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(ids: &[FeederId]) -> Vec<PublisherInfo> {
        ids.iter().copied().map(PublisherInfo::new).collect()
    }

    fn ids(infos: &[PublisherInfo]) -> Vec<FeederId> {
        infos.iter().map(|p| p.id).collect()
    }

    #[test]
    fn test_delta_reports_only_new_publisher() {
        let mut room = Room::new(1, 2, 1234);
        assert_eq!(ids(&room.update_publishers(&roster(&[1, 2]), None)), vec![1, 2]);

        let delta = room.update_publishers(&roster(&[1, 2, 3]), None);
        assert_eq!(ids(&delta), vec![3]);
    }

    #[test]
    fn test_repeated_roster_yields_empty_delta() {
        let mut room = Room::new(1, 2, 1234);
        room.update_publishers(&roster(&[1, 2]), None);
        assert_eq!(ids(&room.update_publishers(&roster(&[1, 2, 3]), None)), vec![3]);
        assert!(room.update_publishers(&roster(&[1, 2, 3]), None).is_empty());
        assert_eq!(ids(room.publishers()), vec![1, 2, 3]);
    }

    #[test]
    fn test_leaving_id_is_excluded() {
        let mut room = Room::new(1, 2, 1234);
        room.update_publishers(&roster(&[1]), None);
        let delta = room.update_publishers(&roster(&[1, 2, 3]), Some(2));
        assert_eq!(ids(&delta), vec![3]);
        assert!(!room.contains(2));
    }

    #[test]
    fn test_incremental_events_accumulate() {
        let mut room = Room::new(1, 2, 1234);
        assert_eq!(ids(&room.update_publishers(&roster(&[5]), None)), vec![5]);
        assert_eq!(ids(&room.update_publishers(&roster(&[6]), None)), vec![6]);
        // A feed reported again later is not new
        assert!(room.update_publishers(&roster(&[5]), None).is_empty());
    }

    #[test]
    fn test_duplicates_within_one_event() {
        let mut room = Room::new(1, 2, 1234);
        assert_eq!(ids(&room.update_publishers(&roster(&[4, 4]), None)), vec![4]);
    }

    #[test]
    fn test_remove_publisher_is_separate_step() {
        let mut room = Room::new(1, 2, 1234);
        room.update_publishers(&roster(&[1, 2]), None);
        assert_eq!(room.remove_publisher(1).map(|p| p.id), Some(1));
        assert!(room.remove_publisher(1).is_none());
        // A publisher that left and came back is new again
        assert_eq!(ids(&room.update_publishers(&roster(&[1, 2]), None)), vec![1]);
    }

    #[test]
    fn test_publisher_id_set_once() {
        let mut room = Room::new(1, 2, 1234);
        assert!(room.set_publisher_id(99));
        assert!(!room.set_publisher_id(100));
        assert_eq!(room.publisher_id(), Some(99));
    }
}
