//! VideoRoom application client
//!
//! Owns the session, the publisher handle and one subscriber handle per remote
//! feed, and reacts to handle notifications: offers are created once the
//! publisher joins, local descriptions are sent for the role that produced
//! them, and subscribers follow publishers in and out of the room.

use crate::config::Config;
use crate::janus::protocol::{FeederId, IceCandidate, SdpType, SessionId};
use crate::janus::{
    HandleEvent, HandleOptions, JanusError, Notification, PluginHandle, RemoteAction, Role, Session,
};
use crate::media::{transform_for, MediaEngineFactory, SdpTransform};
use crate::transport::{SignalingTransport, TransportError};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct VideoRoomClient {
    session: Session,
    factory: Arc<dyn MediaEngineFactory>,
    transform: Arc<dyn SdpTransform>,
    options: HandleOptions,
    loopback: bool,
    events_tx: mpsc::UnboundedSender<Notification>,
    events: mpsc::UnboundedReceiver<Notification>,
    poll: JoinHandle<Result<(), TransportError>>,
    publisher: Option<PluginHandle>,
    subscribers: HashMap<FeederId, PluginHandle>,
}

impl VideoRoomClient {
    /// Create a session and start its long poll
    pub async fn connect(
        transport: Arc<dyn SignalingTransport>,
        factory: Arc<dyn MediaEngineFactory>,
        config: &Config,
    ) -> Result<Self, JanusError> {
        let session = Session::create(transport).await?;
        let poll = session.spawn_long_poll(config.poll_settings());
        Ok(Self::with_session(session, poll, factory, config))
    }

    fn with_session(
        session: Session,
        poll: JoinHandle<Result<(), TransportError>>,
        factory: Arc<dyn MediaEngineFactory>,
        config: &Config,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            session,
            factory,
            transform: transform_for(config.media.preferred_video_codec.map(|c| c.as_str())),
            options: config.handle_options(),
            loopback: config.media.loopback,
            events_tx,
            events,
            poll,
            publisher: None,
            subscribers: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn publisher(&self) -> Option<&PluginHandle> {
        self.publisher.as_ref()
    }

    pub fn subscriber_feeds(&self) -> Vec<FeederId> {
        let mut feeds: Vec<FeederId> = self.subscribers.keys().copied().collect();
        feeds.sort_unstable();
        feeds
    }

    /// Attach the publisher handle and join the room
    pub async fn publish(&mut self) -> Result<(), JanusError> {
        if self.publisher.is_some() {
            return Err(JanusError::InvalidState("already publishing".to_string()));
        }
        let handle = self.spawn_handle(Role::Publisher).await?;
        handle.attach();
        self.publisher = Some(handle);
        Ok(())
    }

    async fn spawn_handle(&self, role: Role) -> Result<PluginHandle, JanusError> {
        let (candidates_tx, candidates) = mpsc::unbounded_channel();
        let engine = self
            .factory
            .create(role.peer_type(), candidates_tx)
            .await
            .map_err(JanusError::Negotiation)?;
        let handle = PluginHandle::spawn(
            self.session.context().clone(),
            role,
            self.options.clone(),
            engine,
            self.transform.clone(),
            self.events_tx.clone(),
        );
        tokio::spawn(forward_local_candidates(handle.clone(), candidates, self.loopback));
        Ok(handle)
    }

    fn handle_for(&self, role: Role) -> Option<&PluginHandle> {
        match role {
            Role::Publisher => self.publisher.as_ref(),
            Role::Subscriber { feeder_id } => self.subscribers.get(&feeder_id),
        }
    }

    /// React to one handle notification
    pub async fn handle_notification(&mut self, notification: Notification) {
        let Notification { role, handle_id, event } = notification;
        match event {
            HandleEvent::Attached { id } => debug!("{} attached as handle {}", role, id),
            HandleEvent::Joined { room, publisher_id, publishers } => {
                info!(
                    "{} joined room {} (id {:?}, {} publisher(s))",
                    role,
                    room,
                    publisher_id,
                    publishers.len()
                );
                if role == Role::Publisher {
                    if let Some(handle) = self.handle_for(role) {
                        handle.create_offer();
                    }
                }
            }
            HandleEvent::LocalDescription(sdp) => {
                let Some(handle) = self.handle_for(role) else {
                    return;
                };
                match sdp.sdp_type {
                    SdpType::Offer => handle.send_offer_sdp(sdp, self.loopback),
                    SdpType::Answer => handle.send_answer_sdp(sdp, self.loopback),
                }
            }
            HandleEvent::RemoteDescription(sdp) => {
                if role.on_remote_description(&sdp) == RemoteAction::Propagate {
                    if let Some(handle) = self.handle_for(role) {
                        handle.set_remote_description(sdp);
                    }
                }
            }
            HandleEvent::NewPublisher(info) => {
                if self.loopback {
                    debug!("Loopback mode, not subscribing to feed {}", info.id);
                    return;
                }
                if self.subscribers.contains_key(&info.id) {
                    return;
                }
                info!(
                    "Subscribing to feed {} ({})",
                    info.id,
                    info.display.as_deref().unwrap_or("anonymous")
                );
                match self.spawn_handle(Role::subscriber(info.id)).await {
                    Ok(handle) => {
                        handle.attach();
                        self.subscribers.insert(info.id, handle);
                    }
                    Err(e) => error!("Failed to subscribe to feed {}: {}", info.id, e),
                }
            }
            HandleEvent::PublisherLeft(feed) => {
                if let Some(subscriber) = self.subscribers.remove(&feed) {
                    info!("Feed {} left, detaching subscriber", feed);
                    subscriber.detach().await;
                }
            }
            HandleEvent::WebRtc(event) => info!("{} (handle {:?}): {:?}", role, handle_id, event),
            HandleEvent::Detached => {
                debug!("{} detached", role);
                if let Role::Subscriber { feeder_id } = role {
                    self.subscribers.remove(&feeder_id);
                }
            }
            HandleEvent::Error(e) if e.is_fatal() => error!("{} failed: {}", role, e),
            HandleEvent::Error(e) => warn!("{}: {}", role, e),
        }
    }

    /// Wait for the next notification and handle it
    pub async fn process_next(&mut self) -> Option<Notification> {
        let notification = self.events.recv().await?;
        self.handle_notification(notification.clone()).await;
        Some(notification)
    }

    /// Process notifications until `shutdown` fires or the long poll ends
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), JanusError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                result = &mut self.poll => {
                    return match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(JanusError::Transport(e)),
                        Err(e) => Err(JanusError::InvalidState(format!("long poll task failed: {}", e))),
                    };
                }
                Some(notification) = self.events.recv() => {
                    self.handle_notification(notification).await;
                }
            }
        }
    }

    /// Detach every handle and destroy the session
    pub async fn shutdown(mut self) -> Result<(), JanusError> {
        for (_, subscriber) in self.subscribers.drain() {
            subscriber.detach().await;
        }
        if let Some(publisher) = self.publisher.take() {
            publisher.detach().await;
        }
        self.session.destroy().await
    }
}

async fn forward_local_candidates(
    handle: PluginHandle,
    mut candidates: mpsc::UnboundedReceiver<Option<IceCandidate>>,
    loopback: bool,
) {
    while let Some(candidate) = candidates.recv().await {
        if handle.state().is_terminal() {
            break;
        }
        handle.send_local_ice_candidate(candidate, loopback);
    }
    debug!("{} candidate forwarding stopped", handle.role());
}
