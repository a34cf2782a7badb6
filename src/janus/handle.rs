//! Plugin handle state machine
//!
//! A [`PluginHandle`] is a cheap front for a task that owns all mutable
//! handle state: the room, the local and remote descriptions and the queue
//! of remote ICE candidates received before negotiation completed.
//! Public operations and long-poll deliveries are enqueued onto that task,
//! so every step that touches the media engine runs in order.

use super::calls::InFlightCalls;
use super::protocol::{
    Envelope, FeederId, HandleId, IceCandidate, PluginData, PublisherInfo, RoomEvent, RoomRequest, SdpType,
    SessionDescription, VideoRoomData, WebRtcEvent, VIDEOROOM_PLUGIN,
};
use super::role::{RemoteAction, Role};
use super::room::Room;
use super::session::SessionContext;
use super::transaction::TransactionManager;
use super::JanusError;
use crate::media::{MediaEngine, SdpTransform};
use crate::transport::TransportError;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, oneshot, watch};

/// Handle lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Created, not attached to the plugin yet
    Uninitialized,
    /// Plugin handle id assigned, join in progress
    Attached,
    /// Room membership confirmed
    Connected,
    /// Detached and released
    Closed,
    /// Failed; every later operation is a no-op
    Error,
}

impl HandleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandleState::Closed | HandleState::Error)
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleState::Uninitialized => "UNINITIALIZED",
            HandleState::Attached => "ATTACHED",
            HandleState::Connected => "CONNECTED",
            HandleState::Closed => "CLOSED",
            HandleState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Join parameters shared by every handle of a client
#[derive(Debug, Clone)]
pub struct HandleOptions {
    pub room_id: u64,
    pub display: String,
    /// Media flags of the publisher's configure request
    pub audio: bool,
    pub video: bool,
}

impl HandleOptions {
    pub fn new(room_id: u64, display: impl Into<String>) -> Self {
        Self {
            room_id,
            display: display.into(),
            audio: true,
            video: true,
        }
    }
}

/// Events reported by a handle to the application
#[derive(Debug, Clone)]
pub enum HandleEvent {
    Attached { id: HandleId },
    /// Room membership confirmed
    Joined {
        room: u64,
        publisher_id: Option<FeederId>,
        publishers: Vec<PublisherInfo>,
    },
    /// Local description created and applied; ready to be sent
    LocalDescription(SessionDescription),
    /// Remote description received from the gateway (or looped back)
    RemoteDescription(SessionDescription),
    /// Publisher newly observed in the room
    NewPublisher(PublisherInfo),
    /// Publisher left or unpublished
    PublisherLeft(FeederId),
    WebRtc(WebRtcEvent),
    Detached,
    Error(JanusError),
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub role: Role,
    pub handle_id: Option<HandleId>,
    pub event: HandleEvent,
}

/// Work items of the handle task
pub(crate) enum Command {
    Attach,
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription(SessionDescription),
    AddRemoteCandidate(IceCandidate),
    RemoveRemoteCandidates(Vec<IceCandidate>),
    SendOffer { sdp: SessionDescription, loopback: bool },
    SendAnswer { sdp: SessionDescription, loopback: bool },
    SendLocalCandidate { candidate: Option<IceCandidate>, loopback: bool },
    Hangup,
    /// Envelope delivered for this handle, by transaction or by sender
    Received { transaction: Option<String>, envelope: Envelope },
    /// Registered transaction evicted without a response
    Expired(String),
    Detach { done: oneshot::Sender<()> },
}

/// Client side of one VideoRoom plugin handle
#[derive(Clone)]
pub struct PluginHandle {
    role: Role,
    commands: mpsc::UnboundedSender<Command>,
    calls: Arc<InFlightCalls>,
    state: watch::Receiver<HandleState>,
    id: Arc<OnceLock<HandleId>>,
}

impl PluginHandle {
    /// Start the handle task. Nothing is sent until [`attach`](Self::attach).
    pub fn spawn(
        ctx: Arc<SessionContext>,
        role: Role,
        options: HandleOptions,
        engine: Arc<dyn MediaEngine>,
        transform: Arc<dyn SdpTransform>,
        events: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(HandleState::Uninitialized);
        let calls = InFlightCalls::new();
        let id = Arc::new(OnceLock::new());

        let task = HandleTask {
            ctx,
            role,
            options,
            engine: Some(engine),
            transform,
            events,
            commands: commands.downgrade(),
            calls: calls.clone(),
            state: state_tx,
            id_cell: id.clone(),
            handle_id: None,
            room: None,
            local_sdp: None,
            remote_sdp: None,
            local_unsent: false,
            pending_ice: Some(Vec::new()),
            transactions: HashSet::new(),
        };
        tokio::spawn(task.run(receiver));

        Self {
            role,
            commands,
            calls,
            state,
            id,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Server-assigned id, once attached
    pub fn id(&self) -> Option<HandleId> {
        self.id.get().copied()
    }

    pub fn state(&self) -> HandleState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<HandleState> {
        self.state.clone()
    }

    pub fn attach(&self) {
        self.enqueue(Command::Attach);
    }

    pub fn create_offer(&self) {
        self.enqueue(Command::CreateOffer);
    }

    pub fn create_answer(&self) {
        self.enqueue(Command::CreateAnswer);
    }

    pub fn set_remote_description(&self, sdp: SessionDescription) {
        self.enqueue(Command::SetRemoteDescription(sdp));
    }

    pub fn add_remote_ice_candidate(&self, candidate: IceCandidate) {
        self.enqueue(Command::AddRemoteCandidate(candidate));
    }

    pub fn remove_remote_ice_candidates(&self, candidates: Vec<IceCandidate>) {
        self.enqueue(Command::RemoveRemoteCandidates(candidates));
    }

    pub fn send_offer_sdp(&self, sdp: SessionDescription, loopback: bool) {
        self.enqueue(Command::SendOffer { sdp, loopback });
    }

    pub fn send_answer_sdp(&self, sdp: SessionDescription, loopback: bool) {
        self.enqueue(Command::SendAnswer { sdp, loopback });
    }

    /// Trickle a local candidate; `None` signals the end of gathering
    pub fn send_local_ice_candidate(&self, candidate: Option<IceCandidate>, loopback: bool) {
        self.enqueue(Command::SendLocalCandidate { candidate, loopback });
    }

    pub fn hangup(&self) {
        self.enqueue(Command::Hangup);
    }

    /// Cancel outstanding calls, detach from the plugin and release media.
    ///
    /// Returns once the handle is released.
    pub async fn detach(&self) {
        let cancelled = self.calls.close();
        if cancelled > 0 {
            debug!("{} detach cancelled {} outstanding call(s)", self.role, cancelled);
        }
        let (done, released) = oneshot::channel();
        if self.commands.send(Command::Detach { done }).is_err() {
            debug!("{} handle already released", self.role);
            return;
        }
        let _ = released.await;
    }

    fn enqueue(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("{} handle released, dropping request", self.role);
        }
    }
}

struct HandleTask {
    ctx: Arc<SessionContext>,
    role: Role,
    options: HandleOptions,
    /// Released exactly once, by teardown
    engine: Option<Arc<dyn MediaEngine>>,
    transform: Arc<dyn SdpTransform>,
    events: mpsc::UnboundedSender<Notification>,
    commands: mpsc::WeakUnboundedSender<Command>,
    calls: Arc<InFlightCalls>,
    state: watch::Sender<HandleState>,
    id_cell: Arc<OnceLock<HandleId>>,
    handle_id: Option<HandleId>,
    room: Option<Room>,
    local_sdp: Option<SessionDescription>,
    remote_sdp: Option<SessionDescription>,
    /// Local description created but not yet sent
    local_unsent: bool,
    /// Remote candidates held until both descriptions are set; `None` once drained
    pending_ice: Option<Vec<IceCandidate>>,
    /// Transactions registered by this handle and still awaiting a response
    transactions: HashSet<String>,
}

impl HandleTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("{} handle task started", self.role);
        while let Some(command) = commands.recv().await {
            self.handle_command(command).await;
            if self.engine.is_none() {
                break;
            }
        }
        if self.engine.is_some() {
            warn!("{} handle dropped without detach", self.role);
        }
        debug!("{} handle task stopped", self.role);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Attach => self.attach().await,
            Command::CreateOffer => self.create_local(SdpType::Offer).await,
            Command::CreateAnswer => self.create_local(SdpType::Answer).await,
            Command::SetRemoteDescription(sdp) => self.set_remote_description(sdp).await,
            Command::AddRemoteCandidate(candidate) => self.add_remote_candidate(candidate).await,
            Command::RemoveRemoteCandidates(candidates) => self.remove_remote_candidates(candidates).await,
            Command::SendOffer { sdp, loopback } => self.send_offer(sdp, loopback).await,
            Command::SendAnswer { sdp, loopback } => self.send_answer(sdp, loopback).await,
            Command::SendLocalCandidate { candidate, loopback } => {
                self.send_local_candidate(candidate, loopback).await
            }
            Command::Hangup => self.hangup().await,
            Command::Received { transaction, envelope } => {
                if let Some(transaction) = transaction {
                    self.transactions.remove(&transaction);
                }
                self.on_received(envelope).await;
            }
            Command::Expired(transaction) => self.on_expired(transaction).await,
            Command::Detach { done } => {
                self.teardown().await;
                let _ = done.send(());
            }
        }
    }

    fn state(&self) -> HandleState {
        *self.state.borrow()
    }

    fn set_state(&self, next: HandleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("{} handle state {} -> {}", self.role, previous, next);
        }
    }

    /// Engine to use, or `None` when the handle must ignore requests
    fn active_engine(&self) -> Option<Arc<dyn MediaEngine>> {
        if self.state().is_terminal() {
            return None;
        }
        self.engine.clone()
    }

    fn halted(&self) -> bool {
        self.active_engine().is_none()
    }

    fn notify(&self, event: HandleEvent) {
        let notification = Notification {
            role: self.role,
            handle_id: self.handle_id,
            event,
        };
        if self.events.send(notification).is_err() {
            debug!("{} handle listener is gone", self.role);
        }
    }

    /// Fatal failure: move to ERROR and report once
    fn fail(&self, err: JanusError) {
        match self.state() {
            HandleState::Error => warn!("{} handle already failed, not reporting: {}", self.role, err),
            HandleState::Closed => {
                error!("{} handle failed after close: {}", self.role, err);
                self.notify(HandleEvent::Error(err));
            }
            _ => {
                error!("{} handle failed: {}", self.role, err);
                self.set_state(HandleState::Error);
                self.notify(HandleEvent::Error(err));
            }
        }
    }

    /// Non-fatal failure: report, keep the current state
    fn report(&self, err: JanusError) {
        if self.state() == HandleState::Error {
            warn!("{} handle already failed, not reporting: {}", self.role, err);
            return;
        }
        warn!("{} handle error: {}", self.role, err);
        self.notify(HandleEvent::Error(err));
    }

    /// Route a later long-poll response for `transaction` back onto this queue
    fn expect_response(&mut self, transaction: &str) -> Result<(), JanusError> {
        let commands = self.commands.clone();
        let expiry = self.commands.clone();
        let id = transaction.to_string();
        let expired_id = transaction.to_string();
        self.ctx.transactions().register_with_expiry(
            transaction,
            move |envelope| {
                let Some(commands) = commands.upgrade() else {
                    return;
                };
                if commands
                    .send(Command::Received {
                        transaction: Some(id),
                        envelope,
                    })
                    .is_err()
                {
                    debug!("Response arrived for a released handle");
                }
            },
            move || {
                if let Some(commands) = expiry.upgrade() {
                    let _ = commands.send(Command::Expired(expired_id));
                }
            },
        )?;
        self.transactions.insert(transaction.to_string());
        Ok(())
    }

    /// An expired join is terminal; other expiries are reported
    async fn on_expired(&mut self, transaction: String) {
        if !self.transactions.remove(&transaction) {
            return;
        }
        let err = JanusError::Timeout(transaction);
        if self.halted() {
            debug!("{} handle ignoring expiry: {}", self.role, err);
            return;
        }
        if self.state() == HandleState::Attached {
            error!("{} join unanswered, detaching: {}", self.role, err);
            self.calls.close();
            self.teardown().await;
            self.fail(err);
            return;
        }
        self.report(err);
    }

    fn forget_transaction(&mut self, transaction: &str) {
        self.ctx.transactions().remove(transaction);
        self.transactions.remove(transaction);
    }

    async fn attach(&mut self) {
        if self.halted() {
            return;
        }
        if self.state() != HandleState::Uninitialized {
            self.report(JanusError::InvalidState(format!("attach in state {}", self.state())));
            return;
        }

        let transaction = TransactionManager::next_id();
        let ctx = self.ctx.clone();
        let result = self
            .calls
            .begin()
            .run(ctx.transport().attach(ctx.id(), &transaction, VIDEOROOM_PLUGIN))
            .await;

        match result {
            Ok(Envelope::Success { data: Some(data), .. }) => self.on_attached(data.id).await,
            Ok(Envelope::Error { error, .. }) => self.fail(JanusError::Server {
                code: error.code,
                reason: error.reason,
            }),
            Ok(other) => self.fail(JanusError::ProtocolViolation(format!(
                "Unexpected attach response: {}",
                other.kind()
            ))),
            Err(TransportError::Cancelled) => debug!("{} attach cancelled", self.role),
            Err(e) => self.fail(e.into()),
        }
    }

    async fn on_attached(&mut self, id: HandleId) {
        self.handle_id = Some(id);
        let _ = self.id_cell.set(id);
        self.room = Some(Room::new(self.ctx.id(), id, self.options.room_id));
        if let Some(commands) = self.commands.upgrade() {
            self.ctx.add_route(id, commands);
        }
        self.set_state(HandleState::Attached);
        info!("{} attached as handle {}", self.role, id);
        self.notify(HandleEvent::Attached { id });
        self.join().await;
    }

    async fn join(&mut self) {
        if self.halted() {
            return;
        }
        let Some(handle_id) = self.handle_id else {
            self.report(JanusError::InvalidState("join before attach".to_string()));
            return;
        };

        let body = RoomRequest::Join {
            room: self.options.room_id,
            ptype: self.role.peer_type(),
            display: self.options.display.clone(),
            feed: self.role.feeder_id(),
        };
        let transaction = TransactionManager::next_id();
        if let Err(e) = self.expect_response(&transaction) {
            self.report(e);
            return;
        }

        let ctx = self.ctx.clone();
        let result = self
            .calls
            .begin()
            .run(ctx.transport().join(ctx.id(), handle_id, &transaction, &body))
            .await;

        let failure = match result {
            Ok(Envelope::Event { plugindata, jsep, .. }) => {
                // Answered inline instead of over the long poll
                self.forget_transaction(&transaction);
                self.on_plugin_event(plugindata, jsep).await;
                return;
            }
            Ok(Envelope::Ack { .. }) | Ok(Envelope::Keepalive { .. }) => return,
            Ok(Envelope::Error { error, .. }) => JanusError::Server {
                code: error.code,
                reason: error.reason,
            },
            Ok(other) => JanusError::ProtocolViolation(format!("Unexpected join response: {}", other.kind())),
            Err(TransportError::Cancelled) => {
                debug!("{} join cancelled", self.role);
                self.forget_transaction(&transaction);
                return;
            }
            Err(e) => e.into(),
        };

        error!("{} join failed, detaching: {}", self.role, failure);
        self.forget_transaction(&transaction);
        self.calls.close();
        self.teardown().await;
        self.fail(failure);
    }

    async fn create_local(&mut self, kind: SdpType) {
        let Some(engine) = self.active_engine() else {
            return;
        };
        if self.state() != HandleState::Connected {
            self.report(JanusError::InvalidState(format!(
                "create {} in state {}",
                kind.as_str(),
                self.state()
            )));
            return;
        }
        if self.local_unsent {
            self.report(JanusError::MultipleLocalDescriptions);
            return;
        }

        let created = match kind {
            SdpType::Offer => engine.create_offer().await,
            SdpType::Answer => engine.create_answer().await,
        };
        let sdp = match created {
            Ok(sdp) => self.transform.apply(sdp),
            Err(e) => return self.fail(e.into()),
        };
        self.local_unsent = true;

        if let Err(e) = engine.set_local_description(&sdp).await {
            return self.fail(e.into());
        }
        debug!("{} local {} set", self.role, sdp.sdp_type.as_str());
        self.local_sdp = Some(sdp.clone());
        self.notify(HandleEvent::LocalDescription(sdp));
        self.on_description_set().await;
    }

    async fn set_remote_description(&mut self, sdp: SessionDescription) {
        let Some(engine) = self.active_engine() else {
            return;
        };
        if self.state() != HandleState::Connected {
            self.report(JanusError::InvalidState(format!(
                "set remote {} in state {}",
                sdp.sdp_type.as_str(),
                self.state()
            )));
            return;
        }

        let sdp = self.transform.apply(sdp);
        if let Err(e) = engine.set_remote_description(&sdp).await {
            return self.fail(e.into());
        }
        debug!("{} remote {} set", self.role, sdp.sdp_type.as_str());
        self.remote_sdp = Some(sdp);
        self.on_description_set().await;
    }

    async fn on_description_set(&mut self) {
        if self.local_sdp.is_some() && self.remote_sdp.is_some() {
            self.drain_candidates().await;
        }
    }

    /// Apply queued remote candidates in arrival order. Runs at most once.
    async fn drain_candidates(&mut self) {
        let Some(queued) = self.pending_ice.take() else {
            return;
        };
        let Some(engine) = self.active_engine() else {
            return;
        };
        if !queued.is_empty() {
            debug!("{} applying {} queued remote candidate(s)", self.role, queued.len());
        }
        for candidate in &queued {
            if let Err(e) = engine.add_ice_candidate(candidate).await {
                return self.fail(e.into());
            }
        }
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(engine) = self.active_engine() else {
            return;
        };
        if let Some(queue) = self.pending_ice.as_mut() {
            queue.push(candidate);
            return;
        }
        if let Err(e) = engine.add_ice_candidate(&candidate).await {
            self.fail(e.into());
        }
    }

    async fn remove_remote_candidates(&mut self, candidates: Vec<IceCandidate>) {
        if self.halted() {
            return;
        }
        // Queued additions reach the engine before the removal does
        self.drain_candidates().await;
        let Some(engine) = self.active_engine() else {
            return;
        };
        if let Err(e) = engine.remove_ice_candidates(&candidates).await {
            self.fail(e.into());
        }
    }

    async fn send_offer(&mut self, sdp: SessionDescription, loopback: bool) {
        if self.halted() {
            return;
        }
        let (Some(handle_id), HandleState::Connected) = (self.handle_id, self.state()) else {
            self.report(JanusError::InvalidState(format!("send offer in state {}", self.state())));
            return;
        };
        self.local_unsent = false;

        if loopback {
            debug!("{} looping local offer back as the remote answer", self.role);
            self.on_remote_jsep(SessionDescription::answer(sdp.sdp)).await;
            return;
        }

        let body = RoomRequest::Configure {
            audio: self.options.audio,
            video: self.options.video,
        };
        let transaction = TransactionManager::next_id();
        if let Err(e) = self.expect_response(&transaction) {
            self.report(e);
            return;
        }

        let ctx = self.ctx.clone();
        let result = self
            .calls
            .begin()
            .run(ctx.transport().offer(ctx.id(), handle_id, &transaction, &body, &sdp))
            .await;

        match result {
            Ok(Envelope::Event { plugindata, jsep, .. }) => {
                self.forget_transaction(&transaction);
                self.on_plugin_event(plugindata, jsep).await;
            }
            Ok(Envelope::Ack { .. }) | Ok(Envelope::Keepalive { .. }) => {}
            Ok(Envelope::Error { error, .. }) => {
                self.forget_transaction(&transaction);
                self.report(JanusError::Server {
                    code: error.code,
                    reason: error.reason,
                });
            }
            Ok(other) => {
                self.forget_transaction(&transaction);
                self.calls.cancel_all();
                self.fail(JanusError::ProtocolViolation(format!(
                    "Unexpected configure response: {}",
                    other.kind()
                )));
            }
            Err(TransportError::Cancelled) => {
                debug!("{} offer cancelled", self.role);
                self.forget_transaction(&transaction);
            }
            Err(e) => {
                self.forget_transaction(&transaction);
                self.calls.cancel_all();
                self.fail(e.into());
            }
        }
    }

    async fn send_answer(&mut self, sdp: SessionDescription, loopback: bool) {
        if self.halted() {
            return;
        }
        if loopback {
            error!("{} cannot send an answer in loopback mode", self.role);
            self.local_unsent = false;
            return;
        }
        let (Some(handle_id), HandleState::Connected) = (self.handle_id, self.state()) else {
            self.report(JanusError::InvalidState(format!("send answer in state {}", self.state())));
            return;
        };
        self.local_unsent = false;

        let body = RoomRequest::Start {
            room: self.options.room_id,
        };
        let transaction = TransactionManager::next_id();
        if let Err(e) = self.expect_response(&transaction) {
            self.report(e);
            return;
        }

        let ctx = self.ctx.clone();
        let result = self
            .calls
            .begin()
            .run(ctx.transport().send(ctx.id(), handle_id, &transaction, &body, &sdp))
            .await;

        match result {
            Ok(raw) => match Envelope::from_value(raw) {
                Ok(Envelope::Error { error, .. }) => {
                    self.forget_transaction(&transaction);
                    self.report(JanusError::Server {
                        code: error.code,
                        reason: error.reason,
                    });
                }
                Ok(Envelope::Event { plugindata, jsep, .. }) => {
                    self.forget_transaction(&transaction);
                    self.on_plugin_event(plugindata, jsep).await;
                }
                Ok(envelope) => debug!("{} start answered with {}", self.role, envelope.kind()),
                Err(e) => debug!("{} start answered with a non-envelope body: {}", self.role, e),
            },
            Err(TransportError::Cancelled) => {
                debug!("{} answer cancelled", self.role);
                self.forget_transaction(&transaction);
            }
            Err(e) => {
                self.forget_transaction(&transaction);
                self.calls.cancel_all();
                self.fail(e.into());
            }
        }
    }

    async fn send_local_candidate(&mut self, candidate: Option<IceCandidate>, loopback: bool) {
        if self.halted() {
            return;
        }
        if loopback {
            if let Some(candidate) = candidate {
                self.add_remote_candidate(candidate).await;
            }
            return;
        }
        let Some(handle_id) = self.handle_id else {
            self.report(JanusError::InvalidState("trickle before attach".to_string()));
            return;
        };

        let transaction = TransactionManager::next_id();
        let ctx = self.ctx.clone();
        let call = self.calls.begin();
        let result = match &candidate {
            Some(candidate) => {
                call.run(ctx.transport().trickle(ctx.id(), handle_id, &transaction, candidate))
                    .await
            }
            None => {
                call.run(ctx.transport().trickle_completed(ctx.id(), handle_id, &transaction))
                    .await
            }
        };

        let failure = match result {
            Ok(Envelope::Ack { .. }) | Ok(Envelope::Keepalive { .. }) => return,
            Ok(Envelope::Event { .. }) => {
                debug!("{} trickle answered with an event", self.role);
                return;
            }
            Ok(Envelope::Error { error, .. }) => {
                self.report(JanusError::Server {
                    code: error.code,
                    reason: error.reason,
                });
                return;
            }
            Ok(other) => JanusError::ProtocolViolation(format!("Unexpected trickle response: {}", other.kind())),
            Err(TransportError::Cancelled) => {
                debug!("{} trickle cancelled", self.role);
                return;
            }
            Err(e) => e.into(),
        };

        self.calls.close();
        self.teardown().await;
        self.fail(failure);
    }

    async fn hangup(&mut self) {
        if self.halted() {
            return;
        }
        let Some(handle_id) = self.handle_id else {
            self.report(JanusError::InvalidState("hangup before attach".to_string()));
            return;
        };
        let transaction = TransactionManager::next_id();
        let ctx = self.ctx.clone();
        let result = self
            .calls
            .begin()
            .run(ctx.transport().hangup(ctx.id(), handle_id, &transaction))
            .await;
        match result {
            Ok(()) => debug!("{} hangup sent", self.role),
            Err(TransportError::Cancelled) => debug!("{} hangup cancelled", self.role),
            Err(e) => {
                let err = JanusError::from(e);
                if err.is_fatal() {
                    self.fail(err);
                } else {
                    self.report(err);
                }
            }
        }
    }

    async fn on_received(&mut self, envelope: Envelope) {
        if self.halted() {
            debug!("{} handle ignoring {} in state {}", self.role, envelope.kind(), self.state());
            return;
        }
        match envelope {
            Envelope::Ack { .. } | Envelope::Keepalive { .. } => {}
            Envelope::Event { plugindata, jsep, .. } => self.on_plugin_event(plugindata, jsep).await,
            Envelope::Error { error, .. } => self.report(JanusError::Server {
                code: error.code,
                reason: error.reason,
            }),
            Envelope::Unrecognized => debug!("{} handle ignoring unknown event", self.role),
            other => match other.webrtc_event() {
                Some(event) => {
                    debug!("{} media event {:?}", self.role, event);
                    self.notify(HandleEvent::WebRtc(event));
                }
                None => debug!("{} handle ignoring {}", self.role, other.kind()),
            },
        }
    }

    async fn on_plugin_event(&mut self, plugindata: Option<PluginData>, jsep: Option<SessionDescription>) {
        let data = match plugindata.map(|p| p.videoroom()).transpose() {
            Ok(data) => data,
            Err(e) => return self.fail(e),
        };

        match data {
            Some(VideoRoomData::Joined { room, id, publishers, .. }) => {
                self.on_joined(room, id, publishers);
            }
            Some(VideoRoomData::Attached { room, .. }) => self.on_subscriber_attached(room),
            Some(VideoRoomData::Event(event)) => self.on_room_event(event),
            Some(VideoRoomData::Unrecognized) => debug!("{} handle ignoring videoroom payload", self.role),
            None => debug!("{} event without plugin data", self.role),
        }

        if let Some(jsep) = jsep {
            if !self.halted() {
                self.on_remote_jsep(jsep).await;
            }
        }
    }

    /// ATTACHED -> CONNECTED; returns whether the transition happened
    fn mark_connected(&mut self, publisher_id: Option<FeederId>) -> bool {
        match self.state() {
            HandleState::Attached => {
                if let (Some(room), Some(id)) = (self.room.as_mut(), publisher_id) {
                    room.set_publisher_id(id);
                }
                self.set_state(HandleState::Connected);
                true
            }
            HandleState::Connected => {
                debug!("{} duplicate join confirmation", self.role);
                false
            }
            state => {
                warn!("{} join confirmation in state {}", self.role, state);
                false
            }
        }
    }

    fn on_joined(&mut self, room: Option<u64>, id: FeederId, publishers: Vec<PublisherInfo>) {
        let joined = self.mark_connected(Some(id));
        let role = self.role;
        let fresh = self
            .room
            .as_mut()
            .map(|r| role.on_room_event(r, &publishers, None))
            .unwrap_or_default();
        if joined {
            info!("{} joined room as {}", self.role, id);
            self.notify(HandleEvent::Joined {
                room: room.unwrap_or(self.options.room_id),
                publisher_id: Some(id),
                publishers,
            });
        }
        for info in fresh {
            self.notify(HandleEvent::NewPublisher(info));
        }
    }

    /// Subscribers receive `attached` as their join confirmation
    fn on_subscriber_attached(&mut self, room: Option<u64>) {
        if !matches!(self.role, Role::Subscriber { .. }) {
            debug!("{} handle ignoring attached event", self.role);
            return;
        }
        if self.mark_connected(None) {
            info!("{} joined room", self.role);
            self.notify(HandleEvent::Joined {
                room: room.unwrap_or(self.options.room_id),
                publisher_id: None,
                publishers: Vec::new(),
            });
        }
    }

    fn on_room_event(&mut self, event: RoomEvent) {
        if let Some(code) = event.error_code {
            self.report(JanusError::Server {
                code,
                reason: event.error.clone().unwrap_or_default(),
            });
        }

        let leaving = event.leaving_id();
        let role = self.role;
        let fresh = match (self.room.as_mut(), event.publishers.as_deref()) {
            (Some(room), Some(publishers)) => role.on_room_event(room, publishers, leaving),
            _ => Vec::new(),
        };
        for info in fresh {
            self.notify(HandleEvent::NewPublisher(info));
        }

        for departed in leaving.into_iter().chain(event.unpublished_id()) {
            let removed = self.room.as_mut().and_then(|room| room.remove_publisher(departed));
            if removed.is_some() {
                debug!("{} publisher {} left", self.role, departed);
                self.notify(HandleEvent::PublisherLeft(departed));
            }
        }
    }

    async fn on_remote_jsep(&mut self, sdp: SessionDescription) {
        self.notify(HandleEvent::RemoteDescription(sdp.clone()));
        match self.role.on_remote_description(&sdp) {
            RemoteAction::Propagate => {}
            RemoteAction::AcceptOffer => {
                self.set_remote_description(sdp).await;
                if !self.halted() {
                    self.create_local(SdpType::Answer).await;
                }
            }
        }
    }

    /// Release everything the handle holds. Runs at most once.
    async fn teardown(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        self.calls.close();
        for transaction in self.transactions.drain() {
            self.ctx.transactions().remove(&transaction);
        }

        if let Some(id) = self.handle_id {
            self.ctx.remove_route(id);
            if self.state() != HandleState::Error {
                let transaction = TransactionManager::next_id();
                match self.ctx.transport().detach(self.ctx.id(), id, &transaction).await {
                    Ok(()) => {}
                    Err(TransportError::Server { code, reason }) => {
                        self.report(JanusError::Server { code, reason })
                    }
                    Err(e) => warn!("Detach request for handle {} failed: {}", id, e),
                }
            }
        }

        self.room = None;
        self.pending_ice = None;
        if self.state() != HandleState::Error {
            self.set_state(HandleState::Closed);
        }

        // Data channel and event log stop before the peer connection goes away
        engine.close_data_channel().await;
        engine.stop_event_log().await;
        engine.close().await;
        info!("{} handle released", self.role);
        self.notify(HandleEvent::Detached);
    }
}
