//! Test doubles for the transport and media seams

use crate::janus::protocol::{
    Envelope, HandleId, IceCandidate, PeerType, RoomRequest, SdpType, ServerInfo, SessionDescription, SessionId,
};
use crate::media::{MediaEngine, MediaEngineFactory, MediaError};
use crate::transport::{SignalingTransport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Poll `check` until it yields a value; panics after two seconds
pub async fn eventually<T, F>(mut check: F) -> T
where
    F: FnMut() -> Option<T>,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(value) = check() {
            return value;
        }
        if Instant::now() >= deadline {
            panic!("condition not met within 2s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    CreateSession,
    ServerInfo,
    Attach { transaction: String },
    Join { handle: HandleId, transaction: String, body: RoomRequest },
    Offer { handle: HandleId, transaction: String, body: RoomRequest, jsep: SessionDescription },
    Send { handle: HandleId, transaction: String, body: RoomRequest, jsep: SessionDescription },
    Trickle { handle: HandleId, candidate: Option<IceCandidate> },
    /// A blocked trickle was dropped before completing
    TrickleAborted,
    Detach { handle: HandleId },
    Hangup { handle: HandleId },
    Destroy,
}

struct RecordOnDrop {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    call: TransportCall,
}

impl Drop for RecordOnDrop {
    fn drop(&mut self) {
        self.calls.lock().push(self.call.clone());
    }
}

/// Gateway that acks everything and records each call
pub struct MockTransport {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    next_handle: AtomicU64,
    fail_attach: AtomicBool,
    fail_join: AtomicBool,
    block_trickle: AtomicBool,
    reject_hangup: AtomicBool,
    join_response: Mutex<Option<Value>>,
    poll_tx: mpsc::UnboundedSender<Result<Vec<Value>, TransportError>>,
    poll_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Vec<Value>, TransportError>>>,
}

impl MockTransport {
    pub const SESSION_ID: SessionId = 1001;
    /// Id of the first attached handle; later handles count up
    pub const HANDLE_ID: HandleId = 42;

    pub fn new() -> Arc<Self> {
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            next_handle: AtomicU64::new(Self::HANDLE_ID),
            fail_attach: AtomicBool::new(false),
            fail_join: AtomicBool::new(false),
            block_trickle: AtomicBool::new(false),
            reject_hangup: AtomicBool::new(false),
            join_response: Mutex::new(None),
            poll_tx,
            poll_rx: tokio::sync::Mutex::new(poll_rx),
        })
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn fail_attach(&self) {
        self.fail_attach.store(true, Ordering::SeqCst);
    }

    pub fn fail_join(&self) {
        self.fail_join.store(true, Ordering::SeqCst);
    }

    /// Make trickle calls hang until cancelled
    pub fn block_trickle(&self) {
        self.block_trickle.store(true, Ordering::SeqCst);
    }

    /// Answer hangups with a gateway error
    pub fn reject_hangup(&self) {
        self.reject_hangup.store(true, Ordering::SeqCst);
    }

    /// Answer joins with `response` instead of an ack
    pub fn respond_to_join(&self, response: Value) {
        *self.join_response.lock() = Some(response);
    }

    /// Queue the result of the next long poll
    pub fn push_poll(&self, result: Result<Vec<Value>, TransportError>) {
        let _ = self.poll_tx.send(result);
    }

    /// Transaction of the first join request, if one was sent
    pub fn join_transaction(&self) -> Option<String> {
        self.calls.lock().iter().find_map(|call| match call {
            TransportCall::Join { transaction, .. } => Some(transaction.clone()),
            _ => None,
        })
    }

    pub fn join_transaction_for(&self, handle: HandleId) -> Option<String> {
        self.calls.lock().iter().find_map(|call| match call {
            TransportCall::Join { handle: h, transaction, .. } if *h == handle => Some(transaction.clone()),
            _ => None,
        })
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }

    fn ack() -> Envelope {
        Envelope::Ack { transaction: None }
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    async fn create_session(&self, transaction: &str) -> Result<Envelope, TransportError> {
        self.record(TransportCall::CreateSession);
        Envelope::from_value(json!({
            "janus": "success", "transaction": transaction, "data": {"id": Self::SESSION_ID}
        }))
        .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn server_info(&self) -> Result<ServerInfo, TransportError> {
        self.record(TransportCall::ServerInfo);
        Ok(ServerInfo::default())
    }

    async fn attach(&self, _session: SessionId, transaction: &str, _plugin: &str) -> Result<Envelope, TransportError> {
        self.record(TransportCall::Attach {
            transaction: transaction.to_string(),
        });
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(TransportError::Http("connection refused".to_string()));
        }
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        Envelope::from_value(json!({"janus": "success", "transaction": transaction, "data": {"id": id}}))
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn join(
        &self,
        _session: SessionId,
        handle: HandleId,
        transaction: &str,
        body: &RoomRequest,
    ) -> Result<Envelope, TransportError> {
        self.record(TransportCall::Join {
            handle,
            transaction: transaction.to_string(),
            body: body.clone(),
        });
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(TransportError::Status(500));
        }
        match self.join_response.lock().clone() {
            Some(response) => Envelope::from_value(response).map_err(|e| TransportError::Decode(e.to_string())),
            None => Ok(Self::ack()),
        }
    }

    async fn offer(
        &self,
        _session: SessionId,
        handle: HandleId,
        transaction: &str,
        body: &RoomRequest,
        jsep: &SessionDescription,
    ) -> Result<Envelope, TransportError> {
        self.record(TransportCall::Offer {
            handle,
            transaction: transaction.to_string(),
            body: body.clone(),
            jsep: jsep.clone(),
        });
        Ok(Self::ack())
    }

    async fn send(
        &self,
        _session: SessionId,
        handle: HandleId,
        transaction: &str,
        body: &RoomRequest,
        jsep: &SessionDescription,
    ) -> Result<Value, TransportError> {
        self.record(TransportCall::Send {
            handle,
            transaction: transaction.to_string(),
            body: body.clone(),
            jsep: jsep.clone(),
        });
        Ok(json!({"janus": "ack", "transaction": transaction}))
    }

    async fn trickle(
        &self,
        _session: SessionId,
        handle: HandleId,
        _transaction: &str,
        candidate: &IceCandidate,
    ) -> Result<Envelope, TransportError> {
        self.record(TransportCall::Trickle {
            handle,
            candidate: Some(candidate.clone()),
        });
        if self.block_trickle.load(Ordering::SeqCst) {
            let _aborted = RecordOnDrop {
                calls: self.calls.clone(),
                call: TransportCall::TrickleAborted,
            };
            std::future::pending::<()>().await;
        }
        Ok(Self::ack())
    }

    async fn trickle_completed(
        &self,
        _session: SessionId,
        handle: HandleId,
        _transaction: &str,
    ) -> Result<Envelope, TransportError> {
        self.record(TransportCall::Trickle { handle, candidate: None });
        Ok(Self::ack())
    }

    async fn detach(&self, _session: SessionId, handle: HandleId, _transaction: &str) -> Result<(), TransportError> {
        self.record(TransportCall::Detach { handle });
        Ok(())
    }

    async fn hangup(&self, _session: SessionId, handle: HandleId, _transaction: &str) -> Result<(), TransportError> {
        self.record(TransportCall::Hangup { handle });
        if self.reject_hangup.load(Ordering::SeqCst) {
            return Err(TransportError::Server {
                code: 458,
                reason: "No such session".to_string(),
            });
        }
        Ok(())
    }

    async fn destroy(&self, _session: SessionId, _transaction: &str) -> Result<(), TransportError> {
        self.record(TransportCall::Destroy);
        Ok(())
    }

    async fn poll(&self, _session: SessionId, _max_events: u32) -> Result<Vec<Value>, TransportError> {
        let mut polls = self.poll_rx.lock().await;
        match polls.recv().await {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOp {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    RemoveCandidates(Vec<String>),
    CloseDataChannel,
    StopEventLog,
    Close,
}

/// Media engine recording every operation in order
pub struct MockEngine {
    peer_type: Option<PeerType>,
    ops: Mutex<Vec<EngineOp>>,
    fail_create: AtomicBool,
    local_candidates: Option<mpsc::UnboundedSender<Option<IceCandidate>>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peer_type: None,
            ops: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            local_candidates: None,
        })
    }

    fn with_candidates(peer_type: PeerType, local_candidates: mpsc::UnboundedSender<Option<IceCandidate>>) -> Arc<Self> {
        Arc::new(Self {
            peer_type: Some(peer_type),
            ops: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            local_candidates: Some(local_candidates),
        })
    }

    pub fn peer_type(&self) -> Option<PeerType> {
        self.peer_type
    }

    pub fn ops(&self) -> Vec<EngineOp> {
        self.ops.lock().clone()
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// Publish a gathered local candidate as the real engine would
    pub fn gather(&self, candidate: Option<IceCandidate>) {
        if let Some(tx) = &self.local_candidates {
            let _ = tx.send(candidate);
        }
    }

    fn record(&self, op: EngineOp) {
        self.ops.lock().push(op);
    }

    fn created(&self, op: EngineOp, sdp: SessionDescription) -> Result<SessionDescription, MediaError> {
        self.record(op);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(MediaError::CreateFailed("codec negotiation failed".to_string()));
        }
        Ok(sdp)
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.created(EngineOp::CreateOffer, SessionDescription::offer("v=0 local-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.created(EngineOp::CreateAnswer, SessionDescription::answer("v=0 local-answer"))
    }

    async fn set_local_description(&self, sdp: &SessionDescription) -> Result<(), MediaError> {
        self.record(EngineOp::SetLocal(sdp.sdp_type));
        Ok(())
    }

    async fn set_remote_description(&self, sdp: &SessionDescription) -> Result<(), MediaError> {
        self.record(EngineOp::SetRemote(sdp.sdp_type));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.record(EngineOp::AddCandidate(candidate.candidate.clone()));
        Ok(())
    }

    async fn remove_ice_candidates(&self, candidates: &[IceCandidate]) -> Result<(), MediaError> {
        self.record(EngineOp::RemoveCandidates(
            candidates.iter().map(|c| c.candidate.clone()).collect(),
        ));
        Ok(())
    }

    async fn close_data_channel(&self) {
        self.record(EngineOp::CloseDataChannel);
    }

    async fn stop_event_log(&self) {
        self.record(EngineOp::StopEventLog);
    }

    async fn close(&self) {
        self.record(EngineOp::Close);
    }
}

/// Factory handing out [`MockEngine`]s and keeping them for inspection
#[derive(Default)]
pub struct MockFactory {
    engines: Mutex<Vec<Arc<MockEngine>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.engines.lock().clone()
    }
}

#[async_trait]
impl MediaEngineFactory for MockFactory {
    async fn create(
        &self,
        peer_type: PeerType,
        local_candidates: mpsc::UnboundedSender<Option<IceCandidate>>,
    ) -> Result<Arc<dyn MediaEngine>, MediaError> {
        let engine = MockEngine::with_candidates(peer_type, local_candidates);
        self.engines.lock().push(engine.clone());
        Ok(engine)
    }
}
