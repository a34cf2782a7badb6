//! Gateway session and long-poll router
//!
//! A [`Session`] owns the [`SessionContext`] shared by every plugin handle:
//! the session id, the transport, the transaction registry and the table
//! routing server pushes to handle queues by `sender`.

use super::handle::Command;
use super::protocol::{Envelope, HandleId, ServerInfo, SessionId};
use super::transaction::TransactionManager;
use super::JanusError;
use crate::transport::{SignalingTransport, TransportError};
use log::{debug, error, info, trace, warn};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Long-poll loop parameters
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// `maxev` of each poll request
    pub max_events: u32,
    /// Registrations older than this are evicted after each poll cycle
    pub transaction_ttl: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_events: 10,
            transaction_ttl: Duration::from_secs(120),
        }
    }
}

/// State shared between a session, its handles and its long-poll loop
pub struct SessionContext {
    id: SessionId,
    transport: Arc<dyn SignalingTransport>,
    transactions: TransactionManager,
    routes: RwLock<HashMap<HandleId, mpsc::UnboundedSender<Command>>>,
}

impl SessionContext {
    pub fn new(id: SessionId, transport: Arc<dyn SignalingTransport>) -> Arc<Self> {
        Arc::new(Self {
            id,
            transport,
            transactions: TransactionManager::new(),
            routes: RwLock::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn transport(&self) -> &Arc<dyn SignalingTransport> {
        &self.transport
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub(crate) fn add_route(&self, handle: HandleId, commands: mpsc::UnboundedSender<Command>) {
        self.routes.write().insert(handle, commands);
    }

    pub(crate) fn remove_route(&self, handle: HandleId) {
        self.routes.write().remove(&handle);
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Route one envelope delivered by the long poll.
    ///
    /// Responses go to the transaction that is waiting for them; anything
    /// else is a push for the handle named by `sender`. Returns whether the
    /// envelope reached a recipient.
    pub fn deliver(&self, payload: Value) -> bool {
        let envelope = match Envelope::from_value(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Session {}: dropping long-poll payload: {}", self.id, e);
                return false;
            }
        };

        if matches!(envelope, Envelope::Ack { .. } | Envelope::Keepalive { .. }) {
            trace!("Session {}: {}", self.id, envelope.kind());
            return true;
        }

        if let Some(transaction) = envelope.transaction() {
            let transaction = transaction.to_string();
            if self.transactions.dispatch(&transaction, envelope.clone()) {
                return true;
            }
        }

        let Some(sender) = envelope.sender() else {
            debug!("Session {}: unroutable {} event", self.id, envelope.kind());
            return false;
        };
        let route = self.routes.read().get(&sender).cloned();
        match route {
            Some(commands) => {
                let kind = envelope.kind();
                if commands
                    .send(Command::Received {
                        transaction: None,
                        envelope,
                    })
                    .is_err()
                {
                    debug!("Session {}: handle {} released, dropping {}", self.id, sender, kind);
                    return false;
                }
                true
            }
            None => {
                debug!("Session {}: no handle {} for {} event", self.id, sender, envelope.kind());
                false
            }
        }
    }
}

/// A gateway session
pub struct Session {
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
}

impl Session {
    /// Create a session on the gateway
    pub async fn create(transport: Arc<dyn SignalingTransport>) -> Result<Self, JanusError> {
        let transaction = TransactionManager::next_id();
        match transport.create_session(&transaction).await? {
            Envelope::Success { data: Some(data), .. } => {
                info!("Created session {}", data.id);
                Ok(Self {
                    ctx: SessionContext::new(data.id, transport),
                    shutdown: CancellationToken::new(),
                })
            }
            Envelope::Error { error, .. } => Err(JanusError::Server {
                code: error.code,
                reason: error.reason,
            }),
            other => Err(JanusError::ProtocolViolation(format!(
                "Unexpected create response: {}",
                other.kind()
            ))),
        }
    }

    pub fn id(&self) -> SessionId {
        self.ctx.id()
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub async fn server_info(&self) -> Result<ServerInfo, JanusError> {
        Ok(self.ctx.transport().server_info().await?)
    }

    /// Start the long-poll loop. It ends on [`destroy`](Self::destroy) or
    /// with the first transport failure.
    pub fn spawn_long_poll(&self, settings: PollSettings) -> JoinHandle<Result<(), TransportError>> {
        tokio::spawn(long_poll(self.ctx.clone(), settings, self.shutdown.clone()))
    }

    /// Stop the long poll and destroy the session on the gateway
    pub async fn destroy(&self) -> Result<(), JanusError> {
        self.shutdown.cancel();
        let transaction = TransactionManager::next_id();
        self.ctx.transport().destroy(self.ctx.id(), &transaction).await?;
        info!("Destroyed session {}", self.ctx.id());
        Ok(())
    }
}

async fn long_poll(
    ctx: Arc<SessionContext>,
    settings: PollSettings,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    info!("Long poll started for session {}", ctx.id());
    loop {
        let batch = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Long poll stopped for session {}", ctx.id());
                return Ok(());
            }
            batch = ctx.transport().poll(ctx.id(), settings.max_events) => batch,
        };

        match batch {
            Ok(events) => {
                for event in events {
                    ctx.deliver(event);
                }
            }
            Err(e) => {
                error!("Long poll for session {} failed: {}", ctx.id(), e);
                return Err(e);
            }
        }

        let expired = ctx.transactions().evict_expired(settings.transaction_ttl);
        if !expired.is_empty() {
            debug!("Session {}: evicted {} stale transaction(s)", ctx.id(), expired.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, MockTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> (Arc<MockTransport>, Arc<SessionContext>) {
        let transport = MockTransport::new();
        let ctx = SessionContext::new(1, transport.clone() as Arc<dyn SignalingTransport>);
        (transport, ctx)
    }

    #[test]
    fn test_transaction_takes_precedence_over_sender() {
        let (_, ctx) = context();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.add_route(42, tx);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        ctx.transactions()
            .register("abc", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(ctx.deliver(json!({"janus": "event", "transaction": "abc", "sender": 42})));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());

        // Same transaction again is a push for the sender
        assert!(ctx.deliver(json!({"janus": "event", "transaction": "abc", "sender": 42})));
        assert!(matches!(rx.try_recv(), Ok(Command::Received { transaction: None, .. })));
    }

    #[test]
    fn test_unroutable_events() {
        let (_, ctx) = context();
        assert!(!ctx.deliver(json!({"janus": "webrtcup", "sender": 9})));
        assert!(!ctx.deliver(json!({"janus": "event"})));
        assert!(!ctx.deliver(json!({"no_discriminator": true})));
        assert!(ctx.deliver(json!({"janus": "keepalive"})));
    }

    #[test]
    fn test_removed_route_stops_delivery() {
        let (_, ctx) = context();
        let (tx, _rx) = mpsc::unbounded_channel();
        ctx.add_route(42, tx);
        assert_eq!(ctx.route_count(), 1);
        ctx.remove_route(42);
        assert_eq!(ctx.route_count(), 0);
        assert!(!ctx.deliver(json!({"janus": "hangup", "sender": 42})));
    }

    #[tokio::test]
    async fn test_create_session() {
        let transport = MockTransport::new();
        let session = Session::create(transport.clone() as Arc<dyn SignalingTransport>)
            .await
            .unwrap();
        assert_eq!(session.id(), MockTransport::SESSION_ID);
    }

    #[tokio::test]
    async fn test_long_poll_dispatches_and_evicts() {
        let transport = MockTransport::new();
        let session = Session::create(transport.clone() as Arc<dyn SignalingTransport>)
            .await
            .unwrap();
        let ctx = session.context().clone();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        ctx.transactions()
            .register("joined", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        ctx.transactions().register("stale", |_| {}).unwrap();

        let poll = session.spawn_long_poll(PollSettings {
            max_events: 5,
            transaction_ttl: Duration::ZERO,
        });
        transport.push_poll(Ok(vec![json!({"janus": "event", "transaction": "joined"})]));

        eventually(|| (hits.load(Ordering::SeqCst) == 1).then_some(())).await;
        eventually(|| ctx.transactions().is_empty().then_some(())).await;

        session.destroy().await.unwrap();
        assert_eq!(poll.await.unwrap(), Ok(()));
        assert!(transport.calls().contains(&crate::testing::TransportCall::Destroy));
    }

    #[tokio::test]
    async fn test_long_poll_stops_on_transport_failure() {
        let transport = MockTransport::new();
        let session = Session::create(transport.clone() as Arc<dyn SignalingTransport>)
            .await
            .unwrap();
        let poll = session.spawn_long_poll(PollSettings::default());
        transport.push_poll(Err(TransportError::Status(502)));
        let result = tokio::time::timeout(Duration::from_secs(2), poll).await.unwrap().unwrap();
        assert_eq!(result, Err(TransportError::Status(502)));
    }
}
