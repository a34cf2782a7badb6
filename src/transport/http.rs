//! HTTP request / long-poll transport
//!
//! Requests are POSTed as JSON to `{base}/janus[/{session}[/{handle}]]`.
//! Server pushes are fetched with a held `GET /janus/{session}` that the
//! gateway answers with one envelope, an array of envelopes, or a keepalive.

use super::{SignalingTransport, TransportError};
use crate::janus::protocol::{
    Envelope, HandleId, IceCandidate, Request, RoomRequest, ServerInfo, SessionDescription, SessionId,
    TrickleCandidate,
};
use async_trait::async_trait;
use log::{debug, trace, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const CONNECT_TIMEOUT_SECS: u64 = 5;

/// [`SignalingTransport`] over the Janus REST interface
#[derive(Clone)]
pub struct HttpTransport {
    /// Client for ordinary requests
    client: Client,
    /// Client for the held long-poll request, with a longer timeout
    poll_client: Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for the gateway at `base_url` (e.g. `http://host:8088`).
    pub fn new(base_url: &str, request_timeout: Duration, poll_timeout: Duration) -> Result<Self, TransportError> {
        let client = Self::build_client(request_timeout)?;
        let poll_client = Self::build_client(poll_timeout)?;
        Ok(Self {
            client,
            poll_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn build_client(timeout: Duration) -> Result<Client, TransportError> {
        Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| TransportError::Http(format!("Failed to build HTTP client: {}", e)))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_url(&self, session: SessionId) -> String {
        format!("{}/janus/{}", self.base_url, session)
    }

    fn handle_url(&self, session: SessionId, handle: HandleId) -> String {
        format!("{}/janus/{}/{}", self.base_url, session, handle)
    }

    async fn post<T: DeserializeOwned>(&self, url: &str, request: &Request) -> Result<T, TransportError> {
        trace!("POST {} {:?}", url, request);
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TransportError> {
        let status = response.status();
        if !status.is_success() {
            warn!("Gateway returned status {}", status);
            return Err(TransportError::Status(status.as_u16()));
        }
        let body = response.text().await.map_err(|e| TransportError::Http(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// POST a request whose only useful reply is an acknowledgement
    async fn post_ack(&self, url: &str, request: &Request) -> Result<(), TransportError> {
        match self.post::<Envelope>(url, request).await? {
            Envelope::Error { error, .. } => {
                warn!("Gateway rejected request: {} {}", error.code, error.reason);
                Err(TransportError::Server {
                    code: error.code,
                    reason: error.reason,
                })
            }
            _ => Ok(()),
        }
    }

    async fn message<T: DeserializeOwned>(
        &self,
        session: SessionId,
        handle: HandleId,
        transaction: &str,
        body: &RoomRequest,
        jsep: Option<&SessionDescription>,
    ) -> Result<T, TransportError> {
        let request = Request::Message {
            transaction: transaction.to_string(),
            body: body.clone(),
            jsep: jsep.cloned(),
        };
        self.post(&self.handle_url(session, handle), &request).await
    }

    async fn trickle_request(
        &self,
        session: SessionId,
        handle: HandleId,
        transaction: &str,
        candidate: TrickleCandidate,
    ) -> Result<Envelope, TransportError> {
        let request = Request::Trickle {
            transaction: transaction.to_string(),
            candidate,
        };
        self.post(&self.handle_url(session, handle), &request).await
    }
}

#[async_trait]
impl SignalingTransport for HttpTransport {
    async fn create_session(&self, transaction: &str) -> Result<Envelope, TransportError> {
        let request = Request::Create {
            transaction: transaction.to_string(),
        };
        self.post(&format!("{}/janus", self.base_url), &request).await
    }

    async fn server_info(&self) -> Result<ServerInfo, TransportError> {
        let response = self
            .client
            .get(format!("{}/janus/info", self.base_url))
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Self::decode(response).await
    }

    async fn attach(&self, session: SessionId, transaction: &str, plugin: &str) -> Result<Envelope, TransportError> {
        let request = Request::Attach {
            plugin: plugin.to_string(),
            transaction: transaction.to_string(),
        };
        self.post(&self.session_url(session), &request).await
    }

    async fn join(
        &self,
        session: SessionId,
        handle: HandleId,
        transaction: &str,
        body: &RoomRequest,
    ) -> Result<Envelope, TransportError> {
        self.message(session, handle, transaction, body, None).await
    }

    async fn offer(
        &self,
        session: SessionId,
        handle: HandleId,
        transaction: &str,
        body: &RoomRequest,
        jsep: &SessionDescription,
    ) -> Result<Envelope, TransportError> {
        self.message(session, handle, transaction, body, Some(jsep)).await
    }

    async fn send(
        &self,
        session: SessionId,
        handle: HandleId,
        transaction: &str,
        body: &RoomRequest,
        jsep: &SessionDescription,
    ) -> Result<Value, TransportError> {
        self.message(session, handle, transaction, body, Some(jsep)).await
    }

    async fn trickle(
        &self,
        session: SessionId,
        handle: HandleId,
        transaction: &str,
        candidate: &IceCandidate,
    ) -> Result<Envelope, TransportError> {
        self.trickle_request(session, handle, transaction, TrickleCandidate::Candidate(candidate.clone()))
            .await
    }

    async fn trickle_completed(
        &self,
        session: SessionId,
        handle: HandleId,
        transaction: &str,
    ) -> Result<Envelope, TransportError> {
        self.trickle_request(session, handle, transaction, TrickleCandidate::completed())
            .await
    }

    async fn detach(&self, session: SessionId, handle: HandleId, transaction: &str) -> Result<(), TransportError> {
        let request = Request::Detach {
            transaction: transaction.to_string(),
        };
        self.post_ack(&self.handle_url(session, handle), &request).await
    }

    async fn hangup(&self, session: SessionId, handle: HandleId, transaction: &str) -> Result<(), TransportError> {
        let request = Request::Hangup {
            transaction: transaction.to_string(),
        };
        self.post_ack(&self.handle_url(session, handle), &request).await
    }

    async fn destroy(&self, session: SessionId, transaction: &str) -> Result<(), TransportError> {
        let request = Request::Destroy {
            transaction: transaction.to_string(),
        };
        self.post_ack(&self.session_url(session), &request).await
    }

    async fn poll(&self, session: SessionId, max_events: u32) -> Result<Vec<Value>, TransportError> {
        // rid defeats intermediate caches
        let rid = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let response = self
            .poll_client
            .get(self.session_url(session))
            .query(&[("maxev", max_events.to_string()), ("rid", rid.to_string())])
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        match Self::decode::<Value>(response).await? {
            Value::Array(events) => {
                debug!("Long poll delivered {} events", events.len());
                Ok(events)
            }
            event @ Value::Object(_) => Ok(vec![event]),
            other => Err(TransportError::Decode(format!("Unexpected long-poll payload: {}", other))),
        }
    }
}
