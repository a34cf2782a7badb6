//! Transaction correlation
//!
//! Every request carries a client generated transaction id. Responses that
//! arrive later over the long poll are matched back to the requester through
//! the callback registered under that id.

use super::protocol::Envelope;
use super::JanusError;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Callback invoked with the first envelope matching its transaction
pub type TransactionCallback = Box<dyn FnOnce(Envelope) + Send>;

/// Invoked instead of the callback when the registration expires
pub type ExpiryCallback = Box<dyn FnOnce() + Send>;

struct Pending {
    callback: TransactionCallback,
    on_expire: Option<ExpiryCallback>,
    registered_at: Instant,
}

/// Registry of outstanding transactions, owned by the session context
#[derive(Default)]
pub struct TransactionManager {
    pending: Mutex<HashMap<String, Pending>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh transaction id (UUID v4, 122 random bits)
    pub fn next_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Register a callback for `id`. Fails if `id` is still pending.
    pub fn register<F>(&self, id: &str, callback: F) -> Result<(), JanusError>
    where
        F: FnOnce(Envelope) + Send + 'static,
    {
        self.insert(id, Box::new(callback), None)
    }

    /// Like [`register`](Self::register), with `on_expire` run if the
    /// registration is evicted before a response arrives.
    pub fn register_with_expiry<F, E>(&self, id: &str, callback: F, on_expire: E) -> Result<(), JanusError>
    where
        F: FnOnce(Envelope) + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        self.insert(id, Box::new(callback), Some(Box::new(on_expire)))
    }

    fn insert(
        &self,
        id: &str,
        callback: TransactionCallback,
        on_expire: Option<ExpiryCallback>,
    ) -> Result<(), JanusError> {
        let mut pending = self.pending.lock();
        if pending.contains_key(id) {
            return Err(JanusError::DuplicateTransaction(id.to_string()));
        }
        pending.insert(
            id.to_string(),
            Pending {
                callback,
                on_expire,
                registered_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Remove and invoke the callback for `id`.
    ///
    /// Returns `false` when nothing was registered, in which case the payload
    /// is a server-initiated push rather than a response.
    pub fn dispatch(&self, id: &str, payload: Envelope) -> bool {
        // Invoke outside the lock so a callback may register again.
        let entry = self.pending.lock().remove(id);
        match entry {
            Some(pending) => {
                debug!("Dispatching {} for transaction {}", payload.kind(), id);
                (pending.callback)(payload);
                true
            }
            None => false,
        }
    }

    /// Cancel a registration without invoking it
    pub fn remove(&self, id: &str) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Drop registrations older than `ttl` and run their expiry hooks.
    ///
    /// Response callbacks of evicted entries are never invoked.
    pub fn evict_expired(&self, ttl: Duration) -> Vec<String> {
        let evicted: Vec<(String, Pending)> = {
            let mut pending = self.pending.lock();
            let expired: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.registered_at.elapsed() >= ttl)
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let mut ids = Vec::with_capacity(evicted.len());
        for (id, entry) in evicted {
            warn!("Transaction {} expired without a response", id);
            if let Some(on_expire) = entry.on_expire {
                on_expire();
            }
            ids.push(id);
        }
        ids
    }
}
