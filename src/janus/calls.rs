//! Outstanding-call tracking
//!
//! Transport calls issued by a handle are registered here so that `detach()`
//! can cancel all of them from the caller's context, outside the handle queue.

use crate::transport::TransportError;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Cancellable set of in-flight transport calls of one handle
#[derive(Default)]
pub struct InFlightCalls {
    calls: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl InFlightCalls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a call. After [`close`](Self::close) the guard starts cancelled.
    pub fn begin(self: &Arc<Self>) -> CallGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut calls = self.calls.lock();
        if self.closed.load(Ordering::Acquire) {
            token.cancel();
        } else {
            calls.insert(id, token.clone());
        }
        CallGuard {
            id,
            token,
            owner: self.clone(),
        }
    }

    /// Cancel every outstanding call; later calls still run
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<CancellationToken> = self.calls.lock().drain().map(|(_, token)| token).collect();
        for token in &drained {
            token.cancel();
        }
        if !drained.is_empty() {
            debug!("Cancelled {} outstanding call(s)", drained.len());
        }
        drained.len()
    }

    /// Cancel every outstanding call and refuse new ones
    pub fn close(&self) -> usize {
        {
            let _calls = self.calls.lock();
            self.closed.store(true, Ordering::Release);
        }
        self.cancel_all()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    fn finish(&self, id: u64) {
        self.calls.lock().remove(&id);
    }
}

/// One registered call; dropping it unregisters the call
pub struct CallGuard {
    id: u64,
    token: CancellationToken,
    owner: Arc<InFlightCalls>,
}

impl CallGuard {
    /// Run `call` until it completes or the call is cancelled
    pub async fn run<T, F>(self, call: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(TransportError::Cancelled),
            result = call => result,
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.owner.finish(self.id);
    }
}
