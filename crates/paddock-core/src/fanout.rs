//! Response fan-out.
//!
//! A VM streams its responses on one channel. A forwarder task copies each
//! response to every live [`Subscription`] and closes them all when the
//! stream ends.

use crate::context::ResponseReceiver;
use crate::types::VmResponse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

type Subscribers = HashMap<u64, mpsc::UnboundedSender<VmResponse>>;

/// Registry of response subscribers for one VM.
#[derive(Debug, Default)]
pub(crate) struct ResponseHub {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ResponseHub {
    /// Start forwarding `responses` to subscribers.
    pub(crate) fn spawn(vm_id: String, mut responses: ResponseReceiver) -> Arc<Self> {
        let hub = Arc::new(Self::default());
        let forwarder = Arc::clone(&hub);
        tokio::spawn(async move {
            while let Some(response) = responses.recv().await {
                tracing::debug!(vm_id = %vm_id, code = %response.code, "vm response");
                forwarder.broadcast(response);
            }
            forwarder.close();
            tracing::debug!(vm_id = %vm_id, "response stream closed");
        });
        hub
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, response: VmResponse) {
        // subscribers that went away are dropped here
        self.subscribers()
            .retain(|_, tx| tx.send(response.clone()).is_ok());
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers().clear();
    }

    /// Register a subscriber. After the stream has ended, the subscription
    /// yields nothing.
    pub(crate) fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut subscribers = self.subscribers();
            // checked under the lock so close() cannot slip in between
            if !self.closed.load(Ordering::SeqCst) {
                subscribers.insert(id, tx);
            }
        }
        Subscription {
            id,
            rx,
            hub: Arc::clone(self),
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

/// A stream of responses from one VM.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<VmResponse>,
    hub: Arc<ResponseHub>,
}

impl Subscription {
    /// Next response, or `None` once the VM is closed.
    pub async fn recv(&mut self) -> Option<VmResponse> {
        self.rx.recv().await
    }

    /// Next response if one is already waiting.
    pub fn try_recv(&mut self) -> Option<VmResponse> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.subscribers().remove(&self.id);
    }
}
