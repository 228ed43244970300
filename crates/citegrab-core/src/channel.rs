//! Correlated one-shot messaging between an opener and its secondary contexts.
//!
//! Each cross-window flow subscribes under a fresh correlation id and hands a
//! [`MessagePort`] to the code running in the secondary context. A message is
//! delivered only to the subscription with the matching id, at most once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::FailureReason;

/// Structured message posted from a secondary context to its opener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContextMessage {
    #[serde(rename = "BIB_URL_FOUND")]
    BibUrlFound {
        correlation: Uuid,
        /// Absent when the secondary context found no citation link.
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureReason>,
    },
}

impl ContextMessage {
    pub fn found(correlation: Uuid, url: impl Into<String>) -> Self {
        ContextMessage::BibUrlFound {
            correlation,
            url: Some(url.into()),
            failure: None,
        }
    }

    pub fn not_found(correlation: Uuid, reason: FailureReason) -> Self {
        ContextMessage::BibUrlFound {
            correlation,
            url: None,
            failure: Some(reason),
        }
    }

    pub fn correlation(&self) -> Uuid {
        match self {
            ContextMessage::BibUrlFound { correlation, .. } => *correlation,
        }
    }
}

type Pending = Mutex<HashMap<Uuid, oneshot::Sender<ContextMessage>>>;

/// Opener-side registry of one-shot listeners.
#[derive(Clone, Default)]
pub struct MessageBus {
    pending: Arc<Pending>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for the single message carrying `correlation`.
    pub fn subscribe(&self, correlation: Uuid) -> Subscription {
        let (tx, rx) = oneshot::channel();
        if lock(&self.pending).insert(correlation, tx).is_some() {
            tracing::warn!(%correlation, "replaced an existing listener");
        }
        Subscription {
            correlation,
            rx: Some(rx),
            pending: Arc::downgrade(&self.pending),
            disposed: false,
        }
    }

    /// A handle the secondary context uses to reach this bus.
    pub fn port(&self) -> MessagePort {
        MessagePort {
            pending: Arc::downgrade(&self.pending),
        }
    }

    pub fn post(&self, message: ContextMessage) -> bool {
        deliver(&self.pending, message)
    }

    /// Number of listeners still registered.
    pub fn listener_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

/// The secondary context's view of its opener. Does not keep the bus alive.
#[derive(Clone)]
pub struct MessagePort {
    pending: Weak<Pending>,
}

impl MessagePort {
    /// Post a message to the opener. Returns whether a listener received it.
    pub fn post(&self, message: ContextMessage) -> bool {
        match self.pending.upgrade() {
            Some(pending) => deliver(&pending, message),
            None => {
                tracing::debug!(correlation = %message.correlation(), "opener is gone, dropping message");
                false
            }
        }
    }
}

/// A registered one-shot listener.
///
/// [`dispose`](Subscription::dispose) removes the listener; it is idempotent
/// and also runs on drop.
pub struct Subscription {
    correlation: Uuid,
    rx: Option<oneshot::Receiver<ContextMessage>>,
    pending: Weak<Pending>,
    disposed: bool,
}

impl Subscription {
    pub fn correlation(&self) -> Uuid {
        self.correlation
    }

    /// Wait for the message. Returns `None` once the listener is disposed or
    /// the message has already been taken. Cancel-safe.
    pub async fn recv(&mut self) -> Option<ContextMessage> {
        let rx = self.rx.as_mut()?;
        let message = rx.await.ok();
        self.rx = None;
        message
    }

    /// Remove the listener. Returns `true` only on the call that removed it.
    pub fn dispose(&mut self) -> bool {
        if self.disposed {
            return false;
        }
        self.disposed = true;
        self.rx = None;
        match self.pending.upgrade() {
            Some(pending) => lock(&pending).remove(&self.correlation).is_some(),
            None => false,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<ContextMessage>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn deliver(pending: &Pending, message: ContextMessage) -> bool {
    let correlation = message.correlation();
    let Some(tx) = lock(pending).remove(&correlation) else {
        tracing::debug!(%correlation, "no listener for message, dropping");
        return false;
    };
    tx.send(message).is_ok()
}
