//! Generic "watch for predicate" primitive over a change-notification source.
//!
//! A [`PendingWatch`] subscribes when it is created, so changes that happen
//! between creation and the first poll are not lost. The check is never run
//! against the initial state: only change batches that arrive after the
//! subscription cause a re-check.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;

use crate::dom::{LiveDocument, MutationBatch};

/// Something that broadcasts change batches.
pub trait ChangeSource {
    type Batch: Clone + Send + 'static;

    fn subscribe_changes(&self) -> broadcast::Receiver<Self::Batch>;
}

impl ChangeSource for LiveDocument {
    type Batch = MutationBatch;

    fn subscribe_changes(&self) -> broadcast::Receiver<MutationBatch> {
        self.subscribe()
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("nothing matched within {0:?}")]
pub struct WatchTimeout(pub Duration);

/// Live state of one watch: the subscription and its deadline.
pub struct PendingWatch<B: Clone> {
    changes: broadcast::Receiver<B>,
    started: Instant,
    timeout: Duration,
}

impl<B: Clone + Send + 'static> PendingWatch<B> {
    pub fn new<S>(source: &S, timeout: Duration) -> Self
    where
        S: ChangeSource<Batch = B> + ?Sized,
    {
        Self {
            changes: source.subscribe_changes(),
            started: Instant::now(),
            timeout,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }

    /// Re-run `check` after every change batch until it yields a value.
    ///
    /// Rejects once `timeout` has elapsed since creation: either when a batch
    /// arrives past the deadline or when the deadline passes with no batches.
    /// The subscription is dropped on both exits.
    pub async fn until<T>(mut self, mut check: impl FnMut() -> Option<T>) -> Result<T, WatchTimeout> {
        let deadline = self.deadline();
        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        loop {
            tokio::select! {
                biased;

                changed = self.changes.recv() => {
                    match changed {
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => {
                            // The source is gone; nothing can match any more.
                            (&mut expired).await;
                            return Err(WatchTimeout(self.timeout));
                        }
                    }
                    if let Some(found) = check() {
                        return Ok(found);
                    }
                    if self.started.elapsed() > self.timeout {
                        return Err(WatchTimeout(self.timeout));
                    }
                }
                () = &mut expired => {
                    return Err(WatchTimeout(self.timeout));
                }
            }
        }
    }
}
