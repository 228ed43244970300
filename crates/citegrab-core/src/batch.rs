//! Batch orchestration: staggered cross-window flows over a list of queries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cross_window::CrossWindowFlow;
use crate::ExtractionOutcome;

/// An ordered list of queries and the delay between consecutive starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    queries: Vec<String>,
    stagger: Duration,
}

impl BatchJob {
    pub fn new(queries: Vec<String>, stagger: Duration) -> Self {
        Self { queries, stagger }
    }

    /// One query per line; lines are trimmed and blank lines dropped.
    pub fn from_lines(text: &str, stagger: Duration) -> Self {
        let queries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        Self::new(queries, stagger)
    }

    pub fn queries(&self) -> &[String] {
        &self.queries
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Start offset of each query from the batch start: `i * stagger`.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.queries.len())
            .map(|i| self.stagger * i as u32)
            .collect()
    }
}

/// Outcome of one batch item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItemResult {
    pub index: usize,
    pub query: String,
    pub outcome: ExtractionOutcome,
}

/// Run every query of `job` through `flow`, the `i`-th starting at
/// `i * stagger` after the destination is cleared.
///
/// Items are independent: a failing item does not delay or cancel the rest.
/// Cancelling `cancel` abandons items that have not finished; only finished
/// items appear in the result, ordered by index.
pub async fn run_batch(
    job: BatchJob,
    flow: Arc<CrossWindowFlow>,
    cancel: CancellationToken,
) -> Vec<BatchItemResult> {
    if job.is_empty() {
        return Vec::new();
    }
    flow.clear_destination().await;

    let schedule = job.schedule();
    let start = Instant::now();
    let mut tasks = JoinSet::new();
    for ((index, query), offset) in job.queries.into_iter().enumerate().zip(schedule) {
        let flow = Arc::clone(&flow);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let run = async {
                tokio::time::sleep_until(start + offset).await;
                tracing::debug!(index, %query, ?offset, "starting batch item");
                flow.run(&query).await
            };
            let finished = tokio::select! {
                () = cancel.cancelled() => None,
                outcome = run => Some(outcome),
            };
            match finished {
                Some(outcome) => Some(BatchItemResult { index, query, outcome }),
                None => {
                    tracing::debug!(index, %query, "batch item cancelled");
                    None
                }
            }
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(result)) => results.push(result),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "batch item task failed"),
        }
    }
    results.sort_by_key(|r| r.index);
    results
}
