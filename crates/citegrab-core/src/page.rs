//! A result page with single-item flows attached to its items.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::dom::{LiveDocument, NodeId};
use crate::registry::{ItemRegistry, WiredItem};
use crate::single::SingleItemFlow;
use crate::{ExtractionOutcome, FlowEvent};

pub struct ResultPage {
    doc: LiveDocument,
    registry: ItemRegistry,
    flow: Arc<SingleItemFlow>,
}

impl ResultPage {
    pub fn new(doc: LiveDocument, flow: Arc<SingleItemFlow>) -> Self {
        Self {
            doc,
            registry: ItemRegistry::new(),
            flow,
        }
    }

    pub fn document(&self) -> &LiveDocument {
        &self.doc
    }

    /// Attach flows to result items not yet wired.
    pub fn wire_items(&self) -> Vec<WiredItem> {
        let wired = self.registry.wire(&self.doc, self.flow.layout());
        for w in &wired {
            tracing::debug!(item = %w.item, trigger = %w.trigger, "wired result item");
            (self.flow.notifier())(FlowEvent::ItemWired {
                item: w.item,
                trigger: w.trigger,
            });
        }
        wired
    }

    /// Wired items in document order.
    pub fn items(&self) -> Vec<NodeId> {
        self.doc
            .query_all(&self.flow.layout().result_item)
            .into_iter()
            .filter(|item| self.registry.contains(*item))
            .collect()
    }

    /// Keep wiring items rendered after the initial load until cancelled
    /// or the document goes away.
    pub async fn watch_new_items(&self, cancel: CancellationToken) {
        let mut changes = self.doc.subscribe();
        self.wire_items();
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = changes.recv() => match changed {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        self.wire_items();
                    }
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }

    /// Run the item's flow. `None` if the item is not wired or its flow is
    /// already running.
    pub async fn extract(&self, item: NodeId) -> Option<ExtractionOutcome> {
        let trigger = self.registry.trigger_of(item)?;
        let Some(_lease) = self.registry.try_begin(item) else {
            tracing::debug!(%item, "flow already running for item");
            return None;
        };
        Some(self.flow.run(&self.doc, trigger).await)
    }
}
