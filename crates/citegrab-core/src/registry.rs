//! Per-item registry: which result items already have a flow attached.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::dom::{LiveDocument, NodeId};
use crate::layout::PageLayout;

/// A result item and the citation trigger its flow drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WiredItem {
    pub item: NodeId,
    pub trigger: NodeId,
}

struct ItemState {
    trigger: NodeId,
    busy: Arc<AtomicBool>,
}

/// Marks a flow as running for one item. Released on drop.
pub struct ItemLease {
    busy: Arc<AtomicBool>,
}

impl Drop for ItemLease {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[derive(Default)]
pub struct ItemRegistry {
    items: DashMap<NodeId, ItemState>,
}

impl ItemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach every unwired result item that has a citation trigger.
    /// Returns only the items wired by this call.
    pub fn wire(&self, doc: &LiveDocument, layout: &PageLayout) -> Vec<WiredItem> {
        let mut wired = Vec::new();
        for item in doc.query_all(&layout.result_item) {
            // Items whose trigger has not rendered yet are picked up later.
            let Some(trigger) = doc.query_first_within(item, &layout.trigger) else {
                continue;
            };
            if let Entry::Vacant(slot) = self.items.entry(item) {
                slot.insert(ItemState {
                    trigger,
                    busy: Arc::new(AtomicBool::new(false)),
                });
                wired.push(WiredItem { item, trigger });
            }
        }
        wired
    }

    pub fn trigger_of(&self, item: NodeId) -> Option<NodeId> {
        self.items.get(&item).map(|state| state.trigger)
    }

    /// Claim the item for one flow run. `None` if unknown or already running.
    pub fn try_begin(&self, item: NodeId) -> Option<ItemLease> {
        let busy = Arc::clone(&self.items.get(&item)?.busy);
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ItemLease { busy })
    }

    pub fn contains(&self, item: NodeId) -> bool {
        self.items.contains_key(&item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
