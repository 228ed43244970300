//! Opening and dismissing the citation pop-over without navigating away.

use std::sync::Arc;

use crate::dom::{DispatchOutcome, LiveDocument, NodeId, Phase};
use crate::layout::PageLayout;

/// Activate `element` so the page renders its pop-over, suppressing navigation.
///
/// The `href` is stripped for the duration of the click and a capturing
/// listener cancels the default action; both are undone before returning.
/// Safe to call repeatedly; each call re-triggers the pop-over.
pub fn activate_without_navigation(doc: &LiveDocument, element: NodeId) -> DispatchOutcome {
    let original_href = doc.remove_attr(element, "href");
    let guard = doc.add_listener(element, Phase::Capture, Arc::new(|e| e.prevent_default()));

    let outcome = doc.dispatch_click(element);

    doc.remove_listener(guard);
    if let Some(href) = original_href {
        doc.set_attr(element, "href", href);
    }
    outcome
}

/// Best-effort pop-over dismissal. Activates the close control if present,
/// otherwise detaches any pop-over roots. Returns whether anything was done.
pub fn dismiss_popover(doc: &LiveDocument, layout: &PageLayout) -> bool {
    if let Some(close) = doc.query_first(&layout.close_control) {
        activate_without_navigation(doc, close);
        return true;
    }

    let mut removed = false;
    for selector in &layout.popup_roots {
        for node in doc.query_all(selector) {
            removed |= doc.remove(node);
        }
    }
    if !removed {
        tracing::debug!("no citation pop-over to dismiss");
    }
    removed
}
