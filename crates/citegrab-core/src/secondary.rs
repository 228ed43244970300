//! The script injected into a secondary context.
//!
//! It drives the context's own document the same way the single-item flow
//! drives the main page, then reports back exactly once.

use std::time::Duration;

use url::Url;
use uuid::Uuid;

use crate::FailureReason;
use crate::channel::{ContextMessage, MessagePort};
use crate::dom::LiveDocument;
use crate::layout::PageLayout;
use crate::observer::LinkObserver;
use crate::trigger::{activate_without_navigation, dismiss_popover};

/// Trigger the first result's pop-over and wait for its citation link.
pub async fn locate_citation_url(
    doc: &LiveDocument,
    layout: &PageLayout,
    timeout: Duration,
) -> Result<Url, FailureReason> {
    let trigger = doc
        .query_first(&layout.trigger)
        .ok_or(FailureReason::NoTriggerFound)?;

    let observer = LinkObserver::start(doc, layout, timeout);
    activate_without_navigation(doc, trigger);
    let located = observer.wait().await;
    dismiss_popover(doc, layout);
    located
}

/// Entry point of the injected script. Posts one message to `port`.
pub async fn run_injected_script(
    doc: LiveDocument,
    layout: PageLayout,
    timeout: Duration,
    port: MessagePort,
    correlation: Uuid,
) {
    let message = match locate_citation_url(&doc, &layout, timeout).await {
        Ok(url) => ContextMessage::found(correlation, url.as_str()),
        Err(reason) => {
            tracing::debug!(%correlation, %reason, "secondary context found no citation link");
            ContextMessage::not_found(correlation, reason)
        }
    };
    if !port.post(message) {
        tracing::debug!(%correlation, "opener stopped listening before the report");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageBus;
    use crate::mock::{PopoverScript, install_popover, results_page};

    #[tokio::test(start_paused = true)]
    async fn reports_found_url() {
        let (doc, items) = results_page(1);
        install_popover(&doc, items[0].trigger, PopoverScript::bibtex("/scholar.bib?q=info:a"));
        let bus = MessageBus::new();
        let id = Uuid::new_v4();
        let mut sub = bus.subscribe(id);

        run_injected_script(doc, PageLayout::scholar(), Duration::from_secs(3), bus.port(), id).await;

        let message = sub.recv().await.unwrap();
        assert_eq!(
            message,
            ContextMessage::found(id, "https://scholar.google.com/scholar.bib?q=info:a")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reports_missing_trigger() {
        let (doc, _) = results_page(0);
        let bus = MessageBus::new();
        let id = Uuid::new_v4();
        let mut sub = bus.subscribe(id);

        run_injected_script(doc, PageLayout::scholar(), Duration::from_secs(3), bus.port(), id).await;

        assert_eq!(
            sub.recv().await,
            Some(ContextMessage::not_found(id, FailureReason::NoTriggerFound))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reports_timeout() {
        let (doc, items) = results_page(1);
        install_popover(&doc, items[0].trigger, PopoverScript::never());
        let result = locate_citation_url(&doc, &PageLayout::scholar(), Duration::from_secs(3)).await;
        assert_eq!(result, Err(FailureReason::TimedOut));
    }
}
