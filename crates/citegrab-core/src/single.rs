//! Single-item extraction: one visible result on the current page.

use std::sync::Arc;
use std::time::Duration;

use crate::citation::summarize;
use crate::clipboard::ClipboardWriter;
use crate::dom::{LiveDocument, NodeId};
use crate::layout::PageLayout;
use crate::observer::LinkObserver;
use crate::proxy::FetchProxyClient;
use crate::trigger::{activate_without_navigation, dismiss_popover};
use crate::{Config, ExtractionOutcome, FailureReason, FlowEvent, FlowSource, FlowState, Notifier};

/// Composes Trigger, Observer, Proxy Client and Clipboard Writer for one item.
///
/// One instance serves every item on a page; each [`run`](Self::run) call is
/// an independent flow with its own state.
pub struct SingleItemFlow {
    layout: PageLayout,
    observe_timeout: Duration,
    proxy: FetchProxyClient,
    clipboard: Arc<ClipboardWriter>,
    notifier: Notifier,
}

impl SingleItemFlow {
    pub fn new(
        config: &Config,
        proxy: FetchProxyClient,
        clipboard: Arc<ClipboardWriter>,
        notifier: Notifier,
    ) -> Self {
        Self {
            layout: config.layout.clone(),
            observe_timeout: config.observe_timeout,
            proxy,
            clipboard,
            notifier,
        }
    }

    pub fn layout(&self) -> &PageLayout {
        &self.layout
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Extract the citation behind `trigger` and write it to the clipboard.
    ///
    /// Emits exactly one `Succeeded` or `Failed` event. The suppression style
    /// and the pop-over are cleaned up on every path.
    pub async fn run(&self, doc: &LiveDocument, trigger: NodeId) -> ExtractionOutcome {
        let source = FlowSource::Item(trigger);
        self.transition(&source, FlowState::Triggering);

        if !doc.is_connected(trigger) {
            return self.fail(source, FailureReason::NoTriggerFound);
        }

        let suppression = doc.install_style(
            &self.layout.suppression_style_id,
            &self.layout.suppression_css(),
        );
        let observer = LinkObserver::start(doc, &self.layout, self.observe_timeout);
        activate_without_navigation(doc, trigger);

        self.transition(&source, FlowState::Watching);
        let located = observer.wait().await;

        suppression.remove();
        dismiss_popover(doc, &self.layout);

        let url = match located {
            Ok(url) => url,
            Err(reason) => return self.fail(source, reason),
        };

        self.transition(&source, FlowState::Fetching);
        let body = match self.proxy.fetch_citation(url.as_str()).await {
            ExtractionOutcome::Success { body } => body,
            ExtractionOutcome::Failure { reason } => return self.fail(source, reason),
        };

        self.transition(&source, FlowState::Delivering);
        let delivered_via = self.clipboard.write(&body).await;

        self.transition(&source, FlowState::Done);
        let summary = summarize(&body);
        tracing::info!(%source, citation = %summary.label(), via = ?delivered_via, "citation copied");
        (self.notifier)(FlowEvent::Succeeded {
            source,
            summary,
            delivered_via,
        });
        ExtractionOutcome::success(body)
    }

    fn transition(&self, source: &FlowSource, state: FlowState) {
        tracing::debug!(%source, ?state, "single-item flow");
        (self.notifier)(FlowEvent::StateChanged {
            source: source.clone(),
            state,
        });
    }

    fn fail(&self, source: FlowSource, reason: FailureReason) -> ExtractionOutcome {
        self.transition(&source, FlowState::Errored(reason.clone()));
        tracing::info!(%source, %reason, "citation extraction failed");
        (self.notifier)(FlowEvent::Failed {
            source,
            reason: reason.clone(),
        });
        ExtractionOutcome::failure(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::{ClipboardBackend, MemoryClipboard};
    use crate::mock::{EventLog, MockProxy, MockResponse, PopoverScript, install_popover, results_page};

    fn flow(proxy: Arc<MockProxy>, memory: &MemoryClipboard, events: &EventLog) -> SingleItemFlow {
        SingleItemFlow::new(
            &Config::default(),
            FetchProxyClient::new(proxy),
            Arc::new(ClipboardWriter::new(vec![Arc::new(memory.clone())])),
            events.notifier(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn walks_every_state_on_success() {
        let (doc, items) = results_page(1);
        install_popover(&doc, items[0].trigger, PopoverScript::bibtex("/scholar.bib?q=1"));
        let proxy = Arc::new(MockProxy::new(MockResponse::Bib("@article{k1, title={T}}".into())));
        let memory = MemoryClipboard::new();
        let events = EventLog::default();

        let outcome = flow(proxy, &memory, &events).run(&doc, items[0].trigger).await;

        assert!(outcome.is_success());
        assert_eq!(
            events.states(),
            vec![
                FlowState::Triggering,
                FlowState::Watching,
                FlowState::Fetching,
                FlowState::Delivering,
                FlowState::Done,
            ]
        );
        assert_eq!(memory.contents(), "@article{k1, title={T}}");
    }

    #[tokio::test(start_paused = true)]
    async fn proxy_failure_skips_delivery() {
        let (doc, items) = results_page(1);
        install_popover(&doc, items[0].trigger, PopoverScript::bibtex("/scholar.bib?q=1"));
        let proxy = Arc::new(MockProxy::new(MockResponse::Error("403 Forbidden".into())));
        let memory = MemoryClipboard::new();
        memory.write_text("untouched").unwrap();
        let events = EventLog::default();

        let outcome = flow(proxy, &memory, &events).run(&doc, items[0].trigger).await;

        assert!(matches!(outcome.reason(), Some(FailureReason::NotFound(_))));
        assert_eq!(memory.contents(), "untouched");
        assert_eq!(events.failures().len(), 1);
        assert!(!events.states().contains(&FlowState::Delivering));
        assert!(doc.find_by_id("hidePopup").is_none());
        assert!(doc.find_by_id("gs_cit").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn detached_trigger() {
        let (doc, items) = results_page(1);
        doc.remove(items[0].item);
        let proxy = Arc::new(MockProxy::new(MockResponse::Bib("x".into())));
        let memory = MemoryClipboard::new();
        let events = EventLog::default();

        let outcome = flow(proxy.clone(), &memory, &events).run(&doc, items[0].trigger).await;

        assert_eq!(outcome.reason(), Some(&FailureReason::NoTriggerFound));
        assert_eq!(proxy.call_count(), 0);
    }
}
