//! Cross-window extraction: run a free-text query in its own browsing context.

use std::sync::Arc;
use std::time::Duration;

use url::Url;
use uuid::Uuid;

use crate::channel::{ContextMessage, MessageBus};
use crate::citation::summarize;
use crate::clipboard::ClipboardWriter;
use crate::context::{ContextHandle, ContextOpener};
use crate::layout::PageLayout;
use crate::proxy::FetchProxyClient;
use crate::secondary::run_injected_script;
use crate::{
    Config, CoreError, ExtractionOutcome, FailureReason, FlowEvent, FlowSource, FlowState,
    Notifier,
};

pub struct CrossWindowFlow {
    opener: Arc<dyn ContextOpener>,
    bus: MessageBus,
    proxy: FetchProxyClient,
    clipboard: Arc<ClipboardWriter>,
    notifier: Notifier,
    layout: PageLayout,
    base_url: Url,
    observe_timeout: Duration,
    /// How long the opener waits, after load, for the context to report.
    report_deadline: Duration,
}

impl CrossWindowFlow {
    pub fn new(
        config: &Config,
        opener: Arc<dyn ContextOpener>,
        proxy: FetchProxyClient,
        clipboard: Arc<ClipboardWriter>,
        notifier: Notifier,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            opener,
            bus: MessageBus::new(),
            proxy,
            clipboard,
            notifier,
            layout: config.layout.clone(),
            base_url: Url::parse(&config.base_url)?,
            observe_timeout: config.observe_timeout,
            report_deadline: config.cross_window_deadline(),
        })
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Reset the delivery destination before a run of appends.
    pub async fn clear_destination(&self) {
        if self.clipboard.clear().await.is_none() {
            tracing::warn!("could not clear the clipboard");
        }
    }

    /// Extract the first result's citation for `query` and append it to the
    /// clipboard. Emits exactly one `Succeeded` or `Failed` event.
    pub async fn run(&self, query: &str) -> ExtractionOutcome {
        let source = FlowSource::Query(query.to_string());
        self.transition(&source, FlowState::Triggering);

        let query = query.trim();
        if query.is_empty() {
            return self.fail(source, FailureReason::NotFound("empty query".into()));
        }
        let search_url = match self.layout.search_url(&self.base_url, query) {
            Ok(url) => url,
            Err(e) => return self.fail(source, FailureReason::NetworkError(e.to_string())),
        };

        let correlation = Uuid::new_v4();
        let mut subscription = self.bus.subscribe(correlation);

        // Loading and reporting share one deadline.
        let deadline = tokio::time::Instant::now() + self.report_deadline;
        let context = match tokio::time::timeout_at(deadline, self.opener.open(&search_url)).await {
            Ok(Ok(context)) => ContextHandle::new(context),
            Ok(Err(e)) => return self.fail(source, FailureReason::NetworkError(e.to_string())),
            Err(_) => {
                tracing::warn!(%source, url = %search_url, "secondary context did not load in time");
                return self.fail(source, FailureReason::TimedOut);
            }
        };
        tracing::debug!(%source, %correlation, url = %search_url, "secondary context loaded");

        self.transition(&source, FlowState::Watching);
        context.inject(run_injected_script(
            context.document().clone(),
            self.layout.clone(),
            self.observe_timeout,
            self.bus.port(),
            correlation,
        ));

        let report = tokio::time::timeout_at(deadline, subscription.recv()).await;
        context.close();
        subscription.dispose();

        let url = match report {
            Ok(Some(ContextMessage::BibUrlFound { url: Some(url), .. })) => url,
            Ok(Some(ContextMessage::BibUrlFound { failure, .. })) => {
                return self.fail(source, failure.unwrap_or(FailureReason::TimedOut));
            }
            Ok(None) | Err(_) => {
                tracing::warn!(%source, %correlation, "secondary context never reported");
                return self.fail(source, FailureReason::TimedOut);
            }
        };

        self.transition(&source, FlowState::Fetching);
        let body = match self.proxy.fetch_citation(&url).await {
            ExtractionOutcome::Success { body } => body,
            ExtractionOutcome::Failure { reason } => return self.fail(source, reason),
        };

        self.transition(&source, FlowState::Delivering);
        let delivered_via = self.clipboard.append(&body).await;

        self.transition(&source, FlowState::Done);
        let summary = summarize(&body);
        tracing::info!(%source, citation = %summary.label(), via = ?delivered_via, "citation appended");
        (self.notifier)(FlowEvent::Succeeded {
            source,
            summary,
            delivered_via,
        });
        ExtractionOutcome::success(body)
    }

    fn transition(&self, source: &FlowSource, state: FlowState) {
        tracing::debug!(%source, ?state, "cross-window flow");
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
