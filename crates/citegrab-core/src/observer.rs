//! Link observer: waits for a qualifying citation-file link to be rendered.

use std::time::Duration;

use url::Url;

use crate::FailureReason;
use crate::dom::{LiveDocument, MutationBatch};
use crate::layout::PageLayout;
use crate::watch::PendingWatch;

/// A link whose label and resolved URL both look like a citation file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CitationLinkCandidate {
    pub url: Url,
    pub label: String,
}

impl CitationLinkCandidate {
    /// Qualify an anchor. `href` may be absolute, root-relative or
    /// protocol-relative; it is resolved against `base`.
    pub fn qualify(label: &str, href: &str, base: &Url, layout: &PageLayout) -> Option<Self> {
        if href.trim().is_empty() || !layout.is_citation_label(label) {
            return None;
        }
        let url = base.join(href.trim()).ok()?;
        if !matches!(url.scheme(), "http" | "https") || !layout.is_citation_url(&url) {
            return None;
        }
        Some(Self {
            url,
            label: label.to_string(),
        })
    }
}

/// Scan the document for the first qualifying link.
pub fn find_citation_link(doc: &LiveDocument, layout: &PageLayout) -> Option<CitationLinkCandidate> {
    doc.anchors()
        .into_iter()
        .find_map(|a| CitationLinkCandidate::qualify(&a.label, &a.href, doc.url(), layout))
}

/// One observation of a document. Subscribes on [`start`](LinkObserver::start),
/// so trigger the pop-over after starting and before awaiting.
pub struct LinkObserver {
    doc: LiveDocument,
    layout: PageLayout,
    watch: PendingWatch<MutationBatch>,
}

impl LinkObserver {
    pub fn start(doc: &LiveDocument, layout: &PageLayout, timeout: Duration) -> Self {
        Self {
            doc: doc.clone(),
            layout: layout.clone(),
            watch: PendingWatch::new(doc, timeout),
        }
    }

    /// Resolve with the absolute citation URL, or `TimedOut`.
    pub async fn wait(self) -> Result<Url, FailureReason> {
        let LinkObserver { doc, layout, watch } = self;
        watch
            .until(|| find_citation_link(&doc, &layout).map(|c| c.url))
            .await
            .map_err(|_| FailureReason::TimedOut)
    }
}

/// Observe future mutations of `doc` for a citation link.
pub async fn observe(
    doc: &LiveDocument,
    layout: &PageLayout,
    timeout: Duration,
) -> Result<Url, FailureReason> {
    LinkObserver::start(doc, layout, timeout).wait().await
}
