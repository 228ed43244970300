//! Browsing contexts backed by fetched result pages.
//!
//! The fetched HTML is static, so the page's own citation behaviour is
//! reinstalled here: activating a trigger loads the cite fragment for its
//! result and renders it inside the `#gs_cit` pop-over shell.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use citegrab_core::context::{BrowsingContext, ContextError, ContextOpener};
use citegrab_core::dom::Phase;
use citegrab_core::{LiveDocument, NodeSpec, Selector};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::ScholarError;
use crate::session::ScholarSession;

const POPOVER_ID: &str = "gs_cit";
const CLOSE_ID: &str = "gs_cit-x";
/// Result attribute holding the result's position on the page.
const POSITION_ATTR: &str = "data-rp";

/// Opens result pages over HTTP with the session's cookies and throttle.
pub struct HttpContextOpener {
    session: ScholarSession,
}

impl HttpContextOpener {
    pub fn new(session: ScholarSession) -> Self {
        Self { session }
    }

    /// Load `url` and wire its citation triggers, outside any flow.
    pub async fn load(&self, url: &Url) -> Result<HttpContext, ScholarError> {
        let doc = self.session.load_results_page(url).await?;
        let context = HttpContext::new(doc);
        let wired = install_page_behaviour(&context.doc, &self.session, &context.closed);
        tracing::debug!(%url, wired, "result page loaded");
        Ok(context)
    }
}

impl ContextOpener for HttpContextOpener {
    fn open<'a>(
        &'a self,
        url: &'a Url,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn BrowsingContext>, ContextError>> + Send + 'a>>
    {
        Box::pin(async move {
            match self.load(url).await {
                Ok(context) => Ok(Arc::new(context) as Arc<dyn BrowsingContext>),
                Err(ScholarError::Status { url: page, status }) => Err(ContextError::Status {
                    url: page,
                    status: status.to_string(),
                }),
                Err(e) => Err(ContextError::OpenFailed {
                    url: url.to_string(),
                    message: e.to_string(),
                }),
            }
        })
    }
}

/// A fetched result page. Pending pop-over loads stop when it is closed.
pub struct HttpContext {
    doc: LiveDocument,
    closed: CancellationToken,
}

impl HttpContext {
    pub fn new(doc: LiveDocument) -> Self {
        Self {
            doc,
            closed: CancellationToken::new(),
        }
    }
}

impl BrowsingContext for HttpContext {
    fn document(&self) -> &LiveDocument {
        &self.doc
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Attach a pop-over loader to every result trigger. Returns how many were
/// wired; results without a cluster id or trigger are skipped.
pub fn install_page_behaviour(
    doc: &LiveDocument,
    session: &ScholarSession,
    closed: &CancellationToken,
) -> usize {
    let layout = session.layout();
    let mut wired = 0;
    for (position, container) in doc.query_all(&layout.result_container).into_iter().enumerate() {
        let Some(cluster_id) = doc.attr(container, &layout.cluster_attr) else {
            continue;
        };
        let Some(trigger) = doc.query_first_within(container, &layout.trigger) else {
            continue;
        };
        let index = doc
            .attr(container, POSITION_ATTR)
            .and_then(|v| v.parse().ok())
            .unwrap_or(position);
        let cite_url = match session.cite_url(&cluster_id, index) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(%cluster_id, error = %e, "cannot build cite URL");
                continue;
            }
        };

        let weak = doc.downgrade();
        let session = session.clone();
        let closed = closed.clone();
        doc.add_listener(
            trigger,
            Phase::Bubble,
            Arc::new(move |_| {
                let weak = weak.clone();
                let session = session.clone();
                let closed = closed.clone();
                let url = cite_url.clone();
                tokio::spawn(async move {
                    let fetched = tokio::select! {
                        () = closed.cancelled() => return,
                        fetched = session.load_fragment(&url) => fetched,
                    };
                    match fetched {
                        Ok(specs) => {
                            if let Some(doc) = weak.upgrade() {
                                render_popover(&doc, specs);
                            }
                        }
                        Err(e) => tracing::warn!(%url, error = %e, "cite fragment failed to load"),
                    }
                });
            }),
        );
        wired += 1;
    }
    wired
}

/// Replace any open pop-over with one holding `content`.
pub fn render_popover(doc: &LiveDocument, content: Vec<NodeSpec>) {
    if let Some(existing) = doc.find_by_id(POPOVER_ID) {
        doc.remove(existing);
    }
    let Some(popup) = doc.append(
        doc.body(),
        NodeSpec::element("div")
            .attr("id", POPOVER_ID)
            .child(NodeSpec::element("a").attr("id", CLOSE_ID).attr("href", "#").text("Cancel"))
            .children(content),
    ) else {
        return;
    };
    if let Some(close) = doc.query_first_within(popup, &Selector::id(CLOSE_ID)) {
        let weak = doc.downgrade();
        doc.add_listener(
            close,
            Phase::Bubble,
            Arc::new(move |_| {
                if let Some(doc) = weak.upgrade() {
                    doc.remove(popup);
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::html::{parse_fragment, parse_page};
    use citegrab_core::Config;
    use citegrab_core::observer::find_citation_link;

    const PAGE: &str = r#"<body><div id="gs_res_ccl_mid">
        <div class="gs_r" data-cid="c0"><div class="gs_ri"><a class="gs_or_cit">Cite</a></div></div>
        <div class="gs_r"><div class="gs_ri"><a class="gs_or_cit">Cite</a></div></div>
        <div class="gs_r" data-cid="c2" data-rp="7"><div class="gs_ri">no trigger</div></div>
    </div></body>"#;

    fn page() -> LiveDocument {
        parse_page(PAGE, Url::parse("https://scholar.google.com/scholar?q=x").unwrap())
    }

    #[tokio::test]
    async fn only_complete_results_are_wired() {
        let doc = page();
        let session = ScholarSession::new(&Config::default()).unwrap();
        let wired = install_page_behaviour(&doc, &session, &CancellationToken::new());
        assert_eq!(wired, 1);
        assert_eq!(doc.listener_count(), 1);
    }

    #[test]
    fn rendered_popover_exposes_link_and_closes() {
        let doc = page();
        let specs = parse_fragment(
            r#"<div id="gs_citi"><a class="gs_citi" href="https://scholar.googleusercontent.com/scholar.bib?q=info:c0">BibTeX</a></div>"#,
        );
        render_popover(&doc, specs);

        let layout = Config::default().layout;
        let link = find_citation_link(&doc, &layout).unwrap();
        assert_eq!(
            link.url.as_str(),
            "https://scholar.googleusercontent.com/scholar.bib?q=info:c0"
        );

        let close = doc.find_by_id(CLOSE_ID).unwrap();
        doc.dispatch_click(close);
        assert!(doc.find_by_id(POPOVER_ID).is_none());
    }

    #[test]
    fn closing_the_context_cancels_its_token() {
        let context = HttpContext::new(page());
        let token = context.closed();
        context.close();
        context.close();
        assert!(token.is_cancelled());
    }
}
