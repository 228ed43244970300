//! Test doubles for the pipeline's collaborators.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::clipboard::{ClipboardBackend, ClipboardError};
use crate::context::{BrowsingContext, ContextError, ContextOpener};
use crate::dom::{ListenerId, LiveDocument, NodeId, NodeSpec, Phase, Selector};
use crate::proxy::{FetchProxy, ProxyRequest, ProxyResponse, ProxyTransportError};
use crate::{FailureReason, FlowEvent, FlowSource, FlowState, Notifier};

/// URL of the page built by [`results_page`].
pub const FIXTURE_URL: &str = "https://scholar.google.com/scholar?q=test";

/// A configurable reply for [`MockProxy`].
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Reply `{bib}`.
    Bib(String),
    /// Reply `{error}`.
    Error(String),
    /// The proxy cannot be reached.
    Unreachable,
}

/// A hand-rolled [`FetchProxy`] for tests.
///
/// Supports:
/// - A fixed response (used for every call), **or**
/// - A sequence of responses (one per call, repeating the last if exhausted).
/// - Optional per-call latency.
/// - Call counting and the URLs requested.
pub struct MockProxy {
    responses: Mutex<Vec<MockResponse>>,
    fallback: MockResponse,
    delay: Option<Duration>,
    call_count: AtomicUsize,
    requested: Mutex<Vec<String>>,
}

impl MockProxy {
    pub fn new(response: MockResponse) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fallback: response,
            delay: None,
            call_count: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn with_sequence(mut responses: Vec<MockResponse>) -> Self {
        assert!(!responses.is_empty(), "sequence must have at least one response");
        responses.reverse();
        let fallback = responses[0].clone();
        Self {
            responses: Mutex::new(responses),
            ..Self::new(fallback)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.requested.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn next_response(&self) -> MockResponse {
        let mut seq = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        seq.pop().unwrap_or_else(|| self.fallback.clone())
    }
}

impl FetchProxy for MockProxy {
    fn name(&self) -> &str {
        "mock"
    }

    fn send<'a>(
        &'a self,
        request: &'a ProxyRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProxyResponse, ProxyTransportError>> + Send + 'a>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let ProxyRequest::FetchCitation { url } = request;
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.clone());
        let response = self.next_response();
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            match response {
                MockResponse::Bib(bib) => Ok(ProxyResponse::Bib { bib }),
                MockResponse::Error(error) => Ok(ProxyResponse::Error { error }),
                MockResponse::Unreachable => {
                    Err(ProxyTransportError::Unreachable("mock proxy offline".into()))
                }
            }
        })
    }
}

/// A clipboard strategy that always fails.
#[derive(Debug, Default)]
pub struct FailingClipboard {
    attempts: AtomicUsize,
}

impl FailingClipboard {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl ClipboardBackend for FailingClipboard {
    fn name(&self) -> &str {
        "failing"
    }

    fn read_text(&self) -> Result<String, ClipboardError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ClipboardError::Unavailable("permission denied".into()))
    }

    fn write_text(&self, _text: &str) -> Result<(), ClipboardError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ClipboardError::Unavailable("permission denied".into()))
    }

    fn is_blocking(&self) -> bool {
        false
    }
}

/// Records every [`FlowEvent`]. Clones share the log.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<FlowEvent>>>,
}

impl EventLog {
    pub fn notifier(&self) -> Notifier {
        let events = Arc::clone(&self.events);
        Arc::new(move |event| {
            events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
        })
    }

    pub fn events(&self) -> Vec<FlowEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn states(&self) -> Vec<FlowState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlowEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn successes(&self) -> Vec<FlowSource> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlowEvent::Succeeded { source, .. } => Some(source),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<(FlowSource, FailureReason)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlowEvent::Failed { source, reason } => Some((source, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn wired(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, FlowEvent::ItemWired { .. }))
            .count()
    }
}

/// Node ids of one fixture result.
#[derive(Debug, Clone, Copy)]
pub struct ResultFixture {
    pub container: NodeId,
    pub item: NodeId,
    pub trigger: NodeId,
}

/// A result page at [`FIXTURE_URL`] with `count` results.
pub fn results_page(count: usize) -> (LiveDocument, Vec<ResultFixture>) {
    let url = Url::parse(FIXTURE_URL).expect("fixture URL is valid");
    results_page_at(url, count)
}

/// A result page at `url` with `count` results, in the search site's markup.
pub fn results_page_at(url: Url, count: usize) -> (LiveDocument, Vec<ResultFixture>) {
    let doc = LiveDocument::new(url);
    let body = doc.body();
    let list = doc
        .append(body, NodeSpec::element("div").attr("id", "gs_res_ccl_mid"))
        .expect("body is always present");
    let fixtures = (0..count).map(|i| append_result(&doc, list, i)).collect();
    (doc, fixtures)
}

/// Append one result to `list`, as the site does when it renders lazily.
pub fn append_result(doc: &LiveDocument, list: NodeId, i: usize) -> ResultFixture {
    let container = doc.append(
        list,
        NodeSpec::element("div")
            .attr("class", "gs_r gs_or gs_scl")
            .attr("data-cid", format!("cid{i}"))
            .child(
                NodeSpec::element("div").attr("class", "gs_ri").children([
                    NodeSpec::element("h3")
                        .attr("class", "gs_rt")
                        .child(NodeSpec::element("a").attr("href", format!("https://papers.example/{i}")).text(format!("Paper {i}"))),
                    NodeSpec::element("div").attr("class", "gs_fl").children([
                        NodeSpec::element("a")
                            .attr("class", "gs_or_cit gs_nph")
                            .attr("href", "javascript:void(0)")
                            .text("Cite"),
                        NodeSpec::element("a")
                            .attr("href", format!("/scholar?cites={i}"))
                            .text("Cited by 10"),
                    ]),
                ]),
            ),
        )
        .expect("result list belongs to the document");
    let item = doc
        .query_first_within(container, &Selector::class("gs_ri"))
        .unwrap_or(container);
    let trigger = doc
        .query_first_within(container, &Selector::class("gs_or_cit"))
        .unwrap_or(container);
    ResultFixture {
        container,
        item,
        trigger,
    }
}

/// How the fake pop-over behaves when its trigger is activated.
#[derive(Debug, Clone)]
pub struct PopoverScript {
    /// Render delay after activation.
    pub delay: Duration,
    /// `href` of the BibTeX link; `None` renders the pop-over without one.
    pub bibtex_href: Option<String>,
}

impl PopoverScript {
    pub fn bibtex(href: impl Into<String>) -> Self {
        Self {
            delay: Duration::from_millis(200),
            bibtex_href: Some(href.into()),
        }
    }

    pub fn never() -> Self {
        Self {
            delay: Duration::from_millis(200),
            bibtex_href: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Make activating `trigger` render a citation pop-over after `script.delay`.
pub fn install_popover(doc: &LiveDocument, trigger: NodeId, script: PopoverScript) -> ListenerId {
    let weak = doc.downgrade();
    doc.add_listener(
        trigger,
        Phase::Bubble,
        Arc::new(move |_| {
            let weak = weak.clone();
            let script = script.clone();
            tokio::spawn(async move {
                tokio::time::sleep(script.delay).await;
                if let Some(doc) = weak.upgrade() {
                    render_popover(&doc, &script);
                }
            });
        }),
    )
}

fn render_popover(doc: &LiveDocument, script: &PopoverScript) {
    if let Some(existing) = doc.find_by_id("gs_cit") {
        doc.remove(existing);
    }
    let mut formats = vec![
        NodeSpec::element("a")
            .attr("class", "gs_citi")
            .attr("href", "/scholar.enw?q=info:x")
            .text("EndNote"),
    ];
    if let Some(href) = &script.bibtex_href {
        formats.push(
            NodeSpec::element("a")
                .attr("class", "gs_citi")
                .attr("href", href.clone())
                .text("BibTeX"),
        );
    }
    let body = doc.body();
    let Some(popup) = doc.append(
        body,
        NodeSpec::element("div").attr("id", "gs_cit").children([
            NodeSpec::element("a").attr("id", "gs_cit-x").attr("href", "#").text("Cancel"),
            NodeSpec::element("div").attr("id", "gs_citi").children(formats),
        ]),
    ) else {
        return;
    };
    if let Some(close) = doc.query_first_within(popup, &Selector::id("gs_cit-x")) {
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

/// A browsing context over an in-memory document.
pub struct MockContext {
    doc: LiveDocument,
    closed: CancellationToken,
    closes: Arc<AtomicUsize>,
}

impl MockContext {
    pub fn new(url: Url) -> Self {
        Self::with_document(LiveDocument::new(url), Arc::new(AtomicUsize::new(0)))
    }

    pub fn with_document(doc: LiveDocument, closes: Arc<AtomicUsize>) -> Self {
        Self {
            doc,
            closed: CancellationToken::new(),
            closes,
        }
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl BrowsingContext for MockContext {
    fn document(&self) -> &LiveDocument {
        &self.doc
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    Normal,
    /// The context dies right after loading, before its script reports.
    Crash,
    Fail,
}

/// An opener that builds fixture result pages and records what it opened.
pub struct MockOpener {
    script: PopoverScript,
    per_query: HashMap<String, PopoverScript>,
    results: usize,
    load_delay: Duration,
    mode: OpenMode,
    opened: Mutex<Vec<(Url, Instant)>>,
    closes: Arc<AtomicUsize>,
}

impl MockOpener {
    pub fn new(script: PopoverScript) -> Self {
        Self {
            script,
            per_query: HashMap::new(),
            results: 1,
            load_delay: Duration::from_millis(100),
            mode: OpenMode::Normal,
            opened: Mutex::new(Vec::new()),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_results(mut self, count: usize) -> Self {
        self.results = count;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Use a different pop-over for one query.
    pub fn with_query_script(mut self, query: &str, script: PopoverScript) -> Self {
        self.per_query.insert(query.to_string(), script);
        self
    }

    pub fn crashing(mut self) -> Self {
        self.mode = OpenMode::Crash;
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.mode = OpenMode::Fail;
        self
    }

    /// Each `open` call with the instant it was made.
    pub fn opened(&self) -> Vec<(Url, Instant)> {
        self.opened.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn opened_queries(&self) -> Vec<String> {
        self.opened()
            .iter()
            .filter_map(|(url, _)| query_of(url))
            .collect()
    }

    /// Contexts closed by their owner.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

fn query_of(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == "q")
        .map(|(_, v)| v.into_owned())
}

impl ContextOpener for MockOpener {
    fn open<'a>(
        &'a self,
        url: &'a Url,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn BrowsingContext>, ContextError>> + Send + 'a>> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((url.clone(), Instant::now()));

        Box::pin(async move {
            tokio::time::sleep(self.load_delay).await;
            if self.mode == OpenMode::Fail {
                return Err(ContextError::OpenFailed {
                    url: url.to_string(),
                    message: "connection refused".into(),
                });
            }

            let script = query_of(url)
                .and_then(|q| self.per_query.get(&q).cloned())
                .unwrap_or_else(|| self.script.clone());
            let (doc, items) = results_page_at(url.clone(), self.results);
            for item in &items {
                install_popover(&doc, item.trigger, script.clone());
            }

            let context = MockContext::with_document(doc, Arc::clone(&self.closes));
            if self.mode == OpenMode::Crash {
                context.closed.cancel();
            }
            Ok(Arc::new(context) as Arc<dyn BrowsingContext>)
        })
    }
}
