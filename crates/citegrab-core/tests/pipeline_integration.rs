//! End-to-end tests for the extraction pipeline against in-memory
//! collaborators. All timing runs on tokio's paused clock.

use std::sync::Arc;
use std::time::Duration;

use citegrab_core::clipboard::{ClipboardBackend, MemoryClipboard};
use citegrab_core::mock::{
    EventLog, MockOpener, MockProxy, MockResponse, PopoverScript, append_result, install_popover,
    results_page,
};
use citegrab_core::{
    BatchJob, CitationRequest, ClipboardWriter, Config, CrossWindowFlow, ExtractionOutcome,
    FailureReason, FetchProxyClient, FlowSource, ResultPage, SingleItemFlow, extract, run_batch,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Pipeline {
    single: Arc<SingleItemFlow>,
    cross: Arc<CrossWindowFlow>,
    opener: Arc<MockOpener>,
    proxy: Arc<MockProxy>,
    memory: MemoryClipboard,
    events: EventLog,
}

fn pipeline(opener: MockOpener, proxy: MockProxy) -> Pipeline {
    let config = Config::default();
    let opener = Arc::new(opener);
    let proxy = Arc::new(proxy);
    let memory = MemoryClipboard::new();
    let events = EventLog::default();
    let clipboard = Arc::new(ClipboardWriter::new(vec![Arc::new(memory.clone())]));
    let client = FetchProxyClient::new(proxy.clone());

    let single = Arc::new(SingleItemFlow::new(
        &config,
        client.clone(),
        clipboard.clone(),
        events.notifier(),
    ));
    let cross = Arc::new(
        CrossWindowFlow::new(&config, opener.clone(), client, clipboard, events.notifier()).unwrap(),
    );
    Pipeline {
        single,
        cross,
        opener,
        proxy,
        memory,
        events,
    }
}

fn default_opener() -> MockOpener {
    MockOpener::new(PopoverScript::bibtex("/scholar.bib?q=info:x"))
}

#[tokio::test(start_paused = true)]
async fn on_page_item_is_copied() {
    let p = pipeline(
        default_opener(),
        MockProxy::new(MockResponse::Bib("@article{...}".into())),
    );
    let (doc, items) = results_page(1);
    install_popover(
        &doc,
        items[0].trigger,
        PopoverScript::bibtex("/scholar.bib?q=1").with_delay(Duration::from_millis(500)),
    );

    let outcome = p.single.run(&doc, items[0].trigger).await;

    assert_eq!(outcome, ExtractionOutcome::success("@article{...}"));
    assert_eq!(p.memory.contents(), "@article{...}");
    assert_eq!(p.events.successes(), vec![FlowSource::Item(items[0].trigger)]);
    assert!(p.events.failures().is_empty());
    assert_eq!(
        p.proxy.requested_urls(),
        vec!["https://scholar.google.com/scholar.bib?q=1".to_string()]
    );
    assert_eq!(doc.navigation_count(), 0);
    assert!(doc.find_by_id("gs_cit").is_none());
}

#[tokio::test(start_paused = true)]
async fn missing_link_times_out_without_fetching() {
    let p = pipeline(default_opener(), MockProxy::new(MockResponse::Bib("x".into())));
    let (doc, items) = results_page(1);
    install_popover(&doc, items[0].trigger, PopoverScript::never());

    let start = Instant::now();
    let outcome = p.single.run(&doc, items[0].trigger).await;

    assert!(start.elapsed() >= Duration::from_millis(3000));
    assert_eq!(outcome.reason(), Some(&FailureReason::TimedOut));
    assert_eq!(
        p.events.failures(),
        vec![(FlowSource::Item(items[0].trigger), FailureReason::TimedOut)]
    );
    assert!(p.events.successes().is_empty());
    assert_eq!(p.proxy.call_count(), 0);
    assert!(doc.find_by_id("hidePopup").is_none());
    assert!(doc.find_by_id("gs_cit").is_none());
}

#[tokio::test(start_paused = true)]
async fn batch_staggers_and_isolates_items() {
    let opener = default_opener().with_query_script("beta", PopoverScript::never());
    let p = pipeline(opener, MockProxy::new(MockResponse::Bib("@misc{alpha}".into())));
    p.memory.write_text("stale clipboard").unwrap();

    let start = Instant::now();
    let job = BatchJob::new(vec!["alpha".into(), "beta".into()], Duration::from_millis(2000));
    let results = run_batch(job, p.cross.clone(), CancellationToken::new()).await;

    let opened = p.opener.opened();
    assert_eq!(opened.len(), 2);
    let first = opened[0].1 - start;
    let second = opened[1].1 - start;
    assert!(first < Duration::from_millis(10), "first item opened at {first:?}");
    assert!(
        second >= Duration::from_millis(2000) && second < Duration::from_millis(2010),
        "second item opened at {second:?}"
    );
    assert_eq!(p.opener.opened_queries(), vec!["alpha".to_string(), "beta".to_string()]);

    assert_eq!(results.len(), 2);
    assert!(results[0].outcome.is_success());
    assert_eq!(results[1].outcome.reason(), Some(&FailureReason::TimedOut));

    assert_eq!(p.memory.contents(), "@misc{alpha}");
    assert_eq!(p.events.successes().len(), 1);
    assert_eq!(p.events.failures().len(), 1);
    assert_eq!(p.opener.close_count(), 2);
    assert_eq!(p.cross.bus().listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn batch_appends_every_success() {
    let p = pipeline(
        default_opener(),
        MockProxy::with_sequence(vec![
            MockResponse::Bib("@misc{one}".into()),
            MockResponse::Bib("@misc{two}".into()),
            MockResponse::Bib("@misc{three}".into()),
        ]),
    );
    let job = BatchJob::from_lines("one\ntwo\nthree\n", Duration::from_millis(2000));
    let results = run_batch(job, p.cross.clone(), CancellationToken::new()).await;

    assert!(results.iter().all(|r| r.outcome.is_success()));
    assert_eq!(p.memory.contents(), "@misc{one}\n@misc{two}\n@misc{three}");
}

#[tokio::test(start_paused = true)]
async fn cancelled_batch_skips_pending_items() {
    let p = pipeline(default_opener(), MockProxy::new(MockResponse::Bib("@misc{a}".into())));
    let cancel = CancellationToken::new();
    let job = BatchJob::new(
        vec!["a".into(), "b".into(), "c".into()],
        Duration::from_millis(2000),
    );

    let trip = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1000)).await;
        trip.cancel();
    });
    let results = run_batch(job, p.cross.clone(), cancel).await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].query, "a");
    assert_eq!(p.opener.opened().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn wiring_twice_attaches_one_flow_per_item() {
    let p = pipeline(default_opener(), MockProxy::new(MockResponse::Bib("@misc{w}".into())));
    let (doc, items) = results_page(3);
    for item in &items {
        install_popover(&doc, item.trigger, PopoverScript::bibtex("/scholar.bib?q=w"));
    }
    let page = ResultPage::new(doc, p.single.clone());

    assert_eq!(page.wire_items().len(), 3);
    assert!(page.wire_items().is_empty());
    assert_eq!(p.events.wired(), 3);

    let outcome = page.extract(items[1].item).await;
    assert!(outcome.is_some_and(|o| o.is_success()));
    assert_eq!(p.events.successes(), vec![FlowSource::Item(items[1].trigger)]);
}

#[tokio::test(start_paused = true)]
async fn concurrent_click_on_busy_item_is_ignored() {
    let p = pipeline(default_opener(), MockProxy::new(MockResponse::Bib("@misc{w}".into())));
    let (doc, items) = results_page(1);
    install_popover(&doc, items[0].trigger, PopoverScript::bibtex("/scholar.bib?q=w"));
    let page = ResultPage::new(doc, p.single.clone());
    page.wire_items();

    let (first, second) = tokio::join!(page.extract(items[0].item), page.extract(items[0].item));
    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(p.events.successes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn lazily_rendered_items_are_wired() {
    let p = pipeline(default_opener(), MockProxy::new(MockResponse::Bib("x".into())));
    let (doc, _) = results_page(1);
    let page = Arc::new(ResultPage::new(doc.clone(), p.single.clone()));
    let cancel = CancellationToken::new();

    let watcher = {
        let page = page.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { page.watch_new_items(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(page.items().len(), 1);

    let list = doc.find_by_id("gs_res_ccl_mid").unwrap();
    append_result(&doc, list, 1);
    append_result(&doc, list, 2);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(page.items().len(), 3);
    assert_eq!(p.events.wired(), 3);

    cancel.cancel();
    watcher.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn requests_route_to_their_flow() {
    let p = pipeline(default_opener(), MockProxy::new(MockResponse::Bib("@misc{r}".into())));
    let (doc, items) = results_page(1);
    install_popover(&doc, items[0].trigger, PopoverScript::bibtex("/scholar.bib?q=r"));

    let by_element = CitationRequest::ByElement {
        document: doc.clone(),
        trigger: items[0].trigger,
    };
    assert!(extract(by_element, &p.single, &p.cross).await.is_success());

    let by_query = CitationRequest::ByQuery {
        text: "routing".into(),
    };
    assert!(extract(by_query, &p.single, &p.cross).await.is_success());
    assert_eq!(p.opener.opened_queries(), vec!["routing".to_string()]);
    assert_eq!(p.memory.contents(), "@misc{r}\n@misc{r}");
}

#[tokio::test(start_paused = true)]
async fn flows_leave_no_listeners_behind() {
    let p = pipeline(default_opener(), MockProxy::new(MockResponse::Error("boom".into())));
    let (doc, items) = results_page(1);
    install_popover(&doc, items[0].trigger, PopoverScript::bibtex("/scholar.bib?q=1"));
    let before = doc.listener_count();

    let outcome = p.single.run(&doc, items[0].trigger).await;
    assert!(matches!(outcome.reason(), Some(FailureReason::NetworkError(m)) if m.contains("boom")));
    assert_eq!(doc.listener_count(), before);

    for query in ["x", "y", "z"] {
        let _ = p.cross.run(query).await;
    }
    assert_eq!(p.cross.bus().listener_count(), 0);
    assert_eq!(p.opener.close_count(), 3);
}
