//! The extraction pipeline over a converted result page.

use std::sync::Arc;
use std::time::Duration;

use citegrab_core::clipboard::MemoryClipboard;
use citegrab_core::mock::{EventLog, MockProxy, MockResponse, PopoverScript, install_popover};
use citegrab_core::{ClipboardWriter, Config, FetchProxyClient, ResultPage, SingleItemFlow};
use citegrab_scholar::direct::cluster_id_from_page;
use citegrab_scholar::html::parse_page;
use url::Url;

const SCHOLAR_PAGE: &str = r#"<!doctype html>
<html><head><script>window.gs = {};</script></head>
<body><div id="gs_bdy"><div id="gs_res_ccl_mid">
  <div class="gs_r gs_or gs_scl" data-cid="Q7iqy8ZkHskJ" data-rp="0">
    <div class="gs_ri">
      <h3 class="gs_rt"><a href="https://arxiv.org/abs/1706.03762">Attention is all you need</a></h3>
      <div class="gs_fl gs_flb">
        <a href="javascript:void(0)" class="gs_or_sav gs_or_btn">Save</a>
        <a href="javascript:void(0)" class="gs_or_cit gs_or_btn gs_nph">Cite</a>
      </div>
    </div>
  </div>
  <div class="gs_r gs_or gs_scl" data-cid="HvWGb9AtWCEJ" data-rp="1">
    <div class="gs_ri">
      <h3 class="gs_rt"><a href="https://example.org/bert">BERT</a></h3>
      <div class="gs_fl gs_flb"><a href="javascript:void(0)" class="gs_or_cit gs_or_btn gs_nph">Cite</a></div>
    </div>
  </div>
</div></div></body></html>"#;

#[tokio::test(start_paused = true)]
async fn converted_page_runs_the_single_item_flow() {
    let doc = parse_page(
        SCHOLAR_PAGE,
        Url::parse("https://scholar.google.com/scholar?q=attention&hl=en").unwrap(),
    );
    let config = Config::default();
    let memory = MemoryClipboard::new();
    let events = EventLog::default();
    let flow = Arc::new(SingleItemFlow::new(
        &config,
        FetchProxyClient::new(Arc::new(MockProxy::new(MockResponse::Bib(
            "@inproceedings{vaswani2017attention}".into(),
        )))),
        Arc::new(ClipboardWriter::new(vec![Arc::new(memory.clone())])),
        events.notifier(),
    ));

    let page = ResultPage::new(doc.clone(), flow);
    let wired = page.wire_items();
    assert_eq!(wired.len(), 2);

    install_popover(
        &doc,
        wired[1].trigger,
        PopoverScript::bibtex("https://scholar.googleusercontent.com/scholar.bib?q=info:HvWGb9AtWCEJ")
            .with_delay(Duration::from_millis(300)),
    );
    let outcome = page.extract(wired[1].item).await;

    assert!(outcome.is_some_and(|o| o.is_success()));
    assert_eq!(memory.contents(), "@inproceedings{vaswani2017attention}");
    assert_eq!(doc.navigation_count(), 0);
    assert_eq!(
        cluster_id_from_page(&doc, &config.layout).as_deref(),
        Some("Q7iqy8ZkHskJ")
    );
}
