//! Direct lookup: skip the pop-over and fetch a result's citation file by
//! cluster id.

use citegrab_core::proxy::classify_proxy_error;
use citegrab_core::{ExtractionOutcome, FailureReason, LiveDocument, PageLayout};
use tokio::task::JoinSet;
use url::Url;

use crate::ScholarError;
use crate::session::ScholarSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectResult {
    pub query: String,
    pub outcome: ExtractionOutcome,
}

/// Cluster id of the first result on a results page.
pub fn cluster_id_from_page(doc: &LiveDocument, layout: &PageLayout) -> Option<String> {
    let item = doc.query_first(&layout.result_item)?;
    let container = doc.closest(item, &layout.result_container)?;
    doc.attr(container, &layout.cluster_attr)
        .filter(|cid| !cid.trim().is_empty())
}

/// `/scholar.bib?hl=en&output=citation&cluster={cid}` on `base`.
pub fn cluster_citation_url(base: &Url, cluster_id: &str) -> Result<Url, ScholarError> {
    let path = format!(
        "/scholar.bib?hl=en&output=citation&cluster={}",
        urlencoding::encode(cluster_id)
    );
    Ok(base.join(&path)?)
}

/// Search for `query` and fetch the first result's citation file.
pub async fn direct_lookup(session: &ScholarSession, query: &str) -> ExtractionOutcome {
    let query = query.trim();
    if query.is_empty() {
        return ExtractionOutcome::failure(FailureReason::NotFound("empty query".into()));
    }
    match lookup(session, query).await {
        Ok(body) => {
            tracing::info!(%query, bytes = body.len(), "direct lookup succeeded");
            ExtractionOutcome::success(body)
        }
        Err(ScholarError::NoResults(q)) => {
            tracing::info!(query = %q, "no results");
            ExtractionOutcome::failure(FailureReason::NotFound(format!("no results for {q:?}")))
        }
        Err(e) => {
            tracing::info!(%query, error = %e, "direct lookup failed");
            ExtractionOutcome::failure(classify_proxy_error(&e.to_string()))
        }
    }
}

async fn lookup(session: &ScholarSession, query: &str) -> Result<String, ScholarError> {
    let search = session.search_url(query)?;
    let page = session.load_results_page(&search).await?;
    let cluster_id = cluster_id_from_page(&page, session.layout())
        .ok_or_else(|| ScholarError::NoResults(query.to_string()))?;
    tracing::debug!(%query, %cluster_id, "first result");
    let bib_url = cluster_citation_url(session.base_url(), &cluster_id)?;
    session.get_text(&bib_url).await
}

/// Look up every query concurrently. Results keep the input order; the
/// session throttle still spaces the underlying requests.
pub async fn direct_batch(session: &ScholarSession, queries: &[String]) -> Vec<DirectResult> {
    let mut tasks = JoinSet::new();
    for (index, query) in queries.iter().enumerate() {
        let session = session.clone();
        let query = query.clone();
        tasks.spawn(async move {
            let outcome = direct_lookup(&session, &query).await;
            (index, DirectResult { query, outcome })
        });
    }

    let mut results = Vec::with_capacity(queries.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => tracing::warn!(error = %e, "direct lookup task failed"),
        }
    }
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, r)| r).collect()
}

/// Successful bodies joined by newlines, in input order.
pub fn join_bodies(results: &[DirectResult]) -> String {
    results
        .iter()
        .filter_map(|r| r.outcome.body())
        .collect::<Vec<_>>()
        .join("\n")
}
