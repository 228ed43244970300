use std::sync::Arc;
use std::time::Duration;

use citegrab_core::{Config, LiveDocument, NodeSpec, PageLayout};
use url::Url;

use crate::ScholarError;
use crate::html;
use crate::throttle::{AdaptiveLimiter, check_rate_limit_response};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One logged-in view of the search site: cookie jar, throttle and layout.
///
/// Clones share the same client, so cookies set by a result page are sent
/// with the citation-file fetch that follows it.
#[derive(Clone)]
pub struct ScholarSession {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    base_url: Url,
    layout: PageLayout,
    limiter: AdaptiveLimiter,
}

impl ScholarSession {
    pub fn new(config: &Config) -> Result<Self, ScholarError> {
        let base_url = Url::parse(&config.base_url)?;
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url,
                layout: config.layout.clone(),
                limiter: AdaptiveLimiter::per_second(config.requests_per_second),
            }),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn layout(&self) -> &PageLayout {
        &self.inner.layout
    }

    pub fn limiter(&self) -> &AdaptiveLimiter {
        &self.inner.limiter
    }

    /// Throttled GET returning the body of a 2xx reply.
    pub async fn get_text(&self, url: &Url) -> Result<String, ScholarError> {
        self.inner.limiter.acquire().await;
        tracing::debug!(%url, "GET");
        let resp = self.inner.client.get(url.clone()).send().await?;

        if let Err(e) = check_rate_limit_response(&resp) {
            self.inner.limiter.on_rate_limited();
            return Err(e);
        }
        let status = resp.status();
        if !status.is_success() {
            return Err(ScholarError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok(resp.text().await?)
    }

    /// English results page for a free-text query.
    pub fn search_url(&self, query: &str) -> Result<Url, ScholarError> {
        let mut url = self.inner.layout.search_url(&self.inner.base_url, query)?;
        url.query_pairs_mut().append_pair("hl", "en");
        Ok(url)
    }

    /// The cite fragment the site loads into its pop-over for one result.
    pub fn cite_url(&self, cluster_id: &str, index: usize) -> Result<Url, ScholarError> {
        let mut url = self.inner.base_url.join(&self.inner.layout.search_path)?;
        url.query_pairs_mut()
            .append_pair("q", &format!("info:{cluster_id}:scholar.google.com/"))
            .append_pair("output", "cite")
            .append_pair("scirp", &index.to_string())
            .append_pair("hl", "en");
        Ok(url)
    }

    /// Fetch a page and convert it into a live document.
    pub async fn load_results_page(&self, url: &Url) -> Result<LiveDocument, ScholarError> {
        let body = self.get_text(url).await?;
        let page_url = url.clone();
        tokio::task::spawn_blocking(move || html::parse_page(&body, page_url))
            .await
            .map_err(|e| ScholarError::Parse(e.to_string()))
    }

    /// Fetch an HTML fragment as specs to append into a document.
    pub async fn load_fragment(&self, url: &Url) -> Result<Vec<NodeSpec>, ScholarError> {
        let body = self.get_text(url).await?;
        tokio::task::spawn_blocking(move || html::parse_fragment(&body))
            .await
            .map_err(|e| ScholarError::Parse(e.to_string()))
    }
}
