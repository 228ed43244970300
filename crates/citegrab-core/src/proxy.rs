//! Client side of the privileged fetch proxy.
//!
//! The pipeline cannot fetch citation files itself; it hands the URL to a
//! collaborator holding the session credentials and normalizes the reply.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{ExtractionOutcome, FailureReason};

/// Request sent to the proxy: `{"action":"fetchCitation","url":...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ProxyRequest {
    FetchCitation { url: String },
}

/// Reply from the proxy: exactly one of `{"bib":...}` or `{"error":...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxyResponse {
    Bib { bib: String },
    Error { error: String },
}

/// The proxy could not be reached at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyTransportError {
    #[error("proxy unreachable: {0}")]
    Unreachable(String),
    #[error("proxy closed without replying")]
    NoReply,
}

/// A collaborator that performs citation fetches with ambient credentials.
pub trait FetchProxy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Deliver one request and wait for its single reply.
    fn send<'a>(
        &'a self,
        request: &'a ProxyRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProxyResponse, ProxyTransportError>> + Send + 'a>>;
}

static HTTP_STATUS_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[1-5]\d\d\b").unwrap());

/// An error string starting with an HTTP status means the server answered
/// but without the file; anything else is a network failure.
pub fn classify_proxy_error(error: &str) -> FailureReason {
    if HTTP_STATUS_PREFIX.is_match(error) {
        FailureReason::NotFound(error.to_string())
    } else {
        FailureReason::NetworkError(error.to_string())
    }
}

/// Validates, delegates and normalizes citation fetches.
#[derive(Clone)]
pub struct FetchProxyClient {
    proxy: Arc<dyn FetchProxy>,
}

impl FetchProxyClient {
    pub fn new(proxy: Arc<dyn FetchProxy>) -> Self {
        Self { proxy }
    }

    pub fn proxy_name(&self) -> &str {
        self.proxy.name()
    }

    /// Fetch a citation body. Never fails outright; every problem becomes a
    /// `Failure` outcome.
    pub async fn fetch_citation(&self, url: &str) -> ExtractionOutcome {
        let parsed = match Url::parse(url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => u,
            Ok(u) => {
                return ExtractionOutcome::failure(FailureReason::NetworkError(format!(
                    "unsupported URL scheme: {}",
                    u.scheme()
                )));
            }
            Err(e) => {
                return ExtractionOutcome::failure(FailureReason::NetworkError(format!(
                    "malformed citation URL {url:?}: {e}"
                )));
            }
        };

        let request = ProxyRequest::FetchCitation {
            url: parsed.to_string(),
        };
        tracing::debug!(proxy = self.proxy.name(), url = %parsed, "fetching citation");

        match self.proxy.send(&request).await {
            Ok(ProxyResponse::Bib { bib }) => ExtractionOutcome::success(bib),
            Ok(ProxyResponse::Error { error }) => {
                tracing::info!(url = %parsed, error = %error, "proxy reported an error");
                ExtractionOutcome::failure(classify_proxy_error(&error))
            }
            Err(e) => {
                tracing::warn!(proxy = self.proxy.name(), error = %e, "proxy transport failed");
                ExtractionOutcome::failure(FailureReason::NetworkError(e.to_string()))
            }
        }
    }
}
