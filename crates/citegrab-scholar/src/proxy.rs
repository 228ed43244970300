use std::future::Future;
use std::pin::Pin;

use citegrab_core::proxy::{FetchProxy, ProxyRequest, ProxyResponse, ProxyTransportError};
use url::Url;

use crate::session::ScholarSession;

/// Privileged fetcher: performs citation-file GETs with the session's cookies.
///
/// Every HTTP-level failure is reported in-band as `{error}`; the transport
/// error channel is reserved for a proxy that cannot be reached at all.
pub struct HttpFetchProxy {
    session: ScholarSession,
}

impl HttpFetchProxy {
    pub fn new(session: ScholarSession) -> Self {
        Self { session }
    }
}

impl FetchProxy for HttpFetchProxy {
    fn name(&self) -> &str {
        "scholar-http"
    }

    fn send<'a>(
        &'a self,
        request: &'a ProxyRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProxyResponse, ProxyTransportError>> + Send + 'a>> {
        Box::pin(async move {
            let ProxyRequest::FetchCitation { url } = request;
            let url = match Url::parse(url) {
                Ok(u) => u,
                Err(e) => {
                    return Ok(ProxyResponse::Error {
                        error: format!("invalid URL: {e}"),
                    });
                }
            };
            match self.session.get_text(&url).await {
                Ok(bib) => Ok(ProxyResponse::Bib { bib }),
                Err(e) => {
                    tracing::debug!(%url, error = %e, "citation fetch failed");
                    Ok(ProxyResponse::Error {
                        error: e.to_string(),
                    })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use citegrab_core::proxy::classify_proxy_error;
    use citegrab_core::{Config, FailureReason, FetchProxyClient};
    use std::sync::Arc;

    #[tokio::test]
    async fn malformed_url_is_reported_in_band() {
        let session = ScholarSession::new(&Config::default()).unwrap();
        let proxy = HttpFetchProxy::new(session);
        let reply = proxy
            .send(&ProxyRequest::FetchCitation {
                url: "::not a url::".into(),
            })
            .await
            .unwrap();
        assert!(matches!(reply, ProxyResponse::Error { error } if error.starts_with("invalid URL")));
    }

    #[test]
    fn status_errors_classify_as_not_found() {
        let err = crate::ScholarError::Status {
            url: "https://scholar.google.com/scholar.bib".into(),
            status: reqwest::StatusCode::FORBIDDEN,
        };
        assert_eq!(
            classify_proxy_error(&err.to_string()),
            FailureReason::NotFound("403 Forbidden".into())
        );
    }

    #[test]
    fn rate_limits_classify_as_network_errors() {
        let err = crate::ScholarError::RateLimited { retry_after: None };
        assert!(matches!(
            classify_proxy_error(&err.to_string()),
            FailureReason::NetworkError(_)
        ));
    }

    #[test]
    fn client_reports_proxy_name() {
        let session = ScholarSession::new(&Config::default()).unwrap();
        let client = FetchProxyClient::new(Arc::new(HttpFetchProxy::new(session)));
        assert_eq!(client.proxy_name(), "scholar-http");
    }
}
