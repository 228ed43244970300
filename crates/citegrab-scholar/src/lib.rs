//! Scholar search-page adapter.
//!
//! Concrete collaborators for the extraction pipeline over HTTP: a browsing
//! context opener that loads result pages into a [`LiveDocument`] and
//! reproduces the site's citation pop-over, a privileged fetch proxy sharing
//! the session's cookie jar, and the cluster-id direct lookup.
//!
//! [`LiveDocument`]: citegrab_core::LiveDocument

use std::time::Duration;

use thiserror::Error;

pub mod direct;
pub mod html;
pub mod opener;
pub mod proxy;
pub mod session;
pub mod throttle;

pub use direct::{DirectResult, direct_batch, direct_lookup, join_bodies};
pub use opener::{HttpContext, HttpContextOpener};
pub use proxy::HttpFetchProxy;
pub use session::ScholarSession;
pub use throttle::AdaptiveLimiter;

#[derive(Error, Debug)]
pub enum ScholarError {
    /// Non-OK reply. Displays as `<code> <reason>`, e.g. `404 Not Found`.
    #[error("{status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{}", rate_limited_message(*retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("no results for {0:?}")]
    NoResults(String),
    #[error("page parsing failed: {0}")]
    Parse(String),
}

fn rate_limited_message(retry_after: Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!("rate limited, retry after {:.1}s", d.as_secs_f64()),
        None => "rate limited".to_string(),
    }
}
