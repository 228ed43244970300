use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod batch;
pub mod channel;
pub mod citation;
pub mod clipboard;
pub mod config_file;
pub mod context;
pub mod cross_window;
pub mod dom;
pub mod layout;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod observer;
pub mod page;
pub mod proxy;
pub mod registry;
pub mod secondary;
pub mod single;
pub mod trigger;
pub mod watch;

// Re-export for convenience
pub use batch::{BatchItemResult, BatchJob, run_batch};
pub use citation::CitationSummary;
pub use clipboard::ClipboardWriter;
pub use cross_window::CrossWindowFlow;
pub use dom::{LiveDocument, NodeId, NodeSpec, Selector};
pub use layout::PageLayout;
pub use page::ResultPage;
pub use proxy::{FetchProxy, FetchProxyClient, ProxyRequest, ProxyResponse};
pub use single::SingleItemFlow;

/// Default time the link observer waits for the citation link to render.
pub const DEFAULT_OBSERVE_TIMEOUT: Duration = Duration::from_millis(3000);
/// Extra time the opener grants a secondary context on top of the observe timeout.
pub const DEFAULT_LOAD_SLACK: Duration = Duration::from_millis(2000);
/// Delay between the start of consecutive batch items.
pub const DEFAULT_BATCH_STAGGER: Duration = Duration::from_millis(2000);
pub const DEFAULT_BASE_URL: &str = "https://scholar.google.com";
/// Sustained request rate. A staggered batch item makes three requests
/// (results page, cite fragment, citation file) every stagger period.
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 2;

/// What to extract a citation for.
#[derive(Debug, Clone)]
pub enum CitationRequest {
    /// An on-page citation trigger tied to one visible result.
    ByElement {
        document: LiveDocument,
        trigger: NodeId,
    },
    /// A free-text query that needs its own browsing context.
    ByQuery { text: String },
}

/// Route a request to the flow that handles its kind.
pub async fn extract(
    request: CitationRequest,
    single: &SingleItemFlow,
    cross: &CrossWindowFlow,
) -> ExtractionOutcome {
    match request {
        CitationRequest::ByElement { document, trigger } => single.run(&document, trigger).await,
        CitationRequest::ByQuery { text } => cross.run(&text).await,
    }
}

/// Why an extraction did not produce a citation body.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail")]
pub enum FailureReason {
    #[error("timed out waiting for the BibTeX link")]
    TimedOut,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("citation not available: {0}")]
    NotFound(String),
    #[error("no citation trigger found")]
    NoTriggerFound,
}

/// Terminal result of one extraction. Consumed exactly once by the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum ExtractionOutcome {
    Success { body: String },
    Failure { reason: FailureReason },
}

impl ExtractionOutcome {
    pub fn success(body: impl Into<String>) -> Self {
        ExtractionOutcome::Success { body: body.into() }
    }

    pub fn failure(reason: FailureReason) -> Self {
        ExtractionOutcome::Failure { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExtractionOutcome::Success { .. })
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            ExtractionOutcome::Success { body } => Some(body),
            ExtractionOutcome::Failure { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&FailureReason> {
        match self {
            ExtractionOutcome::Success { .. } => None,
            ExtractionOutcome::Failure { reason } => Some(reason),
        }
    }
}

/// States of a single extraction flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Triggering,
    Watching,
    Fetching,
    Delivering,
    Done,
    Errored(FailureReason),
}

/// Identifies which flow instance an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlowSource {
    /// On-page result item, keyed by its citation trigger.
    Item(NodeId),
    /// Free-text query run in a secondary context.
    Query(String),
}

impl std::fmt::Display for FlowSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowSource::Item(node) => write!(f, "item {}", node),
            FlowSource::Query(q) => write!(f, "\"{}\"", q),
        }
    }
}

/// Notifications emitted to the presentation layer.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    StateChanged {
        source: FlowSource,
        state: FlowState,
    },
    /// A result item was discovered and attached to a flow.
    ItemWired { item: NodeId, trigger: NodeId },
    Succeeded {
        source: FlowSource,
        summary: CitationSummary,
        /// Name of the clipboard strategy that accepted the text, if any did.
        delivered_via: Option<String>,
    },
    Failed {
        source: FlowSource,
        reason: FailureReason,
    },
}

/// Callback receiving [`FlowEvent`]s.
pub type Notifier = Arc<dyn Fn(FlowEvent) + Send + Sync>;

/// A notifier that drops every event.
pub fn silent_notifier() -> Notifier {
    Arc::new(|_| {})
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("invalid link label pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Runtime configuration for the extraction pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    pub observe_timeout: Duration,
    pub load_slack: Duration,
    pub batch_stagger: Duration,
    pub base_url: String,
    pub user_agent: String,
    pub requests_per_second: u32,
    /// Clipboard strategies in fallback order ("system", "command", "memory").
    pub clipboard_strategies: Vec<String>,
    /// If set, deliver citations to this file instead of the clipboard.
    pub output_path: Option<std::path::PathBuf>,
    pub layout: PageLayout,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            observe_timeout: DEFAULT_OBSERVE_TIMEOUT,
            load_slack: DEFAULT_LOAD_SLACK,
            batch_stagger: DEFAULT_BATCH_STAGGER,
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: format!("citegrab/{}", env!("CARGO_PKG_VERSION")),
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            clipboard_strategies: vec!["system".into(), "command".into(), "memory".into()],
            output_path: None,
            layout: PageLayout::scholar(),
        }
    }
}

impl Config {
    /// Deadline the opener allows a secondary context to report back.
    pub fn cross_window_deadline(&self) -> Duration {
        self.observe_timeout + self.load_slack
    }

    /// Apply values from a parsed config file over the current values.
    pub fn apply_file(&mut self, file: &config_file::ConfigFile) -> Result<(), CoreError> {
        if let Some(timing) = &file.timing {
            if let Some(ms) = timing.observe_timeout_ms {
                self.observe_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = timing.load_slack_ms {
                self.load_slack = Duration::from_millis(ms);
            }
            if let Some(ms) = timing.batch_stagger_ms {
                self.batch_stagger = Duration::from_millis(ms);
            }
        }
        if let Some(scholar) = &file.scholar {
            if let Some(base) = &scholar.base_url {
                url::Url::parse(base)?;
                self.base_url = base.clone();
            }
            if let Some(ua) = &scholar.user_agent {
                self.user_agent = ua.clone();
            }
            if let Some(rps) = scholar.requests_per_second {
                self.requests_per_second = rps.max(1);
            }
        }
        if let Some(clipboard) = &file.clipboard {
            if let Some(strategies) = &clipboard.strategies {
                self.clipboard_strategies = strategies.clone();
            }
            if let Some(path) = &clipboard.output_path {
                self.output_path = Some(path.into());
            }
        }
        if let Some(layout) = &file.layout {
            self.layout = self.layout.clone().with_overrides(layout)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config_file::{ConfigFile, LayoutConfig, ScholarConfig, TimingConfig};

    #[test]
    fn defaults_match_reference_timing() {
        let config = Config::default();
        assert_eq!(config.observe_timeout, Duration::from_millis(3000));
        assert_eq!(config.batch_stagger, Duration::from_millis(2000));
        assert_eq!(config.cross_window_deadline(), Duration::from_millis(5000));
    }

    #[test]
    fn file_values_override_defaults() {
        let file = ConfigFile {
            timing: Some(TimingConfig {
                observe_timeout_ms: Some(1500),
                load_slack_ms: None,
                batch_stagger_ms: Some(500),
            }),
            scholar: Some(ScholarConfig {
                base_url: Some("https://scholar.example.org".into()),
                user_agent: None,
                requests_per_second: Some(0),
            }),
            clipboard: None,
            layout: Some(LayoutConfig {
                trigger: Some(".cite-button".into()),
                ..LayoutConfig::default()
            }),
        };
        let mut config = Config::default();
        config.apply_file(&file).unwrap();

        assert_eq!(config.observe_timeout, Duration::from_millis(1500));
        assert_eq!(config.load_slack, DEFAULT_LOAD_SLACK);
        assert_eq!(config.batch_stagger, Duration::from_millis(500));
        assert_eq!(config.base_url, "https://scholar.example.org");
        assert_eq!(config.requests_per_second, 1);
        assert_eq!(config.layout.trigger.to_string(), ".cite-button");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let file = ConfigFile {
            scholar: Some(ScholarConfig {
                base_url: Some("not a url".into()),
                ..ScholarConfig::default()
            }),
            ..ConfigFile::default()
        };
        let mut config = Config::default();
        assert!(matches!(
            config.apply_file(&file),
            Err(CoreError::InvalidUrl(_))
        ));
    }

    #[test]
    fn outcome_accessors() {
        let ok = ExtractionOutcome::success("@article{a}");
        assert!(ok.is_success());
        assert_eq!(ok.body(), Some("@article{a}"));
        assert!(ok.reason().is_none());

        let err = ExtractionOutcome::failure(FailureReason::TimedOut);
        assert!(!err.is_success());
        assert_eq!(err.reason(), Some(&FailureReason::TimedOut));
    }

    #[test]
    fn failure_reason_serializes_with_tag() {
        let json = serde_json::to_string(&FailureReason::NetworkError("boom".into())).unwrap();
        assert_eq!(json, r#"{"reason":"NetworkError","detail":"boom"}"#);
        let back: FailureReason = serde_json::from_str(r#"{"reason":"TimedOut"}"#).unwrap();
        assert_eq!(back, FailureReason::TimedOut);
    }
}
