//! Secondary browsing contexts and their owner-side handle.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::dom::LiveDocument;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("failed to open {url}: {message}")]
    OpenFailed { url: String, message: String },
    #[error("{url} answered {status}")]
    Status { url: String, status: String },
}

/// An opened browsing context with its own document.
pub trait BrowsingContext: Send + Sync {
    fn document(&self) -> &LiveDocument;

    /// Cancelled once the context is closed, by its owner or by itself.
    fn closed(&self) -> CancellationToken;

    /// Close the context. Closing twice has no further effect.
    fn close(&self);
}

/// Opens secondary contexts. `open` resolves once the initial load is done.
pub trait ContextOpener: Send + Sync {
    fn open<'a>(
        &'a self,
        url: &'a Url,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn BrowsingContext>, ContextError>> + Send + 'a>>;
}

/// Owner-side handle. Closes the context when dropped.
pub struct ContextHandle {
    context: Arc<dyn BrowsingContext>,
}

impl ContextHandle {
    pub fn new(context: Arc<dyn BrowsingContext>) -> Self {
        Self { context }
    }

    pub fn document(&self) -> &LiveDocument {
        self.context.document()
    }

    pub fn is_closed(&self) -> bool {
        self.context.closed().is_cancelled()
    }

    /// Run `script` inside the context. The script is abandoned when the
    /// context closes.
    pub fn inject<F>(&self, script: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let closed = self.context.closed();
        tokio::spawn(async move {
            tokio::select! {
                () = closed.cancelled() => {
                    tracing::debug!("context closed before the injected script finished");
                }
                () = script => {}
            }
        });
    }

    pub fn close(&self) {
        self.context.close();
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        self.context.close();
    }
}
