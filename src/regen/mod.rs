//! Best-effort regeneration requests for the external embedding pipeline.
//!
//! The coordinator hands a [`RegenerationRequest`] to a [`Regenerate`]
//! implementation only after the owning batch has committed. Dispatch never
//! reports failure back to the caller.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::model::SourceRef;

pub mod render;
pub mod webhook;

pub use webhook::{Envelope, WebhookDispatcher};

/// Canonical text plus metadata for one source entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegenerationRequest {
    #[serde(skip)]
    source: SourceRef,
    /// Multi-line rendering embedded by the pipeline.
    pub text: String,
    /// Tags written alongside the resulting vectors.
    pub metadata: Map<String, Value>,
}

impl RegenerationRequest {
    /// Wraps rendered content for `source`.
    pub fn new(source: SourceRef, text: String, metadata: Map<String, Value>) -> Self {
        Self {
            source,
            text,
            metadata,
        }
    }

    /// Entity this request regenerates.
    pub fn source(&self) -> &SourceRef {
        &self.source
    }
}

/// Sink for regeneration requests.
#[async_trait]
pub trait Regenerate: Send + Sync {
    /// Queues `request` without waiting for the pipeline.
    fn dispatch(&self, request: RegenerationRequest);

    /// Waits for queued requests to settle. Used on shutdown.
    async fn drain(&self) {}
}

/// Dispatcher used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledDispatcher;

#[async_trait]
impl Regenerate for DisabledDispatcher {
    fn dispatch(&self, request: RegenerationRequest) {
        tracing::debug!(source = %request.source(), "regeneration disabled; dropping request");
    }
}
