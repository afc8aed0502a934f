//! HTTP webhook dispatcher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::ValueEnum;
use reqwest::Client;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use url::Url;

use super::{Regenerate, RegenerationRequest};

/// Body layout expected by the receiving workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Envelope {
    /// `{text, metadata}`.
    #[default]
    Bare,
    /// `{json: {text, metadata}}`, as n8n webhook nodes receive items.
    N8n,
}

/// Posts regeneration requests to a webhook on background tasks.
///
/// At most `max_in_flight` requests run concurrently; further dispatches wait
/// on their own task without blocking the caller. Every spawned task is
/// tracked from the moment of dispatch, so [`Regenerate::drain`] also waits
/// for requests that have not started yet.
#[derive(Clone)]
pub struct WebhookDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    endpoint: Url,
    envelope: Envelope,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    max_in_flight: usize,
    timeout: Duration,
}

impl WebhookDispatcher {
    /// Builds a dispatcher posting to `endpoint`.
    pub fn new(
        endpoint: Url,
        envelope: Envelope,
        timeout: Duration,
        max_in_flight: usize,
    ) -> Result<Self> {
        let max_in_flight = max_in_flight.max(1);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                endpoint,
                envelope,
                permits: Arc::new(Semaphore::new(max_in_flight)),
                tasks: TaskTracker::new(),
                max_in_flight,
                timeout,
            }),
        })
    }

    /// Target endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    /// Posts one request and waits for the response status.
    pub async fn send(&self, request: &RegenerationRequest) -> Result<()> {
        let payload = serde_json::to_value(request)?;
        let body = match self.inner.envelope {
            Envelope::Bare => payload,
            Envelope::N8n => json!({ "json": payload }),
        };
        let response = self
            .inner
            .client
            .post(self.inner.endpoint.clone())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("webhook request for {} failed", request.source()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            anyhow::bail!("webhook rejected {} ({}): {}", request.source(), status, text);
        }
        Ok(())
    }
}

#[async_trait]
impl Regenerate for WebhookDispatcher {
    fn dispatch(&self, request: RegenerationRequest) {
        let dispatcher = self.clone();
        self.inner.tasks.spawn(async move {
            let Ok(_permit) = dispatcher.inner.permits.clone().acquire_owned().await else {
                tracing::warn!(source = %request.source(), "dispatcher closed; dropping request");
                return;
            };
            match dispatcher.send(&request).await {
                Ok(()) => tracing::debug!(source = %request.source(), "regeneration dispatched"),
                Err(err) => tracing::warn!(
                    source = %request.source(),
                    error = %format!("{err:#}"),
                    "regeneration dispatch failed"
                ),
            }
        });
    }

    async fn drain(&self) {
        let inner = &self.inner;
        inner.tasks.close();
        let pending = inner.tasks.len();
        if pending == 0 {
            return;
        }
        // each request is bounded by the client timeout and runs max_in_flight at a time
        let rounds = u32::try_from(pending.div_ceil(inner.max_in_flight)).unwrap_or(u32::MAX);
        let deadline = inner
            .timeout
            .saturating_mul(rounds)
            .saturating_add(Duration::from_secs(1));
        tracing::info!(pending, "waiting for queued regeneration requests");
        match tokio::time::timeout(deadline, inner.tasks.wait()).await {
            Ok(()) => tracing::debug!(pending, "regeneration queue drained"),
            Err(_) => tracing::warn!(
                abandoned = inner.tasks.len(),
                "timed out waiting for regeneration requests; abandoning the rest"
            ),
        }
    }
}
