//! Finalization dispatcher: delivers the finished interview downstream.
//!
//! Delivery is a single best-effort POST. Failures are logged and swallowed;
//! nothing is retried and the session is never reopened. Background
//! deliveries are tracked so shutdown can wait for them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{Client, IntakeRecord, Session};
use crate::error::DispatchError;
use crate::store::Database;

/// Latest structured intake answers, as the automation workflow expects them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseReport {
    pub needs: Option<String>,
    pub current_sns: Option<String>,
    pub target_goal: Option<String>,
    pub product_summary: Option<String>,
    pub usp: Option<String>,
    pub brand_story: Option<String>,
}

impl From<&IntakeRecord> for PulseReport {
    fn from(record: &IntakeRecord) -> Self {
        Self {
            needs: record.problem.clone(),
            current_sns: record.current_sns.clone(),
            target_goal: record.target.clone(),
            product_summary: record.product_summary.clone(),
            usp: record.strengths_usp.clone(),
            brand_story: record.brand_story.clone(),
        }
    }
}

/// Body POSTed to the touchpoint webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchpointPayload {
    pub client_id: String,
    pub client_name: Option<String>,
    pub industry: Option<String>,
    pub session_id: Uuid,
    pub final_report: Option<String>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub pulse_report: PulseReport,
}

impl TouchpointPayload {
    pub fn build(
        session: &Session,
        client: Option<&Client>,
        record: Option<&IntakeRecord>,
    ) -> Self {
        Self {
            client_id: session.client_id.clone(),
            client_name: client.map(|c| c.name.clone()),
            industry: client.map(|c| c.industry.clone()),
            session_id: session.id,
            final_report: session.final_report.clone(),
            finalized_at: session.finalized_at,
            pulse_report: record.map(PulseReport::from).unwrap_or_default(),
        }
    }
}

/// Destination for finalized reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, payload: &TouchpointPayload) -> Result<(), DispatchError>;
}

/// POSTs the payload as JSON to a webhook URL.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Request(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ReportSink for WebhookSink {
    async fn deliver(&self, payload: &TouchpointPayload) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| DispatchError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::HttpStatus {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Fires once per finalized session. A dispatcher without a sink is a no-op.
pub struct FinalizationDispatcher {
    sink: Option<Arc<dyn ReportSink>>,
    in_flight: Mutex<JoinSet<()>>,
}

impl FinalizationDispatcher {
    pub fn new(sink: Option<Arc<dyn ReportSink>>) -> Self {
        Self {
            sink,
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    /// Dispatcher posting to `webhook_url`, or a no-op one when unset.
    pub fn from_webhook(
        webhook_url: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let Some(url) = webhook_url else {
            info!("No touchpoint webhook configured; finalization dispatch disabled");
            return Ok(Self::new(None));
        };
        let sink = WebhookSink::new(url, timeout)?;
        info!(url, "Touchpoint webhook configured");
        Ok(Self::new(Some(Arc::new(sink))))
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Build the payload and deliver it once. Never fails.
    pub async fn dispatch(
        &self,
        session: &Session,
        client: Option<&Client>,
        record: Option<&IntakeRecord>,
    ) {
        let Some(sink) = &self.sink else {
            return;
        };

        let payload = TouchpointPayload::build(session, client, record);
        match sink.deliver(&payload).await {
            Ok(()) => info!(
                session_id = %session.id,
                client_id = %session.client_id,
                "Report dispatched"
            ),
            Err(e) => warn!(
                session_id = %session.id,
                client_id = %session.client_id,
                error = %e,
                "Report dispatch failed"
            ),
        }
    }

    /// Read the client data for `session` and dispatch in the background.
    ///
    /// Returns `false` when disabled. Lookup failures are logged and the
    /// payload is sent with whatever could be read.
    pub fn spawn(self: &Arc<Self>, db: Arc<dyn Database>, session: Session) -> bool {
        if !self.is_enabled() {
            debug!(session_id = %session.id, "Dispatch skipped: no sink");
            return false;
        }

        let dispatcher = Arc::clone(self);
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            let client = db
                .get_client(&session.client_id)
                .await
                .unwrap_or_else(|e| {
                    warn!(client_id = %session.client_id, error = %e, "Client lookup failed");
                    None
                });
            let record = db
                .get_latest_intake_record(&session.client_id)
                .await
                .unwrap_or_else(|e| {
                    warn!(
                        client_id = %session.client_id,
                        error = %e,
                        "Intake record lookup failed"
                    );
                    None
                });
            dispatcher
                .dispatch(&session, client.as_ref(), record.as_ref())
                .await;
        });
        true
    }

    /// Number of background deliveries not yet finished.
    pub fn pending(&self) -> usize {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        while in_flight.try_join_next().is_some() {}
        in_flight.len()
    }

    /// Wait up to `timeout` for background deliveries; abort the rest.
    pub async fn drain(&self, timeout: Duration) {
        let mut tasks = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *in_flight)
        };
        if tasks.is_empty() {
            return;
        }

        info!(pending = tasks.len(), "Waiting for in-flight report dispatches");
        let finished = tokio::time::timeout(timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Report dispatch task failed");
                }
            }
        })
        .await;

        if finished.is_err() {
            warn!(
                abandoned = tasks.len(),
                timeout = ?timeout,
                "Report dispatches still in flight at shutdown"
            );
            tasks.shutdown().await;
        }
    }
}
