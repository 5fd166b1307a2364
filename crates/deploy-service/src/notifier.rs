//! Client for the external ledger
//!
//! Status changes and test reports are pushed here. Delivery is best effort:
//! the orchestrator never waits on the ledger and only logs failures. Status
//! updates go through a single queue so the ledger sees them in order.

use crate::tester::TestSuiteReport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paygate_common::{DeployedResource, ResourceStatus};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Status snapshot pushed after every persisted transition
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub resource_id: String,
    pub status: ResourceStatus,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub public_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn from_resource(resource: &DeployedResource) -> Self {
        Self {
            resource_id: resource.id().to_string(),
            status: resource.status,
            healthy: resource.healthy,
            container_id: resource.container_id.clone(),
            public_url: resource.public_url.clone(),
            error: resource.error.clone(),
            timestamp: resource.updated_at,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn resource_status(&self, update: StatusUpdate) -> Result<()>;

    async fn test_results(&self, report: TestSuiteReport) -> Result<()>;
}

/// Posts to `{base_url}/api/resources/{id}/status` and `/tests`
pub struct HttpNotifier {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build ledger HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    async fn post<T: Serialize + Sync>(&self, url: String, body: &T) -> Result<()> {
        debug!("Posting to ledger: {}", url);

        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.context("Ledger request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Ledger rejected {}: {}", url, response.status());
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn resource_status(&self, update: StatusUpdate) -> Result<()> {
        let url = format!("{}/api/resources/{}/status", self.base_url, update.resource_id);
        self.post(url, &update).await
    }

    async fn test_results(&self, report: TestSuiteReport) -> Result<()> {
        let url = format!("{}/api/resources/{}/tests", self.base_url, report.resource_id);
        self.post(url, &report).await
    }
}

/// Used when no ledger is configured
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn resource_status(&self, _update: StatusUpdate) -> Result<()> {
        Ok(())
    }

    async fn test_results(&self, _report: TestSuiteReport) -> Result<()> {
        Ok(())
    }
}

/// Delivers status updates to a [`Notifier`] one at a time, in the order
/// they were queued. Queuing never blocks.
#[derive(Clone)]
pub struct StatusQueue {
    tx: mpsc::UnboundedSender<StatusUpdate>,
}

impl StatusQueue {
    /// Start the delivery task. Must be called inside a tokio runtime.
    pub fn spawn(notifier: Arc<dyn Notifier>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<StatusUpdate>();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let id = update.resource_id.clone();
                if let Err(e) = notifier.resource_status(update).await {
                    warn!(resource_id = %id, "Failed to push status to ledger: {:#}", e);
                }
            }
            debug!("Status queue closed");
        });
        Self { tx }
    }

    pub fn push(&self, update: StatusUpdate) {
        if self.tx.send(update).is_err() {
            warn!("Status queue closed, dropping update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use paygate_common::ResourceConfig;
    use std::sync::Mutex;

    fn resource() -> DeployedResource {
        let config: ResourceConfig = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "name": "Quotes",
            "creatorWallet": "0x1111111111111111111111111111111111111111"
        }))
        .unwrap();
        DeployedResource::new(config, "paygate.dev")
    }

    #[test]
    fn test_status_update_wire_format() {
        let mut resource = resource();
        resource.mark_running("c1".to_string());

        let value = serde_json::to_value(StatusUpdate::from_resource(&resource)).unwrap();
        assert_eq!(value["resourceId"], "abc");
        assert_eq!(value["status"], "running");
        assert_eq!(value["containerId"], "c1");
        assert_eq!(value["publicUrl"], "https://abc.paygate.dev");
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn test_http_notifier_posts_with_bearer_token() {
        let seen: Arc<Mutex<Vec<(String, Option<String>)>>> = Arc::default();
        let recorded = seen.clone();

        let app = Router::new().route(
            "/api/resources/{id}/status",
            post(move |Path(id): Path<String>, headers: HeaderMap, Json(_body): Json<serde_json::Value>| {
                let recorded = recorded.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    recorded.lock().unwrap().push((id, auth));
                    StatusCode::NO_CONTENT
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let notifier = HttpNotifier::new(format!("http://{}/", addr), Some("secret".to_string())).unwrap();
        notifier
            .resource_status(StatusUpdate::from_resource(&resource()))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "abc");
        assert_eq!(seen[0].1.as_deref(), Some("Bearer secret"));
    }

    #[tokio::test]
    async fn test_http_notifier_reports_rejection() {
        let app = Router::new().route(
            "/api/resources/{id}/status",
            post(|| async { StatusCode::UNAUTHORIZED }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let notifier = HttpNotifier::new(format!("http://{}", addr), None).unwrap();
        let result = notifier
            .resource_status(StatusUpdate::from_resource(&resource()))
            .await;
        assert!(result.is_err());
    }

    /// Earlier updates take longer to deliver
    struct SlowFirstNotifier {
        seen: Mutex<Vec<ResourceStatus>>,
    }

    #[async_trait]
    impl Notifier for SlowFirstNotifier {
        async fn resource_status(&self, update: StatusUpdate) -> Result<()> {
            let delay = match update.status {
                ResourceStatus::Pending => 60,
                ResourceStatus::Building => 30,
                _ => 0,
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.seen.lock().unwrap().push(update.status);
            Ok(())
        }

        async fn test_results(&self, _report: TestSuiteReport) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_status_queue_preserves_order() {
        let notifier = Arc::new(SlowFirstNotifier {
            seen: Mutex::new(Vec::new()),
        });
        let queue = StatusQueue::spawn(notifier.clone());

        let mut resource = resource();
        for status in [ResourceStatus::Pending, ResourceStatus::Building, ResourceStatus::Running] {
            resource.transition(status);
            queue.push(StatusUpdate::from_resource(&resource));
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            *notifier.seen.lock().unwrap(),
            vec![ResourceStatus::Pending, ResourceStatus::Building, ResourceStatus::Running]
        );
    }
}
