//! Task dispatchers.
//!
//! | Mode     | Delivery                                               |
//! |----------|--------------------------------------------------------|
//! | `inline` | awaits the executor in process                         |
//! | `http`   | POSTs the request to `<base_url>/automation/task`      |
//!
//! HTTP delivery is at-least-once; the executor's guard absorbs duplicates.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use super::models::TaskRequest;
use super::task::TaskExecutor;
use crate::errors::{AutomationError, Result};

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn enqueue(&self, request: &TaskRequest) -> Result<()>;
}

pub struct InlineDispatcher {
    executor: Arc<TaskExecutor>,
}

impl InlineDispatcher {
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl TaskDispatcher for InlineDispatcher {
    async fn enqueue(&self, request: &TaskRequest) -> Result<()> {
        let report = self.executor.run_task(request).await?;
        debug!(account = %request.billing_account_id, ?report, "inline task finished");
        Ok(())
    }
}

pub struct HttpDispatcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDispatcher {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/automation/task", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TaskDispatcher for HttpDispatcher {
    async fn enqueue(&self, request: &TaskRequest) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .context("Failed to send task request")
            .and_then(|resp| {
                resp.error_for_status()
                    .context("Task endpoint returned error status")
            })
            .map_err(|e| AutomationError::collaborator("task dispatcher", e))?;
        debug!(account = %request.billing_account_id, endpoint = %self.endpoint, "task request delivered");
        Ok(())
    }
}
