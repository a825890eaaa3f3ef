//! Webhook notification when a task needs a human
//!
//! Delivery is fire-and-forget: the control loop never waits on the webhook
//! and a failed POST is only logged.

use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::phase::Phase;
use crate::task::TaskRecord;

/// JSON body posted to the webhook
#[derive(Debug, Clone, Serialize)]
pub struct WaitingNotice {
    pub task_id: String,
    pub name: String,
    pub phase: Phase,
    pub reason: Option<String>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: String,
}

impl WaitingNotice {
    pub fn new(task: &TaskRecord, phase: Phase) -> Self {
        Self {
            task_id: task.id.clone(),
            name: task.name.clone(),
            phase,
            reason: task.last_error.clone(),
            kind: "task_waiting",
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notifier {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl Notifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Notifier for the configured URL, if any
    pub fn from_url(url: Option<&str>) -> Option<Self> {
        url.filter(|u| !u.trim().is_empty()).map(Self::new)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Post the notice in the background. Must be called inside a tokio runtime.
    pub fn task_waiting(&self, task: &TaskRecord, phase: Phase) {
        let notice = WaitingNotice::new(task, phase);
        let client = self.client.clone();
        let url = self.url.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            match client.post(&url).json(&notice).timeout(timeout).send().await {
                Ok(resp) => info!(
                    task_id = %notice.task_id,
                    status = %resp.status(),
                    "Webhook notification sent"
                ),
                Err(e) => warn!(task_id = %notice.task_id, "Webhook notification failed: {e}"),
            }
        });
    }
}
