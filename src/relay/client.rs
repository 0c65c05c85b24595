//! HTTP client for the relay's REST surface.
//!
//! Task calls go to the relay's `/tasks` routes so every agent works against
//! the relay's single task store.

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::hub::{AgentInfo, HubStats, InboxAck};
use super::submit::{SendRequest, SubmitReceipt};
use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::tasks::{
    AckOutcome, AckResult, BroadcastRollup, ListFilter, SendTaskRequest, SendTaskResult, Task,
    TaskView,
};

/// Request timeout for one-shot calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct AgentsResponse {
    agents: Vec<AgentInfo>,
}

#[derive(Deserialize)]
struct InboxResponse {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct TasksResponse {
    tasks: Vec<TaskView>,
}

pub struct RelayClient {
    client: Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST /send
    pub async fn send(&self, request: &SendRequest) -> Result<SubmitReceipt> {
        request.validate()?;
        let response = self
            .client
            .post(format!("{}/send", self.base_url))
            .json(request)
            .send()
            .await?;
        Self::read(response).await
    }

    /// GET /agents
    pub async fn agents(&self) -> Result<Vec<AgentInfo>> {
        let response = self
            .client
            .get(format!("{}/agents", self.base_url))
            .send()
            .await?;
        let body: AgentsResponse = Self::read(response).await?;
        Ok(body.agents)
    }

    /// GET /stats
    pub async fn stats(&self) -> Result<HubStats> {
        let response = self
            .client
            .get(format!("{}/stats", self.base_url))
            .send()
            .await?;
        Self::read(response).await
    }

    /// GET /inbox/:agent_id
    pub async fn inbox(&self, agent_id: &str) -> Result<Vec<Message>> {
        let response = self
            .client
            .get(format!("{}/inbox/{}", self.base_url, agent_id.trim()))
            .send()
            .await?;
        let body: InboxResponse = Self::read(response).await?;
        Ok(body.messages)
    }

    /// POST /inbox/:agent_id/ack. `None` drains the whole queue.
    pub async fn ack_inbox(&self, agent_id: &str, message_ids: Option<&[String]>) -> Result<InboxAck> {
        let response = self
            .client
            .post(format!("{}/inbox/{}/ack", self.base_url, agent_id.trim()))
            .json(&json!({ "messageIds": message_ids }))
            .send()
            .await?;
        Self::read(response).await
    }

    /// POST /tasks
    pub async fn send_task(&self, request: &SendTaskRequest) -> Result<SendTaskResult> {
        let response = self
            .client
            .post(format!("{}/tasks", self.base_url))
            .json(request)
            .send()
            .await?;
        Self::read(response).await
    }

    /// GET /tasks
    pub async fn list_tasks(&self, filter: &ListFilter) -> Result<Vec<TaskView>> {
        let response = self
            .client
            .get(format!("{}/tasks", self.base_url))
            .query(filter)
            .send()
            .await?;
        let body: TasksResponse = Self::read(response).await?;
        Ok(body.tasks)
    }

    /// GET /tasks/:id
    pub async fn get_task(&self, task_id: &str) -> Result<TaskView> {
        let response = self.client.get(self.task_url(task_id, "")?).send().await?;
        Self::read(response).await
    }

    /// POST /tasks/:id/claim
    pub async fn claim_task(&self, task_id: &str, agent: Option<&str>) -> Result<Task> {
        let response = self
            .client
            .post(self.task_url(task_id, "/claim")?)
            .json(&json!({ "agent": agent }))
            .send()
            .await?;
        Self::read(response).await
    }

    /// POST /tasks/:id/ack
    pub async fn acknowledge_task(
        &self,
        task_id: &str,
        outcome: AckOutcome,
        summary: &str,
        agent: Option<&str>,
    ) -> Result<AckResult> {
        if summary.trim().is_empty() {
            return Err(Error::validation("summary is required"));
        }
        let response = self
            .client
            .post(self.task_url(task_id, "/ack")?)
            .json(&json!({ "status": outcome, "summary": summary, "agent": agent }))
            .send()
            .await?;
        Self::read(response).await
    }

    /// GET /tasks/:id/rollup
    pub async fn broadcast_rollup(&self, task_id: &str) -> Result<BroadcastRollup> {
        let response = self
            .client
            .get(self.task_url(task_id, "/rollup")?)
            .send()
            .await?;
        Self::read(response).await
    }

    fn task_url(&self, task_id: &str, action: &str) -> Result<String> {
        let task_id = task_id.trim();
        if task_id.is_empty() {
            return Err(Error::validation("taskId is required"));
        }
        Ok(format!("{}/tasks/{}{}", self.base_url, task_id, action))
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        match status {
            StatusCode::BAD_REQUEST => Err(Error::Validation(message)),
            s if s.is_server_error() => Err(Error::Transport(format!(
                "relay returned {}: {}",
                status, message
            ))),
            _ => Err(Error::Rejected {
                status: status.as_u16(),
                message,
            }),
        }
    }
}
