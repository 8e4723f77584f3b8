use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::JobService;
use super::error::ServiceError;
use super::types::{
    CreateMessageRequest, CreateRunRequest, JobSnapshot, MessageList, Run, Thread,
    TranscriptMessage,
};
use crate::model::PartialOutput;

/// [`JobService`] over the threads/messages/runs JSON REST API.
pub struct HttpJobService {
    api_key: String,
    client: Client,
    base_url: String,
}

impl HttpJobService {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            api_key: api_key.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        decode(check(response).await?).await
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ServiceError> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        decode(check(response).await?).await
    }

    async fn messages(&self, handle: &str, order: &str) -> Result<MessageList, ServiceError> {
        self.get(&format!("/threads/{handle}/messages?order={order}&limit=100"))
            .await
    }
}

/// Maps non-success statuses onto [`ServiceError`].
async fn check(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(1000);
        return Err(ServiceError::RateLimited {
            retry_after_ms: retry_after,
        });
    }

    if status == StatusCode::NOT_FOUND {
        let path = response.url().path().to_string();
        return Err(ServiceError::NotFound(path));
    }

    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(ServiceError::Api {
            status: status.as_u16(),
            message,
        });
    }

    Ok(response)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ServiceError::Decode(e.to_string()))
}

impl JobService for HttpJobService {
    async fn create_session(&self) -> Result<String, ServiceError> {
        let thread: Thread = self.post("/threads", &serde_json::json!({})).await?;
        Ok(thread.id)
    }

    async fn post_message(&self, handle: &str, text: &str) -> Result<(), ServiceError> {
        let body = CreateMessageRequest {
            role: "user".into(),
            content: text.into(),
        };
        let _: serde_json::Value = self
            .post(&format!("/threads/{handle}/messages"), &body)
            .await?;
        Ok(())
    }

    async fn submit_job(&self, handle: &str, agent: &str) -> Result<JobSnapshot, ServiceError> {
        let body = CreateRunRequest {
            assistant_id: agent.into(),
        };
        let run: Run = self.post(&format!("/threads/{handle}/runs"), &body).await?;
        Ok(run.into())
    }

    async fn poll_job(&self, handle: &str, job_id: &str) -> Result<JobSnapshot, ServiceError> {
        let run: Run = self.get(&format!("/threads/{handle}/runs/{job_id}")).await?;
        Ok(run.into())
    }

    async fn cancel_job(&self, handle: &str, job_id: &str) -> Result<(), ServiceError> {
        let _: serde_json::Value = self
            .post(
                &format!("/threads/{handle}/runs/{job_id}/cancel"),
                &serde_json::json!({}),
            )
            .await?;
        Ok(())
    }

    async fn get_latest_output(
        &self,
        handle: &str,
        job_id: &str,
    ) -> Result<PartialOutput, ServiceError> {
        let list = self.messages(handle, "desc").await?;
        Ok(list
            .data
            .iter()
            .find(|m| m.written_by(job_id))
            .map(PartialOutput::from)
            .unwrap_or_default())
    }

    async fn list_messages(&self, handle: &str) -> Result<Vec<TranscriptMessage>, ServiceError> {
        let list = self.messages(handle, "asc").await?;
        Ok(list.data.iter().map(TranscriptMessage::from).collect())
    }

    async fn session_exists(&self, handle: &str) -> Result<bool, ServiceError> {
        match self.get::<Thread>(&format!("/threads/{handle}")).await {
            Ok(_) => Ok(true),
            Err(ServiceError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
