//! Client for the remote HTTP/JSON API.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tend_proto::{
    ApiErrorBody, Favorite, FavoriteToggle, MoodCheckIn, MoodEntry, MoodStats, Project,
    ProjectDraft, Task, TaskDraft,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("no server configured")]
    NotConfigured,
}

impl ApiError {
    /// Whether the same request may succeed later.
    ///
    /// Connection problems, timeouts, 5xx, 408 and 429 are retryable;
    /// other rejections will fail the same way every time. A missing server
    /// counts as retryable so writes stay queued until one is configured.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(e) => !(e.is_decode() || e.is_builder()),
            ApiError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            ApiError::NotConfigured => true,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn submit_mood(&self, check_in: &MoodCheckIn) -> ApiResult<MoodEntry>;
    async fn list_moods(&self) -> ApiResult<Vec<MoodEntry>>;
    async fn mood_stats(&self) -> ApiResult<MoodStats>;

    async fn set_favorite(&self, toggle: &FavoriteToggle) -> ApiResult<()>;
    async fn list_favorites(&self) -> ApiResult<Vec<Favorite>>;

    async fn create_task(&self, draft: &TaskDraft) -> ApiResult<Task>;
    async fn update_task(&self, id: i64, draft: &TaskDraft) -> ApiResult<Task>;
    async fn delete_task(&self, id: i64) -> ApiResult<()>;
    async fn list_tasks(&self) -> ApiResult<Vec<Task>>;

    async fn create_project(&self, draft: &ProjectDraft) -> ApiResult<Project>;
    async fn update_project(&self, id: i64, draft: &ProjectDraft) -> ApiResult<Project>;
    async fn delete_project(&self, id: i64) -> ApiResult<()>;
    async fn list_projects(&self) -> ApiResult<Vec<Project>>;
}

/// [`RemoteApi`] over reqwest.
#[derive(Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpApi {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> ApiResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> ApiResult<T> {
        let response = check(request.send().await?).await?;
        Ok(response.json::<T>().await?)
    }

    async fn send_empty(&self, request: RequestBuilder) -> ApiResult<()> {
        check(request.send().await?).await?;
        Ok(())
    }
}

async fn check(response: reqwest::Response) -> ApiResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or_else(|_| {
            if text.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string()
            } else {
                text
            }
        });
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn submit_mood(&self, check_in: &MoodCheckIn) -> ApiResult<MoodEntry> {
        self.send(self.request(Method::POST, "/api/mood").json(check_in))
            .await
    }

    async fn list_moods(&self) -> ApiResult<Vec<MoodEntry>> {
        self.send(self.request(Method::GET, "/api/mood")).await
    }

    async fn mood_stats(&self) -> ApiResult<MoodStats> {
        self.send(self.request(Method::GET, "/api/mood/stats")).await
    }

    async fn set_favorite(&self, toggle: &FavoriteToggle) -> ApiResult<()> {
        self.send_empty(self.request(Method::POST, "/api/favorites/toggle").json(toggle))
            .await
    }

    async fn list_favorites(&self) -> ApiResult<Vec<Favorite>> {
        self.send(self.request(Method::GET, "/api/favorites")).await
    }

    async fn create_task(&self, draft: &TaskDraft) -> ApiResult<Task> {
        self.send(self.request(Method::POST, "/api/tasks").json(draft))
            .await
    }

    async fn update_task(&self, id: i64, draft: &TaskDraft) -> ApiResult<Task> {
        self.send(
            self.request(Method::PUT, &format!("/api/tasks/{id}"))
                .json(draft),
        )
        .await
    }

    async fn delete_task(&self, id: i64) -> ApiResult<()> {
        match self
            .send_empty(self.request(Method::DELETE, &format!("/api/tasks/{id}")))
            .await
        {
            // already gone on the server
            Err(ApiError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(())
            }
            other => other,
        }
    }

    async fn list_tasks(&self) -> ApiResult<Vec<Task>> {
        self.send(self.request(Method::GET, "/api/tasks")).await
    }

    async fn create_project(&self, draft: &ProjectDraft) -> ApiResult<Project> {
        self.send(self.request(Method::POST, "/api/projects").json(draft))
            .await
    }

    async fn update_project(&self, id: i64, draft: &ProjectDraft) -> ApiResult<Project> {
        self.send(
            self.request(Method::PUT, &format!("/api/projects/{id}"))
                .json(draft),
        )
        .await
    }

    async fn delete_project(&self, id: i64) -> ApiResult<()> {
        match self
            .send_empty(self.request(Method::DELETE, &format!("/api/projects/{id}")))
            .await
        {
            Err(ApiError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(())
            }
            other => other,
        }
    }

    async fn list_projects(&self) -> ApiResult<Vec<Project>> {
        self.send(self.request(Method::GET, "/api/projects")).await
    }
}

/// Stand-in used when no server URL is configured; every call fails with
/// [`ApiError::NotConfigured`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOnlyApi;

#[async_trait]
impl RemoteApi for LocalOnlyApi {
    async fn submit_mood(&self, _: &MoodCheckIn) -> ApiResult<MoodEntry> {
        Err(ApiError::NotConfigured)
    }
    async fn list_moods(&self) -> ApiResult<Vec<MoodEntry>> {
        Err(ApiError::NotConfigured)
    }
    async fn mood_stats(&self) -> ApiResult<MoodStats> {
        Err(ApiError::NotConfigured)
    }
    async fn set_favorite(&self, _: &FavoriteToggle) -> ApiResult<()> {
        Err(ApiError::NotConfigured)
    }
    async fn list_favorites(&self) -> ApiResult<Vec<Favorite>> {
        Err(ApiError::NotConfigured)
    }
    async fn create_task(&self, _: &TaskDraft) -> ApiResult<Task> {
        Err(ApiError::NotConfigured)
    }
    async fn update_task(&self, _: i64, _: &TaskDraft) -> ApiResult<Task> {
        Err(ApiError::NotConfigured)
    }
    async fn delete_task(&self, _: i64) -> ApiResult<()> {
        Err(ApiError::NotConfigured)
    }
    async fn list_tasks(&self) -> ApiResult<Vec<Task>> {
        Err(ApiError::NotConfigured)
    }
    async fn create_project(&self, _: &ProjectDraft) -> ApiResult<Project> {
        Err(ApiError::NotConfigured)
    }
    async fn update_project(&self, _: i64, _: &ProjectDraft) -> ApiResult<Project> {
        Err(ApiError::NotConfigured)
    }
    async fn delete_project(&self, _: i64) -> ApiResult<()> {
        Err(ApiError::NotConfigured)
    }
    async fn list_projects(&self) -> ApiResult<Vec<Project>> {
        Err(ApiError::NotConfigured)
    }
}
