use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{
    ChartInfo, ChartParameter, ChartParameters, OverwriteBehaviour, Task, TaskProcess,
    TaskSnapshot, TaskType,
};
use crate::session::{SessionStore, StoredSession};

/// Header (and websocket query parameter) the backend reads the session from.
pub const SESSION_HEADER: &str = "sessionId";

/// HTTP client for the importer backend. The session is read from the store
/// on every call, so a handover or logout takes effect immediately.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base: Url,
    store: SessionStore,
}

impl ApiClient {
    pub fn new(config: &AppConfig, store: SessionStore) -> AppResult<Self> {
        let http = Client::builder().user_agent(config.user_agent.clone()).build()?;
        Ok(Self {
            http,
            base: config.api_url()?,
            store,
        })
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.store
    }

    pub fn current_session(&self) -> AppResult<Option<StoredSession>> {
        self.store.get()
    }

    /// Trades a browser session id for a fresh server-side one. The old id is
    /// invalidated by the server, so the response id is what gets stored.
    pub async fn adopt_session(&self, browser_session_id: &str) -> AppResult<StoredSession> {
        let url = self.endpoint(&["session", "replace"])?;
        let response = self
            .http
            .post(url)
            .json(&SessionIdBody {
                session_id: browser_session_id.to_string(),
            })
            .send()
            .await?;
        let body: ReplaceSessionResponse = response.json().await?;
        if let Some(error) = non_empty(body.error) {
            return Err(AppError::Api(error));
        }
        let (Some(session_id), Some(username)) = (body.session_id, body.username) else {
            return Err(AppError::Api("malformed session handover response".into()));
        };

        let session = StoredSession {
            session_id,
            username,
        };
        self.store.set(&session)?;
        info!(target: "api_client", username = %session.username, "adopted browser session");
        Ok(session)
    }

    /// Confirms the stored session is still alive. A rejected session is
    /// cleared so later calls fail with a clear logged-out error.
    pub async fn verify_session(&self) -> AppResult<String> {
        let session = self.store.require()?;
        let url = self.endpoint(&["session", "verify"])?;
        let response = self
            .http
            .post(url)
            .json(&SessionIdBody {
                session_id: session.session_id.clone(),
            })
            .send()
            .await?;
        let body: VerifySessionResponse = response.json().await?;
        if let Some(error) = non_empty(body.error) {
            self.store.clear()?;
            return Err(AppError::Api(error));
        }
        Ok(body.username.unwrap_or(session.username))
    }

    /// Best-effort server-side logout. Local credentials are dropped even when
    /// the request fails.
    pub async fn logout(&self) -> AppResult<()> {
        if let Some(session) = self.store.get()? {
            let url = self.endpoint(&["logout"])?;
            let result = self
                .http
                .get(url)
                .header(SESSION_HEADER, &session.session_id)
                .send()
                .await;
            if let Err(err) = result {
                warn!(
                    target: "api_client",
                    ?err,
                    "logout request failed, clearing local session anyway"
                );
            }
        }
        self.store.clear()
    }

    pub async fn create_task(&self, request: &CreateTaskRequest) -> AppResult<String> {
        let session = self.store.require()?;
        let url = self.endpoint(&["task"])?;
        let response = self
            .http
            .post(url)
            .header(SESSION_HEADER, &session.session_id)
            .json(request)
            .send()
            .await?;
        let body: TaskMutationResponse = response.json().await?;
        if let Some(error) = non_empty(body.error) {
            return Err(AppError::Api(error));
        }
        let task_id = body
            .task_id
            .ok_or_else(|| AppError::Api("task id missing from creation response".into()))?;
        debug!(target: "api_client", %task_id, action = request.action, "created task");
        Ok(task_id)
    }

    pub async fn fetch_task(&self, task_id: &str) -> AppResult<TaskSnapshot> {
        let url = self.endpoint(&["task", task_id])?;
        let mut request = self.http.get(url);
        if let Some(session) = self.store.get()? {
            request = request.header(SESSION_HEADER, &session.session_id);
        }
        let body: FetchTaskResponse = request.send().await?.json().await?;
        if let Some(error) = non_empty(body.error) {
            return Err(AppError::Api(error));
        }
        let task = body
            .task
            .ok_or_else(|| AppError::Api("task missing from response".into()))?;
        Ok(TaskSnapshot {
            task,
            processes: body.processes,
            wiki_text: non_empty(body.wiki_text),
        })
    }

    pub async fn fetch_tasks(&self, task_type: TaskType) -> AppResult<Vec<Task>> {
        let mut url = self.endpoint(&["task"])?;
        url.query_pairs_mut()
            .append_pair("taskType", task_type.as_str());
        let mut request = self.http.get(url);
        if let Some(session) = self.store.get()? {
            request = request.header(SESSION_HEADER, &session.session_id);
        }
        let body: TaskListResponse = request.send().await?.json().await?;
        if let Some(error) = non_empty(body.error) {
            return Err(AppError::Api(error));
        }
        Ok(body.tasks.unwrap_or_default())
    }

    pub async fn retry_task(&self, task_id: &str) -> AppResult<String> {
        self.task_action(task_id, "retry").await
    }

    pub async fn cancel_task(&self, task_id: &str) -> AppResult<String> {
        self.task_action(task_id, "cancel").await
    }

    /// Grapher metadata for one chart URL. The backend drives a headless
    /// browser for this, so calls can take a while.
    pub async fn chart_parameters(&self, chart_url: &str) -> AppResult<ChartParameters> {
        let session = self.store.require()?;
        let mut url = self.endpoint(&["chart", "parameters"])?;
        url.query_pairs_mut().append_pair("url", chart_url);
        let response = self
            .http
            .get(url)
            .header(SESSION_HEADER, &session.session_id)
            .send()
            .await?;
        let body: ChartParametersResponse = response.json().await?;
        if let Some(error) = non_empty(body.error) {
            return Err(AppError::Api(error));
        }
        Ok(ChartParameters {
            params: body.params.unwrap_or_default(),
            info: body.info.unwrap_or_default(),
        })
    }

    async fn task_action(&self, task_id: &str, verb: &str) -> AppResult<String> {
        let session = self.store.require()?;
        let url = self.endpoint(&["task", task_id, verb])?;
        let response = self
            .http
            .post(url)
            .header(SESSION_HEADER, &session.session_id)
            .send()
            .await?;
        let body: TaskMutationResponse = response.json().await?;
        if let Some(error) = non_empty(body.error) {
            return Err(AppError::Api(error));
        }
        body.task_id
            .ok_or_else(|| AppError::Api("task id missing from response".into()))
    }

    fn endpoint(&self, segments: &[&str]) -> AppResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config("API base URL cannot be a base".into()))?
            .extend(segments);
        Ok(url)
    }
}

// The backend reports failures in-band as `{"error": "..."}` with an empty
// string standing in for "no error" on some routes.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Serialize)]
struct SessionIdBody {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// Payload for the task creation endpoint. Unlike stored tasks this spells
/// the file name `fileName`, and the country/template flags are real booleans.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub action: &'static str,
    pub url: String,
    pub chart_parameters: String,
    pub file_name: String,
    pub description: String,
    pub description_overwrite_behaviour: OverwriteBehaviour,
    pub import_countries: bool,
    pub generate_template_commons: bool,
    pub country_file_name: String,
    pub country_description: String,
    pub country_description_overwrite_behaviour: OverwriteBehaviour,
    pub template_name_format: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplaceSessionResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Deserialize)]
struct VerifySessionResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskMutationResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Deserialize)]
struct TaskListResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    tasks: Option<Vec<Task>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchTaskResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    task: Option<Task>,
    #[serde(default)]
    processes: Vec<TaskProcess>,
    #[serde(default)]
    wiki_text: Option<String>,
}

#[derive(Deserialize)]
struct ChartParametersResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    params: Option<Vec<ChartParameter>>,
    #[serde(default)]
    info: Option<ChartInfo>,
}
