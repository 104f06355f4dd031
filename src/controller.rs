use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::channel::{ChannelClose, LiveChannel, TaskEvent};
use crate::client::ApiClient;
use crate::config::AppConfig;
use crate::draft::ImportDraft;
use crate::errors::{AppError, AppResult};
use crate::journal::ActivityJournal;
use crate::models::{Task, TaskProcess, TaskType};
use crate::reconcile::{Reaction, TaskObservation};

const RECONNECT_BASE_MS: u64 = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// Drafts can be edited and submitted.
    Idle,
    /// Create requests are in flight.
    Submitting,
    /// A task is mirrored locally and live updates apply to it.
    Observing,
}

/// One step of task progress as seen by a watcher.
#[derive(Clone, Debug)]
pub enum WatchUpdate {
    Process(TaskProcess),
    TaskRefreshed(Task),
    Progress(String),
    Notice(String),
    ServerError(String),
    WikiText(String),
    Reconnecting { attempt: u32 },
    ChannelDown(ChannelClose),
}

pub type WatchObserver = Arc<dyn Fn(&WatchUpdate) + Send + Sync>;

#[derive(Debug)]
pub struct SubmitOutcome {
    pub created: Vec<String>,
    pub rejected: Vec<RejectedDraft>,
}

#[derive(Clone, Debug)]
pub struct RejectedDraft {
    pub url: String,
    pub reason: String,
}

/// Drives one import session end to end: submits drafts, mirrors the created
/// task through snapshots and live pushes, and gates retry and cancel on the
/// mirrored state.
///
/// The server stays authoritative throughout. Submitting never invents local
/// task state, and retry does not touch the mirrored status until the server
/// pushes or a snapshot confirms the transition.
pub struct ImportSession {
    api: ApiClient,
    config: AppConfig,
    journal: ActivityJournal,
    phase: SessionPhase,
    observation: TaskObservation,
    task_id: Option<String>,
    channel: Option<LiveChannel>,
    jitter_rng: Mutex<StdRng>,
}

impl ImportSession {
    pub fn new(api: ApiClient, config: AppConfig, journal: ActivityJournal) -> Self {
        Self {
            api,
            config,
            journal,
            phase: SessionPhase::Idle,
            observation: TaskObservation::new(),
            task_id: None,
            channel: None,
            jitter_rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn observation(&self) -> &TaskObservation {
        &self.observation
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    /// Creates one task per importable draft. Creation failures are collected
    /// per draft and never abort the rest of the batch; when nothing at all
    /// was created the first error is returned instead. A single created task
    /// is observed immediately.
    pub async fn submit(
        &mut self,
        drafts: &[ImportDraft],
        task_type: TaskType,
    ) -> AppResult<SubmitOutcome> {
        if self.phase != SessionPhase::Idle {
            return Err(AppError::State(
                "an import is already in progress; reset the session first".into(),
            ));
        }

        let importable: Vec<&ImportDraft> =
            drafts.iter().filter(|d| d.validate().is_ok()).collect();
        if importable.is_empty() {
            let reason = drafts.iter().find_map(|d| d.validate().err());
            return Err(reason.unwrap_or_else(|| AppError::Draft("nothing to import".into())));
        }

        self.phase = SessionPhase::Submitting;
        let mut created = Vec::new();
        let mut rejected = Vec::new();
        let mut first_error = None;

        for draft in importable {
            let request = match draft.to_create_request(task_type) {
                Ok(request) => request,
                Err(err) => {
                    rejected.push(RejectedDraft {
                        url: draft.url.clone(),
                        reason: err.to_string(),
                    });
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    continue;
                }
            };
            match self.api.create_task(&request).await {
                Ok(task_id) => {
                    info!(target: "import_session", %task_id, url = %draft.url, "task created");
                    self.journal.note(
                        "task_created",
                        json!({ "taskId": task_id, "url": draft.url }),
                    );
                    created.push(task_id);
                }
                Err(err) => {
                    warn!(target: "import_session", url = %draft.url, ?err, "task creation failed");
                    self.journal.note(
                        "task_create_failed",
                        json!({ "url": draft.url, "error": err.to_string() }),
                    );
                    rejected.push(RejectedDraft {
                        url: draft.url.clone(),
                        reason: err.to_string(),
                    });
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if created.is_empty() {
            self.phase = SessionPhase::Idle;
            return Err(
                first_error.unwrap_or_else(|| AppError::Draft("nothing to import".into()))
            );
        }

        if created.len() == 1 && rejected.is_empty() {
            self.observe(&created[0]).await?;
        } else {
            // Batches land on the task list; nothing is singled out to watch.
            self.phase = SessionPhase::Idle;
        }

        Ok(SubmitOutcome { created, rejected })
    }

    /// Starts mirroring a task: opens the push channel if needed, subscribes,
    /// then loads a full snapshot. Subscribing first means anything that
    /// changes while the snapshot is in flight still reaches us.
    pub async fn observe(&mut self, task_id: &str) -> AppResult<()> {
        if self.channel.is_none() {
            let session = self.api.session_store().require()?;
            self.channel = Some(LiveChannel::connect(&self.config, &session.session_id).await?);
        }
        if let Some(channel) = self.channel.as_mut() {
            channel.subscribe(task_id).await?;
        }

        let snapshot = self.api.fetch_task(task_id).await?;
        self.observation.apply_snapshot(snapshot);
        self.task_id = Some(task_id.to_string());
        self.phase = SessionPhase::Observing;
        Ok(())
    }

    /// Waits for the next live event and folds it into the observation.
    /// Returns `Ok(None)` when there is no channel or it has fully ended.
    pub async fn next_update(&mut self) -> AppResult<Option<WatchUpdate>> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(None);
        };
        let Some(event) = channel.next_event().await else {
            return Ok(None);
        };

        if let TaskEvent::Closed(close) = event {
            self.channel = None;
            self.journal.note(
                "channel_closed",
                json!({ "code": close.code, "reason": close.reason, "clean": close.clean }),
            );
            return Ok(Some(WatchUpdate::ChannelDown(close)));
        }

        if let Reaction::Refetch(task_id) = self.observation.observe_event(&event) {
            debug!(target: "import_session", %task_id, "task push, re-fetching snapshot");
            self.journal
                .note("snapshot_refetch", json!({ "taskId": task_id }));
            let snapshot = self.api.fetch_task(&task_id).await?;
            self.observation.apply_snapshot(snapshot);
            return Ok(self
                .observation
                .task()
                .cloned()
                .map(WatchUpdate::TaskRefreshed));
        }

        Ok(match event {
            TaskEvent::Process(process) => Some(WatchUpdate::Process(process)),
            TaskEvent::WikiText(text) => {
                self.journal
                    .note("wikitext_received", json!({ "bytes": text.len() }));
                Some(WatchUpdate::WikiText(text))
            }
            TaskEvent::Progress(message) => {
                self.journal.note("progress", json!({ "message": message }));
                Some(WatchUpdate::Progress(message))
            }
            TaskEvent::Notice(message) => {
                self.journal.note("notice", json!({ "message": message }));
                Some(WatchUpdate::Notice(message))
            }
            TaskEvent::ServerError(message) => {
                warn!(target: "import_session", message, "server reported an error");
                self.journal
                    .note("server_error", json!({ "message": message }));
                Some(WatchUpdate::ServerError(message))
            }
            TaskEvent::Task(_) | TaskEvent::Closed(_) => None,
        })
    }

    /// Follows live updates until the observed task settles. An abnormal
    /// close triggers a bounded reconnect with exponential backoff; a normal
    /// close or an exhausted retry budget ends the watch.
    pub async fn watch_until_settled(&mut self, observer: Option<WatchObserver>) -> AppResult<()> {
        if self.phase != SessionPhase::Observing {
            return Err(AppError::State("no task is being observed".into()));
        }
        if self.observation.is_settled() {
            return Ok(());
        }

        loop {
            match self.next_update().await? {
                Some(WatchUpdate::ChannelDown(close)) => {
                    notify(observer.as_ref(), &WatchUpdate::ChannelDown(close.clone()));
                    if close.is_normal() {
                        return Ok(());
                    }
                    self.reconnect(observer.as_ref()).await?;
                    // the reconnect snapshot may already carry the settled state
                    if self.observation.is_settled() {
                        return Ok(());
                    }
                }
                Some(update) => {
                    notify(observer.as_ref(), &update);
                    if self.observation.is_settled() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    /// Asks the server to cancel the observed task, then re-fetches the
    /// snapshot; the response only acknowledges the request.
    pub async fn cancel(&mut self) -> AppResult<()> {
        let Some(task_id) = self.task_id.clone() else {
            return Err(AppError::State("no task is being observed".into()));
        };
        if !self.observation.cancel_allowed() {
            return Err(AppError::State(
                "cancel is only available while the task is queued or processing".into(),
            ));
        }

        let result = self.api.cancel_task(&task_id).await;
        match &result {
            Ok(_) => self
                .journal
                .note("task_cancel_requested", json!({ "taskId": task_id })),
            Err(err) => self.journal.note(
                "task_cancel_failed",
                json!({ "taskId": task_id, "error": err.to_string() }),
            ),
        }
        result?;

        let snapshot = self.api.fetch_task(&task_id).await?;
        self.observation.apply_snapshot(snapshot);
        Ok(())
    }

    /// Asks the server to re-queue the observed task. The mirrored status is
    /// left untouched; the queued transition arrives as a push or snapshot.
    pub async fn retry(&mut self) -> AppResult<()> {
        let Some(task_id) = self.task_id.clone() else {
            return Err(AppError::State("no task is being observed".into()));
        };
        if !self.observation.can_retry() {
            return Err(AppError::State(
                "retry is only available for failed, cancelled, or partially failed tasks".into(),
            ));
        }

        let result = self.api.retry_task(&task_id).await;
        match &result {
            Ok(_) => self
                .journal
                .note("task_retry_requested", json!({ "taskId": task_id })),
            Err(err) => self.journal.note(
                "task_retry_failed",
                json!({ "taskId": task_id, "error": err.to_string() }),
            ),
        }
        result?;
        Ok(())
    }

    /// Back to a clean slate: closes the channel and drops the mirrored task.
    pub async fn reset(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(err) = channel.disconnect().await {
                warn!(target: "import_session", ?err, "error closing live channel during reset");
            }
        }
        self.observation.clear();
        self.task_id = None;
        self.phase = SessionPhase::Idle;
    }

    async fn reconnect(&mut self, observer: Option<&WatchObserver>) -> AppResult<()> {
        let Some(task_id) = self.task_id.clone() else {
            return Err(AppError::State(
                "no task to re-subscribe after a disconnect".into(),
            ));
        };

        let budget = self.config.channel_reconnect_attempts.max(1);
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            sleep(self.reconnect_delay(attempt)).await;
            notify(observer, &WatchUpdate::Reconnecting { attempt });

            // observe() re-subscribes and re-fetches, covering whatever was
            // pushed while the channel was down.
            match self.observe(&task_id).await {
                Ok(()) => {
                    info!(target: "import_session", attempt, "live channel reconnected");
                    self.journal
                        .note("channel_reconnected", json!({ "attempt": attempt }));
                    return Ok(());
                }
                Err(err) if attempt < budget => {
                    self.channel = None;
                    warn!(target: "import_session", ?err, attempt, "reconnect attempt failed");
                }
                Err(err) => {
                    self.channel = None;
                    self.journal
                        .note("reconnect_exhausted", json!({ "attempts": attempt }));
                    return Err(err);
                }
            }
        }
    }

    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(6);
        let base = RECONNECT_BASE_MS * (1_u64 << exponent);
        let jitter = self.jitter_rng.lock().gen_range(0..RECONNECT_BASE_MS);
        Duration::from_millis(base + jitter)
    }
}

fn notify(observer: Option<&WatchObserver>, update: &WatchUpdate) {
    if let Some(callback) = observer {
        callback(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    use crate::session::SessionStore;
    use crate::settings::ImportSettings;

    fn idle_session() -> (ImportSession, TempDir) {
        let dir = tempdir().unwrap();
        let config = AppConfig::default();
        let store = SessionStore::in_memory();
        let api = ApiClient::new(&config, store).unwrap();
        let journal = ActivityJournal::new(dir.path(), &config).unwrap();
        (ImportSession::new(api, config, journal), dir)
    }

    #[tokio::test]
    async fn submit_rejects_an_empty_batch() {
        let (mut session, _dir) = idle_session();
        let err = session.submit(&[], TaskType::Map).await.unwrap_err();
        assert!(matches!(err, AppError::Draft(_)));
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn submit_surfaces_the_first_validation_failure() {
        let (mut session, _dir) = idle_session();
        let blank = ImportDraft::blank(&ImportSettings::default());

        let err = session.submit(&[blank], TaskType::Map).await.unwrap_err();
        assert!(matches!(err, AppError::Draft(_)));
        assert!(err.to_string().contains("URL"));
    }

    #[tokio::test]
    async fn cancel_requires_an_observed_task() {
        let (mut session, _dir) = idle_session();
        let err = session.cancel().await.unwrap_err();
        assert!(matches!(err, AppError::State(_)));
    }

    #[tokio::test]
    async fn retry_requires_an_observed_task() {
        let (mut session, _dir) = idle_session();
        let err = session.retry().await.unwrap_err();
        assert!(matches!(err, AppError::State(_)));
    }

    #[tokio::test]
    async fn watch_requires_an_observed_task() {
        let (mut session, _dir) = idle_session();
        let err = session.watch_until_settled(None).await.unwrap_err();
        assert!(matches!(err, AppError::State(_)));
    }

    #[tokio::test]
    async fn reset_returns_to_a_clean_slate() {
        let (mut session, _dir) = idle_session();
        session.reset().await;
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.task_id().is_none());
        assert!(session.observation().task().is_none());
    }

    #[test]
    fn reconnect_delay_grows_and_stays_capped() {
        let (session, _dir) = idle_session();
        let first = session.reconnect_delay(1);
        assert!(first >= Duration::from_millis(RECONNECT_BASE_MS));
        assert!(first < Duration::from_millis(2 * RECONNECT_BASE_MS));

        // Exponent caps at 6 no matter how many attempts pile up.
        let late = session.reconnect_delay(40);
        assert!(late >= Duration::from_millis(RECONNECT_BASE_MS * 64));
        assert!(late < Duration::from_millis(RECONNECT_BASE_MS * 65));
    }
}
