use crate::channel::TaskEvent;
use crate::models::{Task, TaskProcess, TaskSnapshot, TaskStatus};

/// Follow-up work the caller owes after feeding an event in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reaction {
    None,
    /// Re-fetch the task snapshot for this id. Task pushes are treated as a
    /// hint that something changed, never as data to merge.
    Refetch(String),
}

/// Client-side mirror of one task and its per-region processes.
///
/// Updates are applied last-write-wins with no version guards: a process push
/// replaces its row in place, a process for an unknown id lands at the front
/// of the list, and task pushes only trigger a snapshot re-fetch.
#[derive(Clone, Debug, Default)]
pub struct TaskObservation {
    task: Option<Task>,
    processes: Vec<TaskProcess>,
    wiki_text: Option<String>,
}

impl TaskObservation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self) -> Option<&Task> {
        self.task.as_ref()
    }

    pub fn processes(&self) -> &[TaskProcess] {
        &self.processes
    }

    pub fn wiki_text(&self) -> Option<&str> {
        self.wiki_text.as_deref()
    }

    /// Replaces the mirrored state with a fresh server snapshot. Wikitext is
    /// only produced for finished tasks, so an absent value keeps whatever was
    /// already on screen.
    pub fn apply_snapshot(&mut self, snapshot: TaskSnapshot) {
        self.task = Some(snapshot.task);
        self.processes = snapshot.processes;
        if snapshot.wiki_text.is_some() {
            self.wiki_text = snapshot.wiki_text;
        }
    }

    pub fn observe_event(&mut self, event: &TaskEvent) -> Reaction {
        match event {
            TaskEvent::Process(process) => {
                self.upsert_process(process.clone());
                Reaction::None
            }
            TaskEvent::Task(task) => Reaction::Refetch(task.id.clone()),
            _ => Reaction::None,
        }
    }

    pub fn failed_count(&self) -> usize {
        self.processes.iter().filter(|p| p.is_failed()).count()
    }

    /// Retry is offered for failed or cancelled tasks, and for done tasks that
    /// finished with at least one failed process.
    pub fn can_retry(&self) -> bool {
        let Some(task) = &self.task else {
            return false;
        };
        match task.status {
            TaskStatus::Failed | TaskStatus::Cancelled => true,
            TaskStatus::Done => self.processes.iter().any(|p| p.is_failed()),
            _ => false,
        }
    }

    pub fn cancel_allowed(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| matches!(task.status, TaskStatus::Processing | TaskStatus::Queued))
    }

    pub fn is_settled(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| task.status.is_settled())
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn upsert_process(&mut self, process: TaskProcess) {
        match self.processes.iter_mut().find(|p| p.id == process.id) {
            Some(slot) => *slot = process,
            None => self.processes.insert(0, process),
        }
    }
}
