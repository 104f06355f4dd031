use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle states a task moves through on the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Done,
    Retrying,
    Skipped,
    Overwritten,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// A settled task will receive no further status pushes.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Overwritten => "overwritten",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskProcessStatus {
    Processing,
    Uploaded,
    Overwritten,
    Skipped,
    DescriptionUpdated,
    Retrying,
    Failed,
}

impl TaskProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskProcessStatus::Processing => "processing",
            TaskProcessStatus::Uploaded => "uploaded",
            TaskProcessStatus::Overwritten => "overwritten",
            TaskProcessStatus::Skipped => "skipped",
            TaskProcessStatus::DescriptionUpdated => "description_updated",
            TaskProcessStatus::Retrying => "retrying",
            TaskProcessStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Map,
    Chart,
}

impl TaskType {
    /// Action verb the create endpoint expects for this kind of import.
    pub fn action(self) -> &'static str {
        match self {
            TaskType::Map => "startMap",
            TaskType::Chart => "startChart",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Map => "map",
            TaskType::Chart => "chart",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskProcessKind {
    Map,
    Country,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwriteBehaviour {
    #[default]
    All,
    AllExceptCategories,
    OnlyFile,
}

/// Server-side task record. The task JSON uses `filename` while every other
/// key is camelCase, so that one gets an explicit rename.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "filename", default)]
    pub file_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub description_overwrite_behaviour: OverwriteBehaviour,
    #[serde(default)]
    pub import_countries: u8,
    #[serde(default)]
    pub generate_template_commons: u8,
    #[serde(default)]
    pub country_file_name: Option<String>,
    #[serde(default)]
    pub country_description: Option<String>,
    #[serde(default)]
    pub country_description_overwrite_behaviour: Option<OverwriteBehaviour>,
    #[serde(default)]
    pub chart_name: String,
    #[serde(default)]
    pub commons_template_name: Option<String>,
    #[serde(default)]
    pub commons_template_name_format: Option<String>,
    pub status: TaskStatus,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub last_operation_at: i64,
    #[serde(default)]
    pub created_at: i64,
}

impl Task {
    // The server stores these flags as 0/1 integers.
    pub fn imports_countries(&self) -> bool {
        self.import_countries != 0
    }

    pub fn generates_commons_template(&self) -> bool {
        self.generate_template_commons != 0
    }
}

/// One per-region upload within a task. Map tasks emit one per region/year
/// pair, country runs one per country chart.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProcess {
    pub id: String,
    #[serde(default)]
    pub region: String,
    #[serde(rename = "type", default)]
    pub kind: Option<TaskProcessKind>,
    #[serde(default)]
    pub year: Option<i64>,
    #[serde(default)]
    pub date: Option<String>,
    pub status: TaskProcessStatus,
    #[serde(default)]
    pub task_id: String,
    #[serde(rename = "filename", default)]
    pub file_name: String,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub fill_data: Option<String>,
}

impl TaskProcess {
    pub fn is_failed(&self) -> bool {
        self.status == TaskProcessStatus::Failed
    }

    /// Human-readable time slice, preferring the preformatted date when the
    /// server sent one.
    pub fn period(&self) -> Option<String> {
        self.date
            .clone()
            .or_else(|| self.year.map(|y| y.to_string()))
    }
}

/// Full task view as assembled from the task-by-id endpoint.
#[derive(Clone, Debug)]
pub struct TaskSnapshot {
    pub task: Task,
    pub processes: Vec<TaskProcess>,
    pub wiki_text: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChartParameter {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub choices: Vec<ChartChoice>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChartChoice {
    pub name: String,
    pub slug: String,
}

/// Metadata scraped from a grapher page. Year bounds come back as strings.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartInfo {
    #[serde(default)]
    pub params_map: HashMap<String, String>,
    #[serde(default)]
    pub start_year: String,
    #[serde(default)]
    pub end_year: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub has_countries: bool,
    #[serde(default)]
    pub countries_list: Vec<String>,
}

/// Normalized chart-parameters result handed to the resolver.
#[derive(Clone, Debug, Default)]
pub struct ChartParameters {
    pub params: Vec<ChartParameter>,
    pub info: ChartInfo,
}

impl ChartParameters {
    pub fn parameter(&self, slug: &str) -> Option<&ChartParameter> {
        self.params.iter().find(|p| p.slug == slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_task_with_numeric_flags() {
        let raw = r#"{
            "id": "t-1",
            "userId": "u-1",
            "url": "https://ourworldindata.org/grapher/share-electricity",
            "filename": "$NAME, $REGION, $YEAR.svg",
            "description": "desc",
            "descriptionOverwriteBehaviour": "all_except_categories",
            "importCountries": 1,
            "generateTemplateCommons": 0,
            "chartName": "share-electricity",
            "status": "processing",
            "type": "map",
            "lastOperationAt": 1700000000,
            "createdAt": 1700000000
        }"#;

        let task: Task = serde_json::from_str(raw).unwrap();
        assert_eq!(task.file_name, "$NAME, $REGION, $YEAR.svg");
        assert!(task.imports_countries());
        assert!(!task.generates_commons_template());
        assert_eq!(
            task.description_overwrite_behaviour,
            OverwriteBehaviour::AllExceptCategories
        );
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.task_type, TaskType::Map);
        assert!(!task.status.is_settled());
    }

    #[test]
    fn decodes_task_process_year_and_date_forms() {
        let with_year = r#"{
            "id": "p-1",
            "region": "World",
            "type": "map",
            "year": 2019,
            "status": "uploaded",
            "taskId": "t-1",
            "filename": "file.svg",
            "createdAt": 1700000000,
            "fillData": ""
        }"#;
        let process: TaskProcess = serde_json::from_str(with_year).unwrap();
        assert_eq!(process.period().as_deref(), Some("2019"));
        assert!(!process.is_failed());

        let with_date = r#"{
            "id": "p-2",
            "region": "Sweden",
            "date": "1990 to 2020",
            "status": "failed",
            "taskId": "t-1",
            "filename": "file.svg"
        }"#;
        let process: TaskProcess = serde_json::from_str(with_date).unwrap();
        assert_eq!(process.period().as_deref(), Some("1990 to 2020"));
        assert!(process.is_failed());
    }

    #[test]
    fn settled_statuses() {
        assert!(TaskStatus::Done.is_settled());
        assert!(TaskStatus::Failed.is_settled());
        assert!(TaskStatus::Cancelled.is_settled());
        assert!(!TaskStatus::Queued.is_settled());
        assert!(!TaskStatus::Retrying.is_settled());
    }

    #[test]
    fn snake_case_process_status_round_trip() {
        let status: TaskProcessStatus = serde_json::from_str("\"description_updated\"").unwrap();
        assert_eq!(status, TaskProcessStatus::DescriptionUpdated);
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            "\"description_updated\""
        );
    }

    #[test]
    fn task_type_actions() {
        assert_eq!(TaskType::Map.action(), "startMap");
        assert_eq!(TaskType::Chart.action(), "startChart");
    }
}
