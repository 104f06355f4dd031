use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::client::CreateTaskRequest;
use crate::errors::{AppError, AppResult};
use crate::models::{OverwriteBehaviour, TaskType};
use crate::settings::ImportSettings;

static CATEGORY_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[Category:([^\]]+)\]\]").expect("category pattern compiles"));

/// One chart query parameter pinned by the operator, e.g. `tab=map`. The
/// display names come from the resolved chart metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedParameter {
    pub key: String,
    pub key_name: String,
    pub value: String,
    pub value_name: String,
}

/// One import being prepared: everything the create-task endpoint needs,
/// plus local bookkeeping about whether the link has been verified.
///
/// Placeholders like `$NAME`, `$REGION` and `$YEAR` stay literal here; the
/// server substitutes them per region/year during the upload run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportDraft {
    pub id: String,
    pub url: String,
    pub file_name: String,
    pub description: String,
    pub categories: Vec<String>,
    pub description_overwrite_behaviour: OverwriteBehaviour,

    pub country_file_name: String,
    pub country_description: String,
    pub country_categories: Vec<String>,
    pub country_description_overwrite_behaviour: OverwriteBehaviour,
    pub import_countries: bool,
    pub generate_template_commons: bool,
    pub selected_chart_parameters: Vec<SelectedParameter>,
    pub template_name_format: String,

    pub link_verified: bool,
    pub template_exists: bool,
    pub can_import: bool,
}

impl ImportDraft {
    /// Fresh draft seeded from the operator's persisted defaults.
    pub fn blank(settings: &ImportSettings) -> Self {
        Self {
            id: draft_id(),
            url: String::new(),
            file_name: settings.file_name_format.clone(),
            description: settings.description_template.clone(),
            categories: settings.categories.clone(),
            description_overwrite_behaviour: settings.description_overwrite_behaviour,
            country_file_name: settings.country_file_name_format.clone(),
            country_description: settings.country_description_template.clone(),
            country_categories: settings.country_categories.clone(),
            country_description_overwrite_behaviour: settings
                .country_description_overwrite_behaviour,
            import_countries: settings.import_countries,
            generate_template_commons: settings.generate_template_commons,
            selected_chart_parameters: Vec::new(),
            template_name_format: settings.template_name_format.clone(),
            link_verified: false,
            template_exists: false,
            can_import: false,
        }
    }

    /// The `k=v&k2=v2` string the create endpoint expects for pinned
    /// chart parameters.
    pub fn chart_parameters_query(&self) -> String {
        self.selected_chart_parameters
            .iter()
            .map(|param| format!("{}={}", param.key, param.value))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Commons page title for the generated template: the format with
    /// `$CHART_NAME` and every pinned `$KEY` substituted, under `prefix`.
    pub fn commons_template_name(&self, prefix: &str, chart_title: &str) -> String {
        let mut name = format!("{}/{}", prefix, self.template_name_format);
        name = name.replace("$CHART_NAME", chart_title);
        for param in &self.selected_chart_parameters {
            name = name.replace(
                &format!("${}", param.key.to_uppercase()),
                &param.value_name,
            );
        }
        name
    }

    /// The client-side preconditions for task creation. The server remains
    /// authoritative; this only catches what would certainly be rejected.
    pub fn validate(&self) -> AppResult<()> {
        if self.url.trim().is_empty() {
            return Err(AppError::Draft("import URL is empty".into()));
        }
        if Url::parse(self.url.trim()).is_err() {
            return Err(AppError::Draft(format!(
                "import URL is not a valid URL: {}",
                self.url
            )));
        }
        if self.file_name.trim().is_empty() {
            return Err(AppError::Draft("file name is empty".into()));
        }
        if self.description.trim().is_empty() {
            return Err(AppError::Draft("description is empty".into()));
        }
        if !self.can_import {
            return Err(AppError::Draft(format!(
                "chart link has not been verified as importable: {}",
                self.url
            )));
        }
        Ok(())
    }

    /// Builds the create-task payload, folding the category lists back into
    /// the description texts.
    pub fn to_create_request(&self, task_type: TaskType) -> AppResult<CreateTaskRequest> {
        self.validate()?;
        Ok(CreateTaskRequest {
            action: task_type.action(),
            url: self.url.trim().to_string(),
            chart_parameters: self.chart_parameters_query(),
            file_name: self.file_name.clone(),
            description: describe_with_categories(&self.description, &self.categories),
            description_overwrite_behaviour: self.description_overwrite_behaviour,
            import_countries: self.import_countries,
            generate_template_commons: self.generate_template_commons,
            country_file_name: self.country_file_name.clone(),
            country_description: describe_with_categories(
                &self.country_description,
                &self.country_categories,
            ),
            country_description_overwrite_behaviour: self.country_description_overwrite_behaviour,
            template_name_format: self.template_name_format.clone(),
        })
    }
}

/// Splits `[[Category:...]]` links out of a stored description, returning the
/// cleaned text and the category names in order of appearance.
pub fn split_categories(description: &str) -> (String, Vec<String>) {
    let categories = CATEGORY_LINK
        .captures_iter(description)
        .map(|capture| capture[1].to_string())
        .collect();
    let remainder = CATEGORY_LINK.replace_all(description, "");
    (remainder.trim().to_string(), categories)
}

/// Inverse of [`split_categories`]: appends one `[[Category:...]]` line per
/// category to the trimmed description.
pub fn describe_with_categories(description: &str, categories: &[String]) -> String {
    let mut text = description.trim().to_string();
    for category in categories {
        text.push('\n');
        text.push_str("[[Category:");
        text.push_str(category);
        text.push_str("]]");
    }
    text
}

fn draft_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}
