use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::client::ApiClient;
use crate::commons::CommonsClient;
use crate::config::AppConfig;
use crate::draft::{ImportDraft, SelectedParameter};
use crate::errors::{AppError, AppResult};
use crate::models::ChartParameters;
use crate::settings::ImportSettings;

/// Chart metadata lookups hammer a headless browser on the backend, so batch
/// resolution never runs more than this many in parallel.
const MAX_CONCURRENT_LOOKUPS: usize = 2;

/// Where chart metadata comes from. The production source is the importer
/// backend; tests substitute canned responses.
#[async_trait]
pub trait ChartSource: Send + Sync {
    async fn chart_parameters(&self, url: &str) -> AppResult<ChartParameters>;
}

#[async_trait]
impl ChartSource for ApiClient {
    async fn chart_parameters(&self, url: &str) -> AppResult<ChartParameters> {
        ApiClient::chart_parameters(self, url).await
    }
}

/// Existence probe for generated Commons templates.
#[async_trait]
pub trait TemplateProbe: Send + Sync {
    async fn template_exists(&self, title: &str) -> AppResult<bool>;
}

#[async_trait]
impl TemplateProbe for CommonsClient {
    async fn template_exists(&self, title: &str) -> AppResult<bool> {
        self.page_exists(title).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkOutcome {
    Done,
    Failed,
}

/// Per-URL result of a batch resolution, in submission order.
#[derive(Clone, Debug)]
pub struct ResolvedLink {
    pub url: String,
    pub outcome: LinkOutcome,
}

#[derive(Debug)]
pub struct ResolvedBatch {
    pub drafts: Vec<ImportDraft>,
    pub links: Vec<ResolvedLink>,
}

/// Turns grapher URLs into import drafts: fetches chart metadata, prefills
/// file and template names from any pinned query parameters, and probes
/// Commons for an existing generated template.
pub struct LinkResolver {
    charts: Arc<dyn ChartSource>,
    templates: Arc<dyn TemplateProbe>,
    settings: ImportSettings,
    chart_url_prefix: String,
    template_prefix: String,
}

impl LinkResolver {
    pub fn new(
        config: &AppConfig,
        settings: ImportSettings,
        charts: Arc<dyn ChartSource>,
        templates: Arc<dyn TemplateProbe>,
    ) -> Self {
        Self {
            charts,
            templates,
            settings,
            chart_url_prefix: config.chart_url_prefix.clone(),
            template_prefix: config.commons_template_prefix.clone(),
        }
    }

    /// One URL per line; surrounding whitespace and blank lines are dropped.
    pub fn parse_links(input: &str) -> Vec<String> {
        input
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Every link must point at the grapher before anything is fetched; one
    /// bad line rejects the whole batch.
    pub fn check_links(&self, links: &[String]) -> AppResult<()> {
        if links.is_empty() {
            return Err(AppError::Links("no links were provided".into()));
        }
        for link in links {
            if !link.starts_with(&self.chart_url_prefix) {
                return Err(AppError::Links(format!(
                    "link does not start with {}: {}",
                    self.chart_url_prefix, link
                )));
            }
        }
        Ok(())
    }

    /// Resolves a batch of links, at most [`MAX_CONCURRENT_LOOKUPS`] in
    /// flight at once. A link that fails to resolve is reported in the
    /// outcomes but never aborts its siblings; only successful links yield
    /// drafts.
    pub async fn resolve_batch(&self, links: &[String]) -> AppResult<ResolvedBatch> {
        self.check_links(links)?;

        let lookups = links.iter().map(|link| {
            let url = link.clone();
            async move {
                match self.build_draft(&url).await {
                    Ok(draft) => (url, Some(draft)),
                    Err(err) => {
                        warn!(target: "link_resolver", url = %url, ?err, "link resolution failed");
                        (url, None)
                    }
                }
            }
        });
        let results = stream::iter(lookups)
            .buffered(MAX_CONCURRENT_LOOKUPS)
            .collect::<Vec<_>>()
            .await;

        let mut drafts = Vec::new();
        let mut outcomes = Vec::with_capacity(results.len());
        for (url, draft) in results {
            match draft {
                Some(draft) => {
                    outcomes.push(ResolvedLink {
                        url,
                        outcome: LinkOutcome::Done,
                    });
                    drafts.push(draft);
                }
                None => outcomes.push(ResolvedLink {
                    url,
                    outcome: LinkOutcome::Failed,
                }),
            }
        }
        Ok(ResolvedBatch {
            drafts,
            links: outcomes,
        })
    }

    /// Single-link resolution; unlike the batch path an error here is
    /// returned to the caller.
    pub async fn resolve_link(&self, url: &str) -> AppResult<ImportDraft> {
        let links = vec![url.trim().to_string()];
        self.check_links(&links)?;
        self.build_draft(&links[0]).await
    }

    async fn build_draft(&self, url: &str) -> AppResult<ImportDraft> {
        let resolved = self.charts.chart_parameters(url).await?;

        let mut draft = ImportDraft::blank(&self.settings);
        draft.url = url.to_string();
        draft.link_verified = true;

        if !resolved.params.is_empty() {
            self.apply_parameters(&mut draft, url, &resolved);
        }

        if !resolved.info.title.is_empty() {
            let template_name =
                draft.commons_template_name(&self.template_prefix, &resolved.info.title);
            match self.templates.template_exists(&template_name).await {
                Ok(exists) => {
                    draft.template_exists = exists;
                    debug!(target: "link_resolver", url, template_name, exists, "probed template");
                }
                // Existence only toggles a warning for the operator, so a
                // failed probe must not sink the link.
                Err(err) => {
                    warn!(target: "link_resolver", url, template_name, ?err, "template probe failed");
                }
            }
        }

        draft.can_import = true;
        Ok(draft)
    }

    /// Rebuilds file and template name formats around the query parameters
    /// pinned in the URL. Only parameters the chart actually declares count;
    /// choice display names fall back to the raw slug when unknown.
    fn apply_parameters(&self, draft: &mut ImportDraft, url: &str, resolved: &ChartParameters) {
        let mut selected = Vec::new();
        let mut map_name = String::from("$NAME");
        let mut chart_name = String::from("$NAME");
        let mut template_name = String::from("$CHART_NAME");

        if let Some((_, query)) = url.split_once('?') {
            for pair in query.split('&') {
                let Some((key, value)) = pair.split_once('=') else {
                    continue;
                };
                if key.is_empty() || value.is_empty() {
                    continue;
                }
                let Some(param) = resolved.parameter(key) else {
                    continue;
                };

                let parameter = match param.choices.iter().find(|c| c.slug == value) {
                    Some(choice) => SelectedParameter {
                        key: param.slug.clone(),
                        key_name: param.name.clone(),
                        value: value.to_string(),
                        value_name: choice.name.clone(),
                    },
                    None => SelectedParameter {
                        key: key.to_string(),
                        key_name: key.to_string(),
                        value: value.to_string(),
                        value_name: value.to_string(),
                    },
                };

                let placeholder = format!(", ${}", parameter.key.to_uppercase());
                map_name.push_str(&placeholder);
                chart_name.push_str(&placeholder);
                template_name.push_str(&placeholder);
                selected.push(parameter);
            }
        }

        map_name.push_str(", $REGION, $YEAR.svg");
        chart_name.push_str(", $START_YEAR to $END_YEAR, $REGION.svg");

        draft.file_name = map_name;
        draft.country_file_name = chart_name;
        draft.template_name_format = template_name;
        draft.selected_chart_parameters = selected;
    }
}
