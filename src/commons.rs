use std::collections::HashMap;

use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::AppResult;

/// Thin client for the Wikimedia Commons `api.php` surface the importer
/// needs: category completion and page-existence probes.
#[derive(Clone)]
pub struct CommonsClient {
    http: Client,
    api_url: Url,
}

impl CommonsClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = Client::builder().user_agent(config.user_agent.clone()).build()?;
        Ok(Self {
            http,
            api_url: config.commons_url()?,
        })
    }

    /// Category names starting with `prefix`, for completing `[[Category:...]]`
    /// lines. The API caps this at its default page size.
    pub async fn search_categories(&self, prefix: &str) -> AppResult<Vec<String>> {
        let mut url = self.api_url.clone();
        url.query_pairs_mut()
            .append_pair("action", "query")
            .append_pair("format", "json")
            .append_pair("redirects", "1")
            .append_pair("list", "allcategories")
            .append_pair("acprefix", prefix);

        let response = self.http.get(url).send().await?.error_for_status()?;
        let body: CategoryQueryResponse = response.json().await?;
        Ok(body
            .query
            .map(|q| q.allcategories.into_iter().map(|c| c.name).collect())
            .unwrap_or_default())
    }

    pub async fn page_exists(&self, title: &str) -> AppResult<bool> {
        let mut url = self.api_url.clone();
        url.query_pairs_mut()
            .append_pair("action", "query")
            .append_pair("format", "json")
            .append_pair("titles", title);

        let response = self.http.get(url).send().await?.error_for_status()?;
        let body: PageQueryResponse = response.json().await?;
        let exists = body
            .query
            .map(|q| q.pages.values().any(|p| p.pageid.is_some()))
            .unwrap_or(false);
        debug!(target: "commons", title, exists, "probed page existence");
        Ok(exists)
    }
}

#[derive(Deserialize)]
struct CategoryQueryResponse {
    #[serde(default)]
    query: Option<CategoryQuery>,
}

#[derive(Deserialize)]
struct CategoryQuery {
    #[serde(default)]
    allcategories: Vec<CategoryEntry>,
}

// The legacy JSON format keys category names under `*`.
#[derive(Deserialize)]
struct CategoryEntry {
    #[serde(rename = "*")]
    name: String,
}

#[derive(Deserialize)]
struct PageQueryResponse {
    #[serde(default)]
    query: Option<PageQuery>,
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    pages: HashMap<String, PageStub>,
}

#[derive(Deserialize)]
struct PageStub {
    #[serde(default)]
    pageid: Option<u64>,
}
