use std::path::PathBuf;
use std::{env, io};

use reqwest::Url;
use tracing::debug;

use crate::errors::{AppError, AppResult};

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_COMMONS_API_URL: &str = "https://commons.wikimedia.org/w/api.php";
const DEFAULT_CHART_URL_PREFIX: &str = "https://ourworldindata.org/grapher";
const DEFAULT_TEMPLATE_PREFIX: &str = "Template:OWID";
const DEFAULT_USER_AGENT: &str = "owid-importer/0.1.0";
const DEFAULT_JOURNAL_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_JOURNAL_MAX_FILES: usize = 5;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_base_url: String,
    pub ws_url_override: Option<String>,
    pub commons_api_url: String,
    pub chart_url_prefix: String,
    pub commons_template_prefix: String,
    pub user_agent: String,
    pub data_dir_override: Option<PathBuf>,
    pub journal_enabled: bool,
    pub journal_batch_size: usize,
    pub journal_max_bytes: u64,
    pub journal_max_files: usize,
    pub channel_reconnect_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            ws_url_override: None,
            commons_api_url: DEFAULT_COMMONS_API_URL.to_string(),
            chart_url_prefix: DEFAULT_CHART_URL_PREFIX.to_string(),
            commons_template_prefix: DEFAULT_TEMPLATE_PREFIX.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            data_dir_override: None,
            journal_enabled: true,
            journal_batch_size: 25,
            journal_max_bytes: DEFAULT_JOURNAL_MAX_BYTES,
            journal_max_files: DEFAULT_JOURNAL_MAX_FILES,
            channel_reconnect_attempts: 3,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            api_base_url: env::var("OWID_API_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            ws_url_override: env::var("OWID_WS_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            commons_api_url: env::var("OWID_COMMONS_API_URL")
                .unwrap_or_else(|_| DEFAULT_COMMONS_API_URL.to_string()),
            chart_url_prefix: env::var("OWID_CHART_URL_PREFIX")
                .unwrap_or_else(|_| DEFAULT_CHART_URL_PREFIX.to_string()),
            commons_template_prefix: env::var("OWID_COMMONS_TEMPLATE_PREFIX")
                .unwrap_or_else(|_| DEFAULT_TEMPLATE_PREFIX.to_string()),
            user_agent: env::var("OWID_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            data_dir_override: env::var("OWID_DATA_DIR").ok().map(PathBuf::from),
            journal_enabled: parse_bool("OWID_JOURNAL_ENABLED", true),
            journal_batch_size: parse_usize("OWID_JOURNAL_BATCH_SIZE", 25).max(1),
            journal_max_bytes: parse_u64("OWID_JOURNAL_MAX_BYTES", DEFAULT_JOURNAL_MAX_BYTES),
            journal_max_files: parse_usize("OWID_JOURNAL_MAX_FILES", DEFAULT_JOURNAL_MAX_FILES)
                .max(1),
            channel_reconnect_attempts: parse_u32("OWID_CHANNEL_RECONNECT_ATTEMPTS", 3),
        }
    }

    pub fn api_url(&self) -> AppResult<Url> {
        Url::parse(self.api_base_url.trim_end_matches('/'))
            .map_err(|err| AppError::Config(format!("invalid API base URL: {err}")))
    }

    /// Push-channel endpoint. Derived from the API base unless `OWID_WS_URL`
    /// points somewhere else entirely.
    pub fn ws_url(&self) -> AppResult<Url> {
        if let Some(raw) = &self.ws_url_override {
            return Url::parse(raw)
                .map_err(|err| AppError::Config(format!("invalid OWID_WS_URL: {err}")));
        }
        let mut url = self.api_url()?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| AppError::Config("cannot derive a websocket URL from the API base".into()))?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config("API base URL cannot be a base".into()))?
            .push("ws");
        Ok(url)
    }

    pub fn commons_url(&self) -> AppResult<Url> {
        Url::parse(&self.commons_api_url)
            .map_err(|err| AppError::Config(format!("invalid commons API URL: {err}")))
    }

    /// Where settings and the activity journal live: `OWID_DATA_DIR` when
    /// set, otherwise the platform data directory.
    pub fn data_dir(&self) -> AppResult<PathBuf> {
        if let Some(dir) = &self.data_dir_override {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|dir| dir.join("owid-importer"))
            .ok_or_else(|| {
                AppError::Config("no data directory available; set OWID_DATA_DIR".into())
            })
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("OWID_ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_ws_url_from_api_base() {
        let config = AppConfig::default();
        assert_eq!(config.ws_url().unwrap().as_str(), "ws://localhost:8000/ws");

        let secure = AppConfig {
            api_base_url: "https://importer.example.org/".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(
            secure.ws_url().unwrap().as_str(),
            "wss://importer.example.org/ws"
        );
    }

    #[test]
    fn ws_override_wins_over_derivation() {
        let config = AppConfig {
            ws_url_override: Some("ws://elsewhere:9000/push".into()),
            ..AppConfig::default()
        };
        assert_eq!(
            config.ws_url().unwrap().as_str(),
            "ws://elsewhere:9000/push"
        );
    }

    #[test]
    fn data_dir_override_wins() {
        let config = AppConfig {
            data_dir_override: Some(PathBuf::from("/tmp/owid-importer-test")),
            ..AppConfig::default()
        };
        assert_eq!(
            config.data_dir().unwrap(),
            PathBuf::from("/tmp/owid-importer-test")
        );
    }

    #[test]
    fn reads_overrides_from_env() {
        env::set_var("OWID_API_BASE_URL", "http://127.0.0.1:9999");
        env::set_var("OWID_JOURNAL_BATCH_SIZE", "7");
        env::set_var("OWID_JOURNAL_ENABLED", "false");
        env::set_var("OWID_CHANNEL_RECONNECT_ATTEMPTS", "5");

        let config = AppConfig::from_env();
        assert_eq!(config.api_base_url, "http://127.0.0.1:9999");
        assert_eq!(config.journal_batch_size, 7);
        assert!(!config.journal_enabled);
        assert_eq!(config.channel_reconnect_attempts, 5);
        assert_eq!(config.chart_url_prefix, DEFAULT_CHART_URL_PREFIX);
    }
}
