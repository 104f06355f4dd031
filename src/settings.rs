use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{AppError, AppResult};
use crate::models::OverwriteBehaviour;

const DEFAULT_MAP_FILE_NAME: &str = "$NAME, $REGION, $YEAR.svg";
const DEFAULT_CHART_FILE_NAME: &str = "$NAME, $START_YEAR to $END_YEAR, $REGION.svg";
const DEFAULT_TEMPLATE_NAME: &str = "$CHART_NAME";

const DEFAULT_MAP_DESCRIPTION: &str = r#"=={{int:filedesc}}==
{{Information
|description={{en|1=$TITLE, $REGION}}
|author = Our World In Data
|date= $YEAR
|source = $URL
|permission = "License: All of Our World in Data is completely open access and all work is licensed under the Creative Commons BY license. You have the permission to use, distribute, and reproduce in any medium, provided the source and authors are credited."
|other versions =
}}
{{Map showing old data|year=$YEAR}}
=={{int:license-header}}==
{{cc-by-4.0}}
"#;

const DEFAULT_CHART_DESCRIPTION: &str = r#"=={{int:filedesc}}==
{{Information
|description={{en|1=$TITLE, $REGION}}
|author = Our World In Data
|date= $END_YEAR
|source = $URL
|permission = "License: All of Our World in Data is completely open access and all work is licensed under the Creative Commons BY license. You have the permission to use, distribute, and reproduce in any medium, provided the source and authors are credited."
|other versions =
}}
=={{int:license-header}}==
{{cc-by-4.0}}
"#;

/// Templates and flags used to prefill new import drafts. Placeholders like
/// `$NAME`, `$REGION` and `$YEAR` are substituted by the server during the
/// actual upload run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSettings {
    pub file_name_format: String,
    pub description_template: String,
    pub categories: Vec<String>,
    pub description_overwrite_behaviour: OverwriteBehaviour,
    pub country_file_name_format: String,
    pub country_description_template: String,
    pub country_categories: Vec<String>,
    pub country_description_overwrite_behaviour: OverwriteBehaviour,
    pub template_name_format: String,
    pub import_countries: bool,
    pub generate_template_commons: bool,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            file_name_format: DEFAULT_MAP_FILE_NAME.to_string(),
            description_template: DEFAULT_MAP_DESCRIPTION.to_string(),
            categories: vec![
                "$YEAR maps of {{subst:#ifeq:$REGION|World|the world|$REGION}}".to_string(),
                "SVG maps by Our World in Data".to_string(),
                "Uploaded by OWID importer tool".to_string(),
            ],
            description_overwrite_behaviour: OverwriteBehaviour::All,
            country_file_name_format: DEFAULT_CHART_FILE_NAME.to_string(),
            country_description_template: DEFAULT_CHART_DESCRIPTION.to_string(),
            country_categories: vec!["Uploaded by OWID importer tool".to_string()],
            country_description_overwrite_behaviour: OverwriteBehaviour::All,
            template_name_format: DEFAULT_TEMPLATE_NAME.to_string(),
            import_countries: true,
            generate_template_commons: true,
        }
    }
}

impl ImportSettings {
    pub fn load(path: &Path) -> AppResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(settings) => Ok(settings),
                Err(err) => {
                    warn!(
                        target: "settings",
                        error = ?err,
                        "failed to parse import settings; regenerating defaults"
                    );
                    let defaults = Self::default();
                    defaults.persist(path)?;
                    Ok(defaults)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let defaults = Self::default();
                defaults.persist(path)?;
                Ok(defaults)
            }
            Err(err) => Err(AppError::Io(err)),
        }
    }

    pub fn persist(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("import-settings.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_defaults_when_file_missing() {
        let dir = tempdir().unwrap();
        let path = settings_path(dir.path());

        let settings = ImportSettings::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(settings.file_name_format, DEFAULT_MAP_FILE_NAME);
        assert_eq!(settings.categories.len(), 3);
        assert!(settings.description_template.contains("{{cc-by-4.0}}"));
        assert!(settings.import_countries);
    }

    #[test]
    fn regenerates_defaults_from_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = settings_path(dir.path());
        fs::write(&path, "{ not json").unwrap();

        let settings = ImportSettings::load(&path).unwrap();
        assert_eq!(settings.template_name_format, DEFAULT_TEMPLATE_NAME);

        let reread = fs::read_to_string(&path).unwrap();
        assert!(serde_json::from_str::<ImportSettings>(&reread).is_ok());
    }

    #[test]
    fn persists_edits() {
        let dir = tempdir().unwrap();
        let path = settings_path(dir.path());

        let mut settings = ImportSettings::load(&path).unwrap();
        settings.import_countries = false;
        settings.categories = vec!["Custom category".to_string()];
        settings.persist(&path).unwrap();

        let roundtrip = ImportSettings::load(&path).unwrap();
        assert!(!roundtrip.import_countries);
        assert_eq!(roundtrip.categories, vec!["Custom category"]);
    }
}
