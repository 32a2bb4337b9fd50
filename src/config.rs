use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalogue::HttpSettings;
use crate::domain::IngestMode;
use crate::error::IngestError;
use crate::manifest::DEFAULT_MANIFEST_NAME;
use crate::storage::DEFAULT_COMMIT_MESSAGE;

pub const LOCAL_CONFIG_NAME: &str = "loris-ingest.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub get: Option<bool>,
    #[serde(default)]
    pub manifest: Option<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub http: Option<HttpSettings>,
}

/// Values given on the command line. `None` / empty means "not given".
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub api_base: Option<String>,
    pub dataset: Option<String>,
    pub get: bool,
    pub manifest: Option<String>,
    pub projects: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub api_base: Option<String>,
    pub dataset: Utf8PathBuf,
    pub mode: IngestMode,
    pub manifest_name: String,
    pub projects: Vec<String>,
    pub commit_message: String,
    pub http: HttpSettings,
}

impl ResolvedConfig {
    pub fn api_base(&self) -> Result<&str, IngestError> {
        self.api_base
            .as_deref()
            .ok_or(IngestError::MissingSetting("api_base"))
    }

    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.dataset.join(&self.manifest_name)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(
        path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, IngestError> {
        let config = match path {
            Some(path) => Self::read(PathBuf::from(path))?,
            None => match Self::implicit_path() {
                Some(found) => Self::read(found)?,
                None => Config::default(),
            },
        };
        Self::resolve_config(config, overrides)
    }

    pub fn resolve_config(
        config: Config,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, IngestError> {
        let api_base = overrides
            .api_base
            .or(config.api_base)
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty());

        let dataset = overrides
            .dataset
            .or(config.dataset)
            .filter(|value| !value.trim().is_empty())
            .ok_or(IngestError::MissingSetting("dataset"))?;

        let manifest_name = overrides
            .manifest
            .or(config.manifest)
            .unwrap_or_else(|| DEFAULT_MANIFEST_NAME.to_string());
        if manifest_name.is_empty() || manifest_name.contains(['/', '\\']) {
            return Err(IngestError::ConfigParse(format!(
                "manifest must be a plain file name, got {manifest_name:?}"
            )));
        }

        let projects = if overrides.projects.is_empty() {
            config.projects
        } else {
            overrides.projects
        };

        Ok(ResolvedConfig {
            api_base,
            dataset: Utf8PathBuf::from(dataset),
            mode: IngestMode::from_get_flag(overrides.get || config.get.unwrap_or(false)),
            manifest_name,
            projects,
            commit_message: config
                .commit_message
                .unwrap_or_else(|| DEFAULT_COMMIT_MESSAGE.to_string()),
            http: config.http.unwrap_or_default(),
        })
    }

    fn read(path: PathBuf) -> Result<Config, IngestError> {
        debug!(path = %path.display(), "reading config");
        let content = fs::read_to_string(&path).map_err(|_| IngestError::ConfigRead(path.clone()))?;
        serde_json::from_str(&content).map_err(|err| IngestError::ConfigParse(err.to_string()))
    }

    fn implicit_path() -> Option<PathBuf> {
        let local = PathBuf::from(LOCAL_CONFIG_NAME);
        if local.exists() {
            return Some(local);
        }
        let dirs = ProjectDirs::from("org", "loris", "loris-ingest")?;
        let global = dirs.config_dir().join("config.json");
        global.exists().then_some(global)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_override_file_values() {
        let config = Config {
            api_base: Some("https://file.example/api/v0.0.3/".to_string()),
            dataset: Some("/data/file".to_string()),
            projects: vec!["Pumpernickel".to_string()],
            ..Default::default()
        };
        let overrides = ConfigOverrides {
            dataset: Some("/data/cli".to_string()),
            get: true,
            ..Default::default()
        };

        let resolved = ConfigLoader::resolve_config(config, overrides).unwrap();
        assert_eq!(resolved.api_base().unwrap(), "https://file.example/api/v0.0.3");
        assert_eq!(resolved.dataset, Utf8PathBuf::from("/data/cli"));
        assert_eq!(resolved.mode, IngestMode::Eager);
        assert_eq!(resolved.projects, vec!["Pumpernickel".to_string()]);
        assert_eq!(resolved.manifest_name, DEFAULT_MANIFEST_NAME);
        assert_eq!(resolved.http, HttpSettings::default());
    }
}
