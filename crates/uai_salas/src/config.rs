/// Run configuration: JSON file, then environment overrides
use crate::normalize::{ColumnMap, Normalizer};
use crate::source::{ExportFetcher, FetchError, JsonRowsDecoder, ListingConfig, ListingFetcher, PageFetcher};
use crate::store::{SqliteStore, StoreError, TableNames};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const ENV_CONFIG: &str = "UAI_SALAS_CONFIG";
pub const ENV_DB_URI: &str = "UAI_SALAS_DB_URI";
pub const ENV_SOURCE_URL: &str = "UAI_SALAS_SOURCE_URL";
pub const ENV_EXPORT_PATH: &str = "UAI_SALAS_EXPORT_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Failed to parse config: {message}")]
    Parse { message: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl From<StoreError> for ConfigError {
    fn from(err: StoreError) -> Self {
        ConfigError::Invalid {
            message: err.to_string(),
        }
    }
}

/// Everything a run needs, passed explicitly into the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub source: SourceConfig,
    pub columns: ColumnMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection URI; without one the run only fetches and normalizes
    pub uri: Option<String>,
    pub tables: TableNames,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SourceConfig {
    Listing(ListingConfig),
    Export(ExportConfig),
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Listing(ListingConfig::default())
    }
}

/// Single-shot source reading a JSON rows export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Known location of the export
    pub path: Option<PathBuf>,
    /// Directory a browser download lands in, used when `path` is unset
    pub download_dir: Option<PathBuf>,
    pub wait_secs: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            path: None,
            download_dir: None,
            wait_secs: 30,
        }
    }
}

impl PipelineConfig {
    /// Parses a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Loads from `path` (if any), overlays the process environment and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(uri) = non_empty(ENV_DB_URI) {
            self.store.uri = Some(uri);
        }

        match (non_empty(ENV_SOURCE_URL), non_empty(ENV_EXPORT_PATH)) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid {
                    message: format!("{ENV_SOURCE_URL} and {ENV_EXPORT_PATH} are mutually exclusive"),
                });
            }
            (Some(url), None) => {
                if !matches!(self.source, SourceConfig::Listing(_)) {
                    self.source = SourceConfig::default();
                }
                if let SourceConfig::Listing(listing) = &mut self.source {
                    listing.base_url = url;
                }
            }
            (None, Some(path)) => {
                let wait_secs = match &self.source {
                    SourceConfig::Export(export) => export.wait_secs,
                    SourceConfig::Listing(_) => ExportConfig::default().wait_secs,
                };
                self.source = SourceConfig::Export(ExportConfig {
                    path: Some(PathBuf::from(path)),
                    download_dir: None,
                    wait_secs,
                });
            }
            (None, None) => {}
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.tables.validate()?;

        match &self.source {
            SourceConfig::Listing(listing) => {
                Url::parse(&listing.base_url).map_err(|e| ConfigError::Invalid {
                    message: format!("listing base_url `{}`: {}", listing.base_url, e),
                })?;
                if listing.page_param.trim().is_empty() {
                    return Err(ConfigError::Invalid {
                        message: "listing page_param is empty".to_string(),
                    });
                }
                if listing.max_pages == 0 {
                    return Err(ConfigError::Invalid {
                        message: "listing max_pages must be at least 1".to_string(),
                    });
                }
            }
            SourceConfig::Export(export) => {
                if export.path.is_none() && export.download_dir.is_none() {
                    return Err(ConfigError::Invalid {
                        message: "export source needs a path or a download_dir".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn normalizer(&self) -> Normalizer {
        Normalizer::new(self.columns.clone())
    }

    /// Builds the page source the config selects.
    pub fn build_fetcher(&self) -> Result<Box<dyn PageFetcher>, FetchError> {
        let fetcher: Box<dyn PageFetcher> = match &self.source {
            SourceConfig::Listing(listing) => Box::new(ListingFetcher::new(listing.clone())?),
            SourceConfig::Export(export) => match (&export.path, &export.download_dir) {
                (Some(path), _) => Box::new(ExportFetcher::from_file(path, Box::new(JsonRowsDecoder))),
                (None, Some(dir)) => Box::new(ExportFetcher::from_download_dir(
                    dir,
                    Box::new(JsonRowsDecoder),
                    Duration::from_secs(export.wait_secs),
                )),
                (None, None) => {
                    return Err(FetchError::Decode {
                        message: "export source has no location".to_string(),
                    })
                }
            },
        };
        Ok(fetcher)
    }

    /// Builds the store when a URI is configured. Does not connect.
    pub fn build_store(&self) -> Result<Option<SqliteStore>, StoreError> {
        self.store
            .uri
            .as_deref()
            .map(|uri| SqliteStore::new(uri, self.store.tables.clone()))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert!(config.store.uri.is_none());
        assert_eq!(config.store.tables.snapshot, "eventos");
        assert_eq!(config.store.tables.cumulative, "all_eventos");
        assert!(matches!(config.source, SourceConfig::Listing(ref l) if l.request_delay_ms == 1500));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = PipelineConfig::from_json(
            r#"{
                "store": { "uri": "sqlite://salas.db", "tables": { "snapshot": "hoy" } },
                "source": { "mode": "export", "download_dir": "/tmp/descargas" },
                "columns": { "room": { "header": "Sala Asignada", "index": null } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.store.uri.as_deref(), Some("sqlite://salas.db"));
        assert_eq!(config.store.tables.snapshot, "hoy");
        assert_eq!(config.store.tables.cumulative, "all_eventos");
        let SourceConfig::Export(export) = &config.source else {
            panic!("expected export source");
        };
        assert_eq!(export.wait_secs, 30);
        assert_eq!(config.columns.room.header, "Sala Asignada");
        assert_eq!(config.columns.title.header, "Evento");
        config.validate().unwrap();
    }

    #[test]
    fn test_malformed_json_is_a_parse_error() {
        assert!(matches!(
            PipelineConfig::from_json("{ store: "),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides_store_and_source() {
        let mut config = PipelineConfig::default();
        config
            .apply_env(env(&[
                (ENV_DB_URI, "sqlite::memory:"),
                (ENV_EXPORT_PATH, "/data/eventos.json"),
            ]))
            .unwrap();

        assert_eq!(config.store.uri.as_deref(), Some("sqlite::memory:"));
        let SourceConfig::Export(export) = &config.source else {
            panic!("expected export source");
        };
        assert_eq!(export.path.as_deref(), Some(Path::new("/data/eventos.json")));
    }

    #[test]
    fn test_source_url_keeps_listing_settings() {
        let mut config = PipelineConfig::from_json(r#"{"source": {"mode": "listing", "max_pages": 5}}"#).unwrap();
        config
            .apply_env(env(&[(ENV_SOURCE_URL, "http://localhost:8080/eventos")]))
            .unwrap();

        let SourceConfig::Listing(listing) = &config.source else {
            panic!("expected listing source");
        };
        assert_eq!(listing.base_url, "http://localhost:8080/eventos");
        assert_eq!(listing.max_pages, 5);
    }

    #[test]
    fn test_conflicting_sources_rejected() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_env(env(&[(ENV_SOURCE_URL, "http://x/"), (ENV_EXPORT_PATH, "e.json")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = PipelineConfig::default();
        config.store.tables.cumulative = "all eventos".to_string();
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            source: SourceConfig::Export(ExportConfig::default()),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_only_built_with_uri() {
        let mut config = PipelineConfig::default();
        assert!(config.build_store().unwrap().is_none());

        config.store.uri = Some(":memory:".to_string());
        assert!(config.build_store().unwrap().is_some());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("salas.json");
        std::fs::write(&path, r#"{"store": {"tables": {"cumulative": "historico"}}}"#).unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.store.tables.cumulative, "historico");

        let missing = PipelineConfig::from_file(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
