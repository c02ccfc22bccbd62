use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{
    DEFAULT_MOUSE_ATLAS, DataType, DatasetDescriptor, DatasetId, FileFormat, SourceKind,
    default_atlas_for, normalize_species,
};
use crate::error::AtlasregError;
use crate::providers::DEFAULT_SEARCH_LIMIT;

pub const CONFIG_FILE: &str = "atlasreg.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub cache_root: Option<String>,
    #[serde(default)]
    pub default_atlas: Option<String>,
    #[serde(default)]
    pub search_limit: Option<usize>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub sources: BTreeMap<SourceKind, SourceSettings>,
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceSettings {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
        }
    }
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DatasetEntry {
    Shorthand(String),
    Detailed(DatasetEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatasetEntryObject {
    pub url: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub format: Option<FileFormat>,
    #[serde(default)]
    pub data_type: Option<DataType>,
    #[serde(default)]
    pub species: Option<String>,
    #[serde(default)]
    pub atlas: Option<String>,
    #[serde(default)]
    pub size_mb: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    /// `None` defers to `ATLASREG_CACHE_DIR` or `~/.brainglobe`.
    pub cache_root: Option<Utf8PathBuf>,
    pub default_atlas: String,
    pub search_limit: usize,
    pub http_timeout: Option<Duration>,
    pub sources: BTreeMap<SourceKind, SourceSettings>,
    pub datasets: Vec<DatasetDescriptor>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            cache_root: None,
            default_atlas: DEFAULT_MOUSE_ATLAS.to_string(),
            search_limit: DEFAULT_SEARCH_LIMIT,
            http_timeout: None,
            sources: BTreeMap::new(),
            datasets: Vec::new(),
        }
    }
}

impl ResolvedConfig {
    pub fn source(&self, kind: SourceKind) -> SourceSettings {
        self.sources.get(&kind).cloned().unwrap_or_default()
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `atlasreg.json` in the working directory. Only an
    /// explicit path is required to exist.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, AtlasregError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| AtlasregError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| AtlasregError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, AtlasregError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let default_atlas = config
            .default_atlas
            .filter(|atlas| !atlas.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MOUSE_ATLAS.to_string());
        let search_limit = match config.search_limit {
            Some(0) => {
                return Err(AtlasregError::ConfigParse(
                    "search_limit must be at least 1".to_string(),
                ));
            }
            Some(limit) => limit,
            None => DEFAULT_SEARCH_LIMIT,
        };

        let datasets = config
            .datasets
            .into_iter()
            .map(|entry| match entry {
                DatasetEntry::Shorthand(url) => url_dataset(DatasetEntryObject {
                    url,
                    id: None,
                    name: None,
                    format: None,
                    data_type: None,
                    species: None,
                    atlas: None,
                    size_mb: None,
                }),
                DatasetEntry::Detailed(obj) => url_dataset(obj),
            })
            .collect::<Result<Vec<_>, AtlasregError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            cache_root: config
                .cache_root
                .filter(|root| !root.trim().is_empty())
                .map(Utf8PathBuf::from),
            default_atlas,
            search_limit,
            http_timeout: config.http_timeout_secs.map(Duration::from_secs),
            sources: config.sources,
            datasets,
        })
    }
}

fn url_file_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

fn url_dataset(entry: DatasetEntryObject) -> Result<DatasetDescriptor, AtlasregError> {
    let url = entry.url.trim().to_string();
    if url.is_empty() {
        return Err(AtlasregError::ConfigParse("dataset url is empty".to_string()));
    }
    let file = url_file_name(&url);
    let (stem, ext) = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file, None),
    };

    let (id, native_id) = match entry.id.as_deref() {
        Some(id) => (id.parse::<DatasetId>()?, id.trim().to_string()),
        None if !stem.is_empty() => (DatasetId::for_source(SourceKind::Url, stem), stem.to_string()),
        None => {
            return Err(AtlasregError::ConfigParse(format!(
                "cannot infer a dataset id from {url}"
            )));
        }
    };
    let format = entry
        .format
        .or_else(|| ext.and_then(FileFormat::from_extension))
        .ok_or_else(|| {
            AtlasregError::ConfigParse(format!("cannot infer a file format for {url}"))
        })?;
    let species = normalize_species(entry.species.as_deref().unwrap_or("mouse"));
    let atlas = entry.atlas.or_else(|| default_atlas_for(&species));
    let data_type = entry.data_type.unwrap_or_else(|| format.default_data_type());
    let source = SourceKind::Url;

    Ok(DatasetDescriptor {
        name: entry.name.unwrap_or_else(|| native_id.clone()),
        description: format!(
            "Dataset from {}. Structure: Unknown, Species: {species}",
            source.label()
        ),
        file_name: format!("data.{}", format.extension()),
        id,
        source,
        source_label: source.label().to_string(),
        species,
        atlas,
        data_type,
        format,
        size_mb: entry.size_mb.unwrap_or(0.0),
        native_id,
        structure_area: None,
        structure_name: None,
        url: Some(url),
        source_ids: BTreeMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_shorthand() {
        let config = Config {
            datasets: vec![DatasetEntry::Shorthand(
                "https://example.org/data/injection_site.nrrd?raw=1".to_string(),
            )],
            ..Config::default()
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.default_atlas, DEFAULT_MOUSE_ATLAS);
        assert_eq!(resolved.search_limit, DEFAULT_SEARCH_LIMIT);
        let dataset = &resolved.datasets[0];
        assert_eq!(dataset.id.as_str(), "url_injection_site");
        assert_eq!(dataset.format, FileFormat::Nrrd);
        assert_eq!(dataset.data_type, DataType::Volume);
        assert_eq!(dataset.atlas.as_deref(), Some(DEFAULT_MOUSE_ATLAS));
    }

    #[test]
    fn sources_default_to_enabled() {
        let resolved = ResolvedConfig::default();
        assert!(resolved.source(SourceKind::Allen).enabled);
    }
}
