//! Atlas bookkeeping: which atlas versions are cached locally, which are
//! the latest upstream, and the read-only frame a cached atlas exposes.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use regex::Regex;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{LocalCache, METADATA_FILE};
use crate::domain::AtlasFrame;
use crate::error::AtlasregError;
use crate::providers::http::HttpFetcher;

pub const STRUCTURES_FILE: &str = "structures.json";
pub const LAST_VERSIONS_URL: &str =
    "https://gin.g-node.org/brainglobe/atlases/raw/master/last_versions.conf";

/// Read-only access to atlases, as consumed by the pipeline.
pub trait AtlasProvider: Send + Sync {
    fn is_available(&self, atlas_name: &str) -> bool;
    fn frame(&self, atlas_name: &str) -> Result<AtlasFrame, AtlasregError>;
}

/// Where the latest published version of each atlas comes from.
pub trait LatestVersions: Send + Sync {
    fn latest_versions(&self) -> Result<BTreeMap<String, String>, AtlasregError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AtlasStatus {
    NotDownloaded,
    UpToDate { version: String },
    UpdateAvailable { local: String, latest: String },
    /// A local copy exists but no latest version is known.
    Unknown { local: String },
}

#[derive(Debug, Clone, Deserialize)]
struct AtlasMetadataFile {
    #[serde(default)]
    name: Option<String>,
    resolution: Vec<f64>,
    shape: Vec<usize>,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtlasStructure {
    pub acronym: String,
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub structure_id_path: Vec<u64>,
    #[serde(default)]
    pub rgb_triplet: Vec<u8>,
}

/// Disk-backed atlas tracker over the cache layout.
#[derive(Clone)]
pub struct AtlasTracker {
    cache: LocalCache,
    latest: Arc<dyn LatestVersions>,
}

impl AtlasTracker {
    pub fn new(cache: LocalCache, latest: Arc<dyn LatestVersions>) -> Self {
        Self { cache, latest }
    }

    /// Highest locally cached version of `atlas_name`.
    pub fn local_version(&self, atlas_name: &str) -> Option<String> {
        let pattern = Regex::new(&format!(r"^{}_v(\d+(?:\.\d+)*)$", regex::escape(atlas_name)))
            .ok()?;
        let entries = fs::read_dir(self.cache.root().as_std_path()).ok()?;
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                pattern
                    .captures(&name)
                    .and_then(|caps| caps.get(1))
                    .map(|version| version.as_str().to_string())
            })
            .max_by(|a, b| compare_versions(a, b))
    }

    pub fn latest_version(&self, atlas_name: &str) -> Option<String> {
        match self.latest.latest_versions() {
            Ok(versions) => versions.get(atlas_name).cloned(),
            Err(err) => {
                warn!(atlas = atlas_name, error = %err, "unable to resolve latest atlas version");
                None
            }
        }
    }

    pub fn status(&self, atlas_name: &str) -> AtlasStatus {
        let Some(local) = self.local_version(atlas_name) else {
            return AtlasStatus::NotDownloaded;
        };
        match self.latest_version(atlas_name) {
            Some(latest) if latest == local => AtlasStatus::UpToDate { version: local },
            Some(latest) => AtlasStatus::UpdateAvailable { local, latest },
            None => AtlasStatus::Unknown { local },
        }
    }

    pub fn needs_update(&self, atlas_name: &str) -> bool {
        matches!(self.status(atlas_name), AtlasStatus::UpdateAvailable { .. })
    }

    pub fn atlas_dir(&self, atlas_name: &str) -> Option<Utf8PathBuf> {
        let version = self.local_version(atlas_name)?;
        Some(self.cache.root().join(format!("{atlas_name}_v{version}")))
    }

    pub fn structures(&self, atlas_name: &str) -> Result<Vec<AtlasStructure>, AtlasregError> {
        let dir = self.atlas_dir(atlas_name).ok_or_else(|| missing_atlas(atlas_name))?;
        let path = dir.join(STRUCTURES_FILE);
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| AtlasregError::AtlasMetadata(format!("{path}: {err}")))?;
        serde_json::from_str(&content)
            .map_err(|err| AtlasregError::AtlasMetadata(format!("{path}: {err}")))
    }
}

impl AtlasProvider for AtlasTracker {
    fn is_available(&self, atlas_name: &str) -> bool {
        self.atlas_dir(atlas_name)
            .map(|dir| dir.join(METADATA_FILE).as_std_path().is_file())
            .unwrap_or(false)
    }

    fn frame(&self, atlas_name: &str) -> Result<AtlasFrame, AtlasregError> {
        let dir = self.atlas_dir(atlas_name).ok_or_else(|| missing_atlas(atlas_name))?;
        let path = dir.join(METADATA_FILE);
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| AtlasregError::AtlasMetadata(format!("{path}: {err}")))?;
        let metadata: AtlasMetadataFile = serde_json::from_str(&content)
            .map_err(|err| AtlasregError::AtlasMetadata(format!("{path}: {err}")))?;
        let resolution: [f64; 3] = metadata.resolution.as_slice().try_into().map_err(|_| {
            AtlasregError::AtlasMetadata(format!(
                "{path}: expected 3 resolution values, got {}",
                metadata.resolution.len()
            ))
        })?;
        let shape: [usize; 3] = metadata.shape.as_slice().try_into().map_err(|_| {
            AtlasregError::AtlasMetadata(format!(
                "{path}: expected a 3D shape, got {} axes",
                metadata.shape.len()
            ))
        })?;
        let frame = AtlasFrame {
            name: metadata.name.unwrap_or_else(|| atlas_name.to_string()),
            resolution,
            shape,
            version: metadata
                .version
                .or_else(|| self.local_version(atlas_name))
                .unwrap_or_default(),
        };
        frame.validate()?;
        Ok(frame)
    }
}

fn missing_atlas(atlas_name: &str) -> AtlasregError {
    AtlasregError::AtlasMetadata(format!("atlas {atlas_name} is not downloaded"))
}

/// Compares dotted numeric versions (`1.10` > `1.2`).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |value: &str| -> Vec<u64> {
        value
            .split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect()
    };
    parse(a).cmp(&parse(b))
}

/// Parses the `[atlases]` section of a BrainGlobe `last_versions.conf`.
pub fn parse_last_versions(content: &str) -> BTreeMap<String, String> {
    let mut in_atlases = false;
    let mut versions = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            in_atlases = &line[1..line.len() - 1] == "atlases";
            continue;
        }
        if !in_atlases {
            continue;
        }
        if let Some((name, version)) = line.split_once('=') {
            versions.insert(name.trim().to_string(), version.trim().to_string());
        }
    }
    versions
}

/// Fetches `last_versions.conf` over HTTP.
#[derive(Clone)]
pub struct HttpLatestVersions {
    fetcher: HttpFetcher,
    url: String,
}

impl HttpLatestVersions {
    pub fn new(timeout: Option<Duration>) -> Result<Self, AtlasregError> {
        Ok(Self {
            fetcher: HttpFetcher::new("BrainGlobe", timeout)?,
            url: LAST_VERSIONS_URL.to_string(),
        })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn client(&self) -> &Client {
        self.fetcher.client()
    }
}

impl LatestVersions for HttpLatestVersions {
    fn latest_versions(&self) -> Result<BTreeMap<String, String>, AtlasregError> {
        let text = self.fetcher.get_text(&self.url)?;
        Ok(parse_last_versions(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(compare_versions("1.10", "1.2"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2"), Ordering::Equal);
        assert_eq!(compare_versions("0.9", "1.0"), Ordering::Less);
    }

    #[test]
    fn last_versions_only_reads_atlas_section() {
        let content = "[brainglobe]\nversion = 9\n\n[atlases]\nallen_mouse_25um = 1.2\nexample_mouse_100um=1.2\n";
        let versions = parse_last_versions(content);
        assert_eq!(versions.len(), 2);
        assert_eq!(versions.get("allen_mouse_25um").map(String::as_str), Some("1.2"));
        assert!(!versions.contains_key("version"));
    }
}
