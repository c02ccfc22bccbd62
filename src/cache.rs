use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tempfile::{Builder, TempDir};
use tracing::warn;

use crate::domain::{DataType, DatasetDescriptor, DatasetId, FileFormat, SourceKind};
use crate::error::AtlasregError;

pub const METADATA_FILE: &str = "metadata.json";
pub const CACHE_DIR_ENV: &str = "ATLASREG_CACHE_DIR";

/// On-disk cache: `<root>/datasets/<id>/{metadata.json, <data file>}` plus
/// atlas directories `<root>/<atlas>_v<version>/`.
#[derive(Debug, Clone)]
pub struct LocalCache {
    root: Utf8PathBuf,
}

impl LocalCache {
    /// Resolves the cache root from `ATLASREG_CACHE_DIR`, falling back to
    /// `~/.brainglobe`.
    pub fn new() -> Result<Self, AtlasregError> {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            if !dir.trim().is_empty() {
                return Ok(Self::new_with_root(Utf8PathBuf::from(dir.trim())));
            }
        }
        let root = BaseDirs::new()
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join(".brainglobe")).ok())
            .ok_or_else(|| {
                AtlasregError::Filesystem("unable to resolve cache directory".to_string())
            })?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn datasets_dir(&self) -> Utf8PathBuf {
        self.root.join("datasets")
    }

    pub fn dataset_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.datasets_dir().join(id.as_str())
    }

    pub fn metadata_path(&self, id: &DatasetId) -> Utf8PathBuf {
        self.dataset_dir(id).join(METADATA_FILE)
    }

    pub fn ensure_datasets_dir(&self) -> Result<(), AtlasregError> {
        fs::create_dir_all(self.datasets_dir().as_std_path())
            .map_err(|err| AtlasregError::Filesystem(format!("{}: {err}", self.datasets_dir())))
    }

    /// Directory of a valid cache entry: the metadata record and the data
    /// file it references both exist.
    pub fn dataset_path(&self, id: &DatasetId) -> Option<Utf8PathBuf> {
        let dir = self.dataset_dir(id);
        match read_entry(&dir) {
            Ok(Some(_)) => Some(dir),
            Ok(None) => None,
            Err(err) => {
                warn!(dataset = %id, error = %err, "ignoring unreadable cache entry");
                None
            }
        }
    }

    pub fn is_downloaded(&self, id: &DatasetId) -> bool {
        self.dataset_path(id).is_some()
    }

    pub fn read_metadata(&self, id: &DatasetId) -> Result<CacheMetadata, AtlasregError> {
        let dir = self.dataset_dir(id);
        match read_entry(&dir)? {
            Some(metadata) => Ok(metadata),
            None => Err(AtlasregError::NotDownloaded(id.to_string())),
        }
    }

    /// Path of the data file of a valid entry.
    pub fn data_file(&self, id: &DatasetId) -> Result<Utf8PathBuf, AtlasregError> {
        let metadata = self.read_metadata(id)?;
        Ok(self.dataset_dir(id).join(&metadata.file_name))
    }

    /// Metadata of every valid entry. Unreadable or incomplete entries are
    /// skipped with a warning.
    pub fn list_downloaded(&self) -> Result<Vec<CacheMetadata>, AtlasregError> {
        let datasets_dir = self.datasets_dir();
        if !datasets_dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(datasets_dir.as_std_path())
            .map_err(|err| AtlasregError::Filesystem(format!("{datasets_dir}: {err}")))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| AtlasregError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if !path.is_dir() || is_staging_name(path.file_name().unwrap_or_default()) {
                continue;
            }
            match read_entry(&path) {
                Ok(Some(metadata)) => found.push(metadata),
                Ok(None) => {}
                Err(err) => warn!(path = %path, error = %err, "skipping unreadable cache entry"),
            }
        }
        found.sort_by(|a, b| a.dataset_id.cmp(&b.dataset_id));
        Ok(found)
    }

    /// Deletes an entry. Returns whether anything was removed.
    pub fn remove(&self, id: &DatasetId) -> Result<bool, AtlasregError> {
        let dir = self.dataset_dir(id);
        if !dir.as_std_path().exists() {
            return Ok(false);
        }
        fs::remove_dir_all(dir.as_std_path())
            .map_err(|err| AtlasregError::Filesystem(format!("{dir}: {err}")))?;
        Ok(true)
    }

    /// Fresh hidden directory inside `datasets/`, removed on drop unless
    /// committed.
    pub fn staging_dir(&self, id: &DatasetId) -> Result<TempDir, AtlasregError> {
        self.ensure_datasets_dir()?;
        Builder::new()
            .prefix(&format!("{STAGING_PREFIX}{}-", id.as_str()))
            .tempdir_in(self.datasets_dir().as_std_path())
            .map_err(|err| AtlasregError::Filesystem(err.to_string()))
    }

    /// Moves a fully written staging directory onto the entry path,
    /// replacing any previous entry.
    pub fn commit(&self, staging: TempDir, id: &DatasetId) -> Result<Utf8PathBuf, AtlasregError> {
        let target = self.dataset_dir(id);
        let staged = staging.keep();
        if let Err(err) = atomic_rename_dir(&staged, target.as_std_path()) {
            let _ = fs::remove_dir_all(&staged);
            return Err(AtlasregError::Filesystem(format!("{target}: {err}")));
        }
        Ok(target)
    }

    pub fn write_metadata(path: &Utf8Path, metadata: &CacheMetadata) -> Result<(), AtlasregError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| AtlasregError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(metadata)
            .map_err(|err| AtlasregError::Filesystem(err.to_string()))?;
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| AtlasregError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| AtlasregError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

const STAGING_PREFIX: &str = ".staging-";

fn is_staging_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX)
}

/// `Ok(None)` when the entry is absent or incomplete, `Err` when the
/// metadata exists but cannot be read.
fn read_entry(dir: &Utf8Path) -> Result<Option<CacheMetadata>, AtlasregError> {
    let metadata_path = dir.join(METADATA_FILE);
    if !metadata_path.as_std_path().is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(metadata_path.as_std_path())
        .map_err(|err| AtlasregError::Filesystem(format!("{metadata_path}: {err}")))?;
    let metadata: CacheMetadata = serde_json::from_str(&content)
        .map_err(|err| AtlasregError::Filesystem(format!("{metadata_path}: {err}")))?;
    if metadata.file_name.is_empty() || metadata.file_name.contains(['/', '\\']) {
        return Err(AtlasregError::Filesystem(format!(
            "{metadata_path}: invalid file_name {:?}",
            metadata.file_name
        )));
    }
    if !dir.join(&metadata.file_name).as_std_path().is_file() {
        return Ok(None);
    }
    Ok(Some(metadata))
}

/// Renames `from` onto `to`. An existing `to` is moved aside first and
/// restored if the rename fails, so a failed replace keeps the old entry.
pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if !to.exists() {
        return fs::rename(from, to);
    }
    let name = to
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let aside = to.with_file_name(format!("{STAGING_PREFIX}replaced-{name}"));
    if aside.exists() {
        fs::remove_dir_all(&aside)?;
    }
    fs::rename(to, &aside)?;
    if let Err(err) = fs::rename(from, to) {
        if let Err(restore) = fs::rename(&aside, to) {
            warn!(path = %to.display(), error = %restore, "previous entry could not be restored");
        }
        return Err(err);
    }
    if let Err(err) = fs::remove_dir_all(&aside) {
        warn!(path = %aside.display(), error = %err, "replaced entry was not removed");
    }
    Ok(())
}

/// The persisted record of one cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub dataset_id: DatasetId,
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub atlas: Option<String>,
    #[serde(default = "unknown")]
    pub species: String,
    pub data_type: DataType,
    pub format: FileFormat,
    pub file_name: String,
    #[serde(default)]
    pub size_mb: f64,
    #[serde(default)]
    pub api_source: Option<SourceKind>,
    #[serde(default)]
    pub neuron_id: Option<String>,
    #[serde(default)]
    pub structure_area: Option<String>,
    #[serde(default)]
    pub structure_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub source_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub downloaded_at: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
}

fn unknown() -> String {
    "unknown".to_string()
}

impl CacheMetadata {
    pub fn from_descriptor(descriptor: &DatasetDescriptor, file_name: &str) -> Self {
        Self {
            dataset_id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            source: descriptor.source_label.clone(),
            atlas: descriptor.atlas.clone(),
            species: descriptor.species.clone(),
            data_type: descriptor.data_type,
            format: descriptor.format,
            file_name: file_name.to_string(),
            size_mb: descriptor.size_mb,
            api_source: Some(descriptor.source),
            neuron_id: (descriptor.source != SourceKind::Url).then(|| descriptor.native_id.clone()),
            structure_area: descriptor.structure_area.clone(),
            structure_name: descriptor.structure_name.clone(),
            description: Some(descriptor.description.clone()),
            url: descriptor.url.clone(),
            source_ids: descriptor.source_ids.clone(),
            downloaded_at: Some(chrono::Utc::now().to_rfc3339()),
            tool: Some(format!("atlasreg/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    /// Rebuilds a registry descriptor from a cached record, so entries
    /// downloaded by an earlier process stay addressable.
    pub fn to_descriptor(&self) -> DatasetDescriptor {
        let source = self.api_source.unwrap_or(SourceKind::Url);
        DatasetDescriptor {
            id: self.dataset_id.clone(),
            name: self.name.clone(),
            source,
            source_label: self.source.clone(),
            description: self.description.clone().unwrap_or_default(),
            species: self.species.clone(),
            atlas: self.atlas.clone(),
            data_type: self.data_type,
            format: self.format,
            size_mb: self.size_mb,
            native_id: self
                .neuron_id
                .clone()
                .unwrap_or_else(|| self.dataset_id.to_string()),
            file_name: self.file_name.clone(),
            structure_area: self.structure_area.clone(),
            structure_name: self.structure_name.clone(),
            url: self.url.clone(),
            source_ids: self.source_ids.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let cache = LocalCache::new_with_root(Utf8PathBuf::from("/tmp/atlasreg-root"));
        let id: DatasetId = "allen_12345".parse().unwrap();
        assert!(cache.metadata_path(&id).ends_with("datasets/allen_12345/metadata.json"));
    }

    #[test]
    fn failed_replace_keeps_previous_entry() {
        let temp = tempfile::tempdir().unwrap();
        let entry = temp.path().join("allen_1");
        fs::create_dir_all(&entry).unwrap();
        fs::write(entry.join("1.swc"), "old").unwrap();

        let missing = temp.path().join(".staging-allen_1-gone");
        assert!(atomic_rename_dir(&missing, &entry).is_err());
        assert_eq!(fs::read_to_string(entry.join("1.swc")).unwrap(), "old");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn replace_leaves_no_aside_directory() {
        let temp = tempfile::tempdir().unwrap();
        let entry = temp.path().join("allen_1");
        let staged = temp.path().join(".staging-allen_1-new");
        fs::create_dir_all(&entry).unwrap();
        fs::create_dir_all(&staged).unwrap();
        fs::write(entry.join("1.swc"), "old").unwrap();
        fs::write(staged.join("1.swc"), "new").unwrap();

        atomic_rename_dir(&staged, &entry).unwrap();
        assert_eq!(fs::read_to_string(entry.join("1.swc")).unwrap(), "new");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn staging_names_are_hidden_from_listing() {
        assert!(is_staging_name(".staging-allen_1-abc"));
        assert!(!is_staging_name("allen_1"));
    }
}
