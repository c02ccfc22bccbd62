use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::atlas::AtlasProvider;
use crate::cache::{CacheMetadata, LocalCache, METADATA_FILE};
use crate::domain::{DatasetDescriptor, DatasetId, DownloadState};
use crate::error::AtlasregError;
use crate::providers::Providers;
use crate::registry::DatasetRegistry;

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOptions {
    /// Re-download and replace an existing entry.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    NotRequested,
    InProgress,
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadAction {
    Downloaded,
    Cached,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutcome {
    pub dataset_id: DatasetId,
    pub action: DownloadAction,
    pub path: Utf8PathBuf,
    pub data_file: Utf8PathBuf,
    pub bytes: u64,
}

type Transfers = Arc<Mutex<HashMap<DatasetId, TransferState>>>;

/// Fetches registered datasets into the local cache.
#[derive(Clone)]
pub struct DownloadManager {
    registry: Arc<DatasetRegistry>,
    cache: LocalCache,
    providers: Providers,
    atlases: Arc<dyn AtlasProvider>,
    transfers: Transfers,
}

impl DownloadManager {
    pub fn new(
        registry: Arc<DatasetRegistry>,
        cache: LocalCache,
        providers: Providers,
        atlases: Arc<dyn AtlasProvider>,
    ) -> Self {
        Self {
            registry,
            cache,
            providers,
            atlases,
            transfers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<DatasetRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn transfer_state(&self, id: &DatasetId) -> TransferState {
        self.transfers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .unwrap_or(TransferState::NotRequested)
    }

    /// Status derived from transfer state, cache contents and atlas
    /// availability.
    pub fn state(&self, id: &DatasetId) -> DownloadState {
        let transfer = self.transfer_state(id);
        if transfer == TransferState::InProgress {
            return DownloadState::Downloading;
        }
        let atlas = match self.registry.lookup(id) {
            Some(descriptor) => descriptor.atlas,
            None => self.cache.read_metadata(id).ok().and_then(|metadata| metadata.atlas),
        };
        if let Some(atlas) = atlas.as_deref() {
            if !self.atlases.is_available(atlas) {
                return DownloadState::AtlasRequired;
            }
        }
        if self.cache.is_downloaded(id) {
            return DownloadState::Downloaded;
        }
        match transfer {
            TransferState::Failed(_) => DownloadState::Failed,
            _ => DownloadState::Available,
        }
    }

    pub fn download(
        &self,
        id: &DatasetId,
        options: DownloadOptions,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<DownloadOutcome, AtlasregError> {
        let descriptor = self
            .registry
            .lookup(id)
            .ok_or_else(|| AtlasregError::NotAvailable(id.to_string()))?;

        if !options.force {
            if let Some(path) = self.cache.dataset_path(id) {
                debug!(dataset = %id, "already cached");
                let data_file = self.cache.data_file(id)?;
                return Ok(DownloadOutcome {
                    dataset_id: id.clone(),
                    action: DownloadAction::Cached,
                    path,
                    bytes: file_len(data_file.as_std_path()),
                    data_file,
                });
            }
        }

        if let Some(atlas) = descriptor.atlas.as_deref() {
            if !self.atlases.is_available(atlas) {
                return Err(AtlasregError::MissingAtlas {
                    dataset: id.to_string(),
                    atlas: atlas.to_string(),
                });
            }
        }

        let guard = InFlight::acquire(&self.transfers, id)?;
        let started = Instant::now();
        info!(dataset = %id, source = %descriptor.source, force = options.force, "download started");
        match self.fetch_into_cache(&descriptor, progress) {
            Ok(outcome) => {
                guard.finish(TransferState::Completed);
                info!(
                    dataset = %id,
                    bytes = outcome.bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "download finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!(dataset = %id, error = %err, "download failed");
                guard.finish(TransferState::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    /// Writes into a staging directory that is discarded on any error and
    /// renamed onto the entry path once the metadata record is in place.
    fn fetch_into_cache(
        &self,
        descriptor: &DatasetDescriptor,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<DownloadOutcome, AtlasregError> {
        let adapter = self.providers.get(descriptor.source)?;
        let staging = self.cache.staging_dir(&descriptor.id)?;
        let written = adapter.download(descriptor, staging.path(), progress)?;
        let file_name = validate_download(descriptor, staging.path(), &written)?;
        let bytes = file_len(&written);

        let metadata = CacheMetadata::from_descriptor(descriptor, &file_name);
        let staging_path = Utf8PathBuf::from_path_buf(staging.path().to_path_buf())
            .map_err(|path| AtlasregError::Filesystem(format!("non UTF-8 path {}", path.display())))?;
        LocalCache::write_metadata(&staging_path.join(METADATA_FILE), &metadata)?;

        let path = self.cache.commit(staging, &descriptor.id)?;
        Ok(DownloadOutcome {
            dataset_id: descriptor.id.clone(),
            action: DownloadAction::Downloaded,
            data_file: path.join(&file_name),
            path,
            bytes,
        })
    }
}

/// Per-id in-flight marker. A second concurrent request for the same id
/// is rejected; the marker is released on every exit path.
struct InFlight<'a> {
    transfers: &'a Transfers,
    id: DatasetId,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn acquire(transfers: &'a Transfers, id: &DatasetId) -> Result<Self, AtlasregError> {
        let mut states = transfers.lock().unwrap_or_else(PoisonError::into_inner);
        if states.get(id) == Some(&TransferState::InProgress) {
            return Err(AtlasregError::DownloadInProgress(id.to_string()));
        }
        states.insert(id.clone(), TransferState::InProgress);
        Ok(Self {
            transfers,
            id: id.clone(),
            finished: false,
        })
    }

    fn finish(mut self, state: TransferState) {
        self.set(state);
        self.finished = true;
    }

    fn set(&self, state: TransferState) {
        self.transfers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.id.clone(), state);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.set(TransferState::Failed("download aborted".to_string()));
        }
    }
}

/// Checks the file an adapter reports and returns its name within the
/// staging directory.
fn validate_download(
    descriptor: &DatasetDescriptor,
    staging: &Path,
    written: &Path,
) -> Result<String, AtlasregError> {
    let invalid = |reason: String| AtlasregError::InvalidDownload {
        dataset: descriptor.id.to_string(),
        reason,
    };
    if written.parent() != Some(staging) {
        return Err(invalid(format!(
            "{} is outside the staging directory",
            written.display()
        )));
    }
    let file_name = written
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| *name != METADATA_FILE)
        .ok_or_else(|| invalid(format!("unusable file name {}", written.display())))?
        .to_string();
    let metadata = fs::metadata(written)
        .map_err(|err| invalid(format!("{}: {err}", written.display())))?;
    if !metadata.is_file() {
        return Err(invalid(format!("{} is not a file", written.display())));
    }
    if metadata.len() == 0 {
        return Err(invalid("downloaded file is empty".to_string()));
    }
    if looks_like_html(written) {
        return Err(invalid("server returned an HTML page".to_string()));
    }
    Ok(file_name)
}

fn looks_like_html(path: &Path) -> bool {
    let mut head = [0u8; 256];
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    let read = file.read(&mut head).unwrap_or(0);
    let text = String::from_utf8_lossy(&head[..read]).to_ascii_lowercase();
    let text = text.trim_start();
    text.starts_with("<!doctype html") || text.starts_with("<html")
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|metadata| metadata.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_error_pages_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("page.swc");
        fs::write(&page, "  <!DOCTYPE html><html><body>404</body></html>").unwrap();
        assert!(looks_like_html(&page));

        let swc = dir.path().join("cell.swc");
        fs::write(&swc, "1 1 0 0 0 1 -1\n").unwrap();
        assert!(!looks_like_html(&swc));
    }
}
