use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::domain::{DatasetCandidate, DatasetDescriptor, SourceKind};
use crate::error::AtlasregError;
use crate::providers::http::{HttpFetcher, copy_with_progress};
use crate::providers::{SearchQuery, SourceAdapter, destination_for, require_url};

/// Direct-URL datasets. Entries come from configuration and are
/// registered up front, so this adapter only transfers files.
/// `file://` URLs are copied from the local filesystem.
#[derive(Debug, Clone)]
pub struct UrlAdapter {
    fetcher: HttpFetcher,
}

impl UrlAdapter {
    pub fn new(timeout: Option<Duration>) -> Result<Self, AtlasregError> {
        Ok(Self {
            fetcher: HttpFetcher::new("Direct URL", timeout)?,
        })
    }
}

impl SourceAdapter for UrlAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Url
    }

    fn query(&self, _query: &SearchQuery) -> Result<Vec<DatasetCandidate>, AtlasregError> {
        Ok(Vec::new())
    }

    fn lookup(&self, native_id: &str) -> Result<DatasetCandidate, AtlasregError> {
        Err(AtlasregError::NotAvailable(format!(
            "url datasets are configured, not looked up: {native_id}"
        )))
    }

    fn download(
        &self,
        descriptor: &DatasetDescriptor,
        destination_dir: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<PathBuf, AtlasregError> {
        let url = require_url(descriptor)?;
        let destination = destination_for(descriptor, destination_dir);
        info!(dataset = %descriptor.id, url, "downloading dataset");
        match url.strip_prefix("file://") {
            Some(local) => copy_local(Path::new(local), &destination, progress)?,
            None => {
                self.fetcher.download_to(url, &destination, progress)?;
            }
        }
        Ok(destination)
    }
}

fn copy_local(
    source: &Path,
    destination: &Path,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<(), AtlasregError> {
    let mut input = File::open(source)
        .map_err(|err| AtlasregError::Filesystem(format!("{}: {err}", source.display())))?;
    let total = input
        .metadata()
        .map(|metadata| metadata.len())
        .unwrap_or(0);
    let mut output =
        File::create(destination).map_err(|err| AtlasregError::Filesystem(err.to_string()))?;
    copy_with_progress(&mut input, &mut output, total, progress)
        .map_err(|err| AtlasregError::Filesystem(err.to_string()))?;
    Ok(())
}
