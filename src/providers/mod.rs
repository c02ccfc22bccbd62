use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{DatasetCandidate, DatasetDescriptor, SourceKind};
use crate::error::AtlasregError;

pub mod allen;
pub mod http;
pub mod mouselight;
pub mod neuromorpho;
pub mod url;

pub use allen::AllenAdapter;
pub use mouselight::MouseLightAdapter;
pub use neuromorpho::NeuroMorphoAdapter;
pub use url::UrlAdapter;

pub const DEFAULT_SEARCH_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchQuery {
    /// Structure acronym, e.g. `VISp`.
    pub structure: Option<String>,
    pub species: Option<String>,
    pub cell_type: Option<String>,
    pub limit: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            structure: None,
            species: None,
            cell_type: None,
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

impl SearchQuery {
    pub fn structure(structure: impl Into<String>) -> Self {
        Self {
            structure: Some(structure.into()),
            ..Self::default()
        }
    }
}

/// One upstream dataset source.
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn query(&self, query: &SearchQuery) -> Result<Vec<DatasetCandidate>, AtlasregError>;

    /// Search that never fails: upstream errors become an empty list.
    fn search(&self, query: &SearchQuery) -> Vec<DatasetCandidate> {
        match self.query(query) {
            Ok(mut found) => {
                found.truncate(query.limit);
                info!(source = %self.kind(), found = found.len(), "search finished");
                found
            }
            Err(err) => {
                warn!(source = %self.kind(), error = %err, "search failed");
                Vec::new()
            }
        }
    }

    /// Metadata for one upstream id, without a prior search.
    fn lookup(&self, native_id: &str) -> Result<DatasetCandidate, AtlasregError>;

    /// Fetches the data file of `descriptor` into `destination_dir` and
    /// returns the written path.
    fn download(
        &self,
        descriptor: &DatasetDescriptor,
        destination_dir: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<PathBuf, AtlasregError>;
}

/// Enabled adapters keyed by source.
#[derive(Clone, Default)]
pub struct Providers {
    adapters: BTreeMap<SourceKind, Arc<dyn SourceAdapter>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn insert(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: SourceKind) -> Result<Arc<dyn SourceAdapter>, AtlasregError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| AtlasregError::NotAvailable(format!("source {kind} is not enabled")))
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        self.adapters.keys().copied().collect()
    }

    /// Searches every upstream source, or just `only`. Failing sources
    /// contribute nothing.
    pub fn search(&self, query: &SearchQuery, only: Option<SourceKind>) -> Vec<DatasetCandidate> {
        self.adapters
            .values()
            .filter(|adapter| adapter.kind() != SourceKind::Url)
            .filter(|adapter| only.map(|kind| adapter.kind() == kind).unwrap_or(true))
            .flat_map(|adapter| adapter.search(query))
            .collect()
    }
}

/// Name of the file a descriptor is stored under inside its entry.
pub(crate) fn destination_for(descriptor: &DatasetDescriptor, destination_dir: &Path) -> PathBuf {
    destination_dir.join(&descriptor.file_name)
}

pub(crate) fn require_url<'a>(
    descriptor: &'a DatasetDescriptor,
) -> Result<&'a str, AtlasregError> {
    descriptor
        .url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| AtlasregError::MissingField {
            dataset: descriptor.id.to_string(),
            field: "url".to_string(),
        })
}
