use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::domain::{DatasetCandidate, DatasetDescriptor, SourceKind};
use crate::error::AtlasregError;
use crate::providers::http::HttpFetcher;
use crate::providers::{SearchQuery, SourceAdapter, destination_for};

pub const MOUSELIGHT_BASE: &str = "https://ml-neuronbrowser.janelia.org";
pub const MOUSELIGHT_FILE_BASE: &str =
    "https://raw.githubusercontent.com/brainglobe/morphapi/master/examples/example_files";

const NEURONS_QUERY: &str = "query { searchNeurons { totalCount neurons { id idString brainArea { acronym name } } } }";

/// Janelia MouseLight neuron browser.
#[derive(Debug, Clone)]
pub struct MouseLightAdapter {
    fetcher: HttpFetcher,
    base_url: String,
    file_base: String,
}

impl MouseLightAdapter {
    pub fn new(base_url: Option<&str>, timeout: Option<Duration>) -> Result<Self, AtlasregError> {
        Ok(Self {
            fetcher: HttpFetcher::new("Janelia MouseLight", timeout)?,
            base_url: base_url
                .unwrap_or(MOUSELIGHT_BASE)
                .trim_end_matches('/')
                .to_string(),
            file_base: MOUSELIGHT_FILE_BASE.to_string(),
        })
    }

    pub fn with_file_base(mut self, file_base: impl Into<String>) -> Self {
        self.file_base = file_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn swc_url(&self, neuron_id: &str) -> String {
        format!("{}/{}.swc", self.file_base, neuron_id.to_lowercase())
    }
}

impl SourceAdapter for MouseLightAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::MouseLight
    }

    fn query(&self, query: &SearchQuery) -> Result<Vec<DatasetCandidate>, AtlasregError> {
        let url = format!("{}/graphql", self.base_url);
        debug!(url = %url, "mouselight search");
        let body: Value = self
            .fetcher
            .post_json(&url, &json!({ "query": NEURONS_QUERY }))?;
        let neurons = body
            .pointer("/data/searchNeurons/neurons")
            .and_then(Value::as_array)
            .ok_or_else(|| AtlasregError::NetworkFailure {
                provider: self.fetcher.provider().to_string(),
                message: "response has no neuron listing".to_string(),
            })?;
        Ok(neurons
            .iter()
            .filter_map(normalize_mouselight)
            .filter(|candidate| matches_structure(candidate, query.structure.as_deref()))
            .collect())
    }

    /// MouseLight ids are self-describing; no round trip is needed.
    fn lookup(&self, native_id: &str) -> Result<DatasetCandidate, AtlasregError> {
        let pattern = Regex::new(r"^[A-Za-z]{2}\d{4}$")
            .map_err(|err| AtlasregError::InvalidSpecifier(err.to_string()))?;
        let native_id = native_id.trim();
        if !pattern.is_match(native_id) {
            return Err(AtlasregError::InvalidSpecifier(format!(
                "mouselight ids look like AA0001, got {native_id}"
            )));
        }
        let mut candidate =
            DatasetCandidate::neuron(SourceKind::MouseLight, native_id.to_uppercase(), "mouse");
        candidate.url = Some(self.swc_url(native_id));
        Ok(candidate)
    }

    fn download(
        &self,
        descriptor: &DatasetDescriptor,
        destination_dir: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<PathBuf, AtlasregError> {
        let url = descriptor
            .url
            .clone()
            .unwrap_or_else(|| self.swc_url(&descriptor.native_id));
        let destination = destination_for(descriptor, destination_dir);
        info!(dataset = %descriptor.id, url = %url, "downloading mouselight reconstruction");
        self.fetcher.download_to(&url, &destination, progress)?;
        Ok(destination)
    }
}

fn matches_structure(candidate: &DatasetCandidate, structure: Option<&str>) -> bool {
    let Some(wanted) = structure else {
        return true;
    };
    candidate
        .structure_area
        .as_deref()
        .map(|area| area.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

/// Normalizes one neuron of the GraphQL listing.
pub fn normalize_mouselight(neuron: &Value) -> Option<DatasetCandidate> {
    let native_id = neuron
        .get("idString")
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())?
        .trim()
        .to_string();
    let mut candidate = DatasetCandidate::neuron(SourceKind::MouseLight, native_id, "mouse");
    candidate.name = candidate.native_id.clone();
    let area = neuron.get("brainArea");
    candidate.structure_area = area
        .and_then(|area| area.get("acronym"))
        .and_then(Value::as_str)
        .map(str::to_string);
    candidate.structure_name = area
        .and_then(|area| area.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(uuid) = neuron.get("id").and_then(Value::as_str) {
        candidate
            .source_ids
            .insert("neuron_uuid".to_string(), uuid.to_string());
    }
    Some(candidate)
}
