use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::domain::{DatasetCandidate, DatasetDescriptor, SourceKind};
use crate::error::AtlasregError;
use crate::providers::http::{HttpFetcher, encode_component};
use crate::providers::{SearchQuery, SourceAdapter, destination_for};

pub const NEUROMORPHO_BASE: &str = "https://neuromorpho.org";

#[derive(Debug, Clone)]
pub struct NeuroMorphoAdapter {
    fetcher: HttpFetcher,
    base_url: String,
}

impl NeuroMorphoAdapter {
    pub fn new(base_url: Option<&str>, timeout: Option<Duration>) -> Result<Self, AtlasregError> {
        Ok(Self {
            fetcher: HttpFetcher::new("NeuroMorpho.org", timeout)?,
            base_url: base_url
                .unwrap_or(NEUROMORPHO_BASE)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn select_url(&self, query: &SearchQuery) -> String {
        let species = query.species.as_deref().unwrap_or("mouse");
        let mut url = format!(
            "{}/api/neuron/select?q=species:{}&size={}",
            self.base_url,
            encode_component(species),
            query.limit
        );
        if let Some(region) = query.structure.as_deref() {
            url.push_str(&format!("&fq=brain_region:{}", encode_component(region)));
        }
        if let Some(cell_type) = query.cell_type.as_deref() {
            url.push_str(&format!("&fq=cell_type:{}", encode_component(cell_type)));
        }
        url
    }

    /// `dableFiles/<archive>/CNG version/<name>.CNG.swc`.
    pub fn swc_url(&self, archive: &str, neuron_name: &str) -> String {
        format!(
            "{}/dableFiles/{}/CNG%20version/{}.CNG.swc",
            self.base_url,
            encode_component(&archive.to_lowercase()),
            encode_component(neuron_name)
        )
    }

    fn fetch_by_name(&self, neuron_name: &str) -> Result<Value, AtlasregError> {
        let url = format!(
            "{}/api/neuron/name/{}",
            self.base_url,
            encode_component(neuron_name)
        );
        self.fetcher.get_json(&url)
    }
}

impl SourceAdapter for NeuroMorphoAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::NeuroMorpho
    }

    fn query(&self, query: &SearchQuery) -> Result<Vec<DatasetCandidate>, AtlasregError> {
        let url = self.select_url(query);
        debug!(url = %url, "neuromorpho search");
        let body: Value = self.fetcher.get_json(&url)?;
        let neurons = body
            .pointer("/_embedded/neuronResources")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(neurons.iter().filter_map(normalize_neuromorpho).collect())
    }

    fn lookup(&self, native_id: &str) -> Result<DatasetCandidate, AtlasregError> {
        let record = self.fetch_by_name(native_id.trim())?;
        normalize_neuromorpho(&record)
            .ok_or_else(|| AtlasregError::NotAvailable(format!("neuromorpho:{native_id}")))
    }

    fn download(
        &self,
        descriptor: &DatasetDescriptor,
        destination_dir: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<PathBuf, AtlasregError> {
        let archive = match descriptor.source_ids.get("archive") {
            Some(archive) => archive.clone(),
            None => {
                let record = self.fetch_by_name(&descriptor.native_id)?;
                field(&record, "archive").ok_or_else(|| AtlasregError::MissingField {
                    dataset: descriptor.id.to_string(),
                    field: "archive".to_string(),
                })?
            }
        };
        let url = self.swc_url(&archive, &descriptor.native_id);
        let destination = destination_for(descriptor, destination_dir);
        info!(dataset = %descriptor.id, url = %url, "downloading neuromorpho reconstruction");
        self.fetcher.download_to(&url, &destination, progress)?;
        Ok(destination)
    }
}

/// Scalar fields are plain strings; list fields (`brain_region`,
/// `cell_type`) are joined with `, `.
fn field(record: &Value, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::String(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        Value::Number(value) => Some(value.to_string()),
        Value::Array(values) => {
            let parts: Vec<&str> = values.iter().filter_map(Value::as_str).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }
}

pub fn normalize_neuromorpho(record: &Value) -> Option<DatasetCandidate> {
    let name = field(record, "neuron_name")?;
    let species = field(record, "species").unwrap_or_else(|| "unknown".to_string());
    let mut candidate = DatasetCandidate::neuron(SourceKind::NeuroMorpho, name.clone(), &species);
    candidate.name = name;
    candidate.structure_area = field(record, "brain_region");
    candidate.structure_name = field(record, "cell_type");
    for key in ["archive", "neuron_id", "cell_type"] {
        if let Some(value) = field(record, key) {
            candidate.source_ids.insert(key.to_string(), value);
        }
    }
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cng_url_lowercases_archive() {
        let adapter = NeuroMorphoAdapter::new(None, None).unwrap();
        assert_eq!(
            adapter.swc_url("Smith", "cell1"),
            "https://neuromorpho.org/dableFiles/smith/CNG%20version/cell1.CNG.swc"
        );
    }
}
