use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::domain::{DatasetCandidate, DatasetDescriptor, SourceKind};
use crate::error::AtlasregError;
use crate::providers::http::{HttpFetcher, encode_component};
use crate::providers::{SearchQuery, SourceAdapter, destination_for};

pub const ALLEN_BASE: &str = "https://api.brain-map.org/api/v2";
const ALLEN_HOST: &str = "https://api.brain-map.org";

/// Allen Brain Atlas cell types database, queried over RMA.
#[derive(Debug, Clone)]
pub struct AllenAdapter {
    fetcher: HttpFetcher,
    base_url: String,
}

impl AllenAdapter {
    pub fn new(base_url: Option<&str>, timeout: Option<Duration>) -> Result<Self, AtlasregError> {
        Ok(Self {
            fetcher: HttpFetcher::new("Allen Brain Atlas", timeout)?,
            base_url: base_url.unwrap_or(ALLEN_BASE).trim_end_matches('/').to_string(),
        })
    }

    pub fn search_url(&self, query: &SearchQuery) -> String {
        let mut criteria = vec!["model::ApiCellTypesSpecimenDetail".to_string()];
        let mut filters = Vec::new();
        if let Some(structure) = query.structure.as_deref() {
            filters.push(format!("[structure__acronym$eq'{}']", encode_component(structure)));
        }
        if let Some(species) = query.species.as_deref() {
            filters.push(format!(
                "[donor__species$il'{}']",
                encode_component(&allen_species(species))
            ));
        }
        if !filters.is_empty() {
            criteria.push(format!("rma::criteria,{}", filters.join("")));
        }
        criteria.push(format!("rma::options[num_rows$eq{}]", query.limit));
        format!("{}/data/query.json?criteria={}", self.base_url, criteria.join(","))
    }

    fn specimen_url(&self, specimen_id: u64) -> String {
        format!(
            "{}/data/query.json?criteria=model::ApiCellTypesSpecimenDetail,rma::criteria,[specimen__id$eq{specimen_id}]",
            self.base_url
        )
    }

    fn reconstruction_url(&self, specimen_id: u64) -> String {
        format!(
            "{}/data/query.json?criteria=model::NeuronReconstruction,rma::criteria,[specimen_id$eq{specimen_id}],rma::include,well_known_files",
            self.base_url
        )
    }

    fn rows(&self, url: &str) -> Result<Vec<Value>, AtlasregError> {
        let body: Value = self.fetcher.get_json(url)?;
        rma_rows(&body).map_err(|message| AtlasregError::NetworkFailure {
            provider: self.fetcher.provider().to_string(),
            message,
        })
    }

    /// Download link of the plain SWC reconstruction of a specimen.
    pub fn reconstruction_link(&self, specimen_id: u64) -> Result<String, AtlasregError> {
        let rows = self.rows(&self.reconstruction_url(specimen_id))?;
        rows.first()
            .and_then(|row| row.get("well_known_files"))
            .and_then(Value::as_array)
            .and_then(|files| select_swc_link(files))
            .map(|link| resolve_download_link(&self.base_url, &link))
            .ok_or_else(|| AtlasregError::NotAvailable(format!(
                "allen specimen {specimen_id} has no SWC reconstruction"
            )))
    }
}

impl SourceAdapter for AllenAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Allen
    }

    fn query(&self, query: &SearchQuery) -> Result<Vec<DatasetCandidate>, AtlasregError> {
        let url = self.search_url(query);
        debug!(url = %url, "allen search");
        let rows = self.rows(&url)?;
        Ok(rows.iter().filter_map(normalize_allen_row).collect())
    }

    fn lookup(&self, native_id: &str) -> Result<DatasetCandidate, AtlasregError> {
        let specimen_id = parse_specimen_id(native_id)?;
        let rows = self.rows(&self.specimen_url(specimen_id))?;
        rows.iter()
            .find_map(normalize_allen_row)
            .ok_or_else(|| AtlasregError::NotAvailable(format!("allen:{native_id}")))
    }

    fn download(
        &self,
        descriptor: &DatasetDescriptor,
        destination_dir: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<PathBuf, AtlasregError> {
        let specimen_id = parse_specimen_id(&descriptor.native_id)?;
        let link = self.reconstruction_link(specimen_id)?;
        let destination = destination_for(descriptor, destination_dir);
        info!(dataset = %descriptor.id, url = %link, "downloading allen reconstruction");
        self.fetcher.download_to(&link, &destination, progress)?;
        Ok(destination)
    }
}

fn parse_specimen_id(native_id: &str) -> Result<u64, AtlasregError> {
    native_id
        .trim()
        .parse()
        .map_err(|_| AtlasregError::InvalidSpecifier(format!(
            "allen neuron ids are numeric, got {native_id}"
        )))
}

fn allen_species(species: &str) -> String {
    match crate::domain::normalize_species(species).as_str() {
        "mouse" => "Mus musculus".to_string(),
        "human" => "Homo Sapiens".to_string(),
        _ => species.to_string(),
    }
}

fn rma_rows(body: &Value) -> Result<Vec<Value>, String> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        let message = body
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("query was rejected");
        return Err(message.to_string());
    }
    Ok(body
        .get("msg")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

fn text(row: &Value, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

/// Normalizes one `ApiCellTypesSpecimenDetail` row. Rows without a
/// reconstruction have nothing to download and are skipped.
pub fn normalize_allen_row(row: &Value) -> Option<DatasetCandidate> {
    text(row, "nr__reconstruction_type")?;
    let native_id = text(row, "specimen__id").or_else(|| text(row, "id"))?;
    let species = text(row, "donor__species").unwrap_or_else(|| "Mus musculus".to_string());
    let mut candidate = DatasetCandidate::neuron(SourceKind::Allen, native_id, &species);
    if let Some(name) = text(row, "specimen__name") {
        candidate.name = name;
    }
    candidate.structure_area = text(row, "structure__acronym");
    candidate.structure_name = text(row, "structure__name");
    candidate
        .source_ids
        .insert("specimen_id".to_string(), candidate.native_id.clone());
    for (key, field) in [
        ("hemisphere", "specimen__hemisphere"),
        ("transgenic_line", "line_name"),
        ("reconstruction_type", "nr__reconstruction_type"),
    ] {
        if let Some(value) = text(row, field) {
            candidate.source_ids.insert(key.to_string(), value);
        }
    }
    Some(candidate)
}

/// Picks the plain `.swc` reconstruction, skipping marker files.
pub fn select_swc_link(files: &[Value]) -> Option<String> {
    files.iter().find_map(|file| {
        let path = file.get("path").and_then(Value::as_str).unwrap_or_default();
        if !path.ends_with(".swc") || path.contains("marker") {
            return None;
        }
        file.get("download_link")
            .and_then(Value::as_str)
            .filter(|link| !link.is_empty())
            .map(str::to_string)
    })
}

/// Makes a well-known-file link absolute.
pub fn resolve_download_link(base_url: &str, link: &str) -> String {
    if link.starts_with("http") {
        link.to_string()
    } else if link.starts_with("/api/v2/") {
        format!("{ALLEN_HOST}{link}")
    } else {
        format!("{base_url}{link}")
    }
}
