use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::AtlasregError;

pub const DEFAULT_MOUSE_ATLAS: &str = "allen_mouse_25um";
/// Size estimate used for single-neuron reconstructions before download.
pub const NEURON_SIZE_ESTIMATE_MB: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Allen,
    #[value(name = "mouselight")]
    MouseLight,
    #[value(name = "neuromorpho")]
    NeuroMorpho,
    Url,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Allen => "allen",
            SourceKind::MouseLight => "mouselight",
            SourceKind::NeuroMorpho => "neuromorpho",
            SourceKind::Url => "url",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Allen => "Allen Brain Atlas",
            SourceKind::MouseLight => "Janelia MouseLight",
            SourceKind::NeuroMorpho => "NeuroMorpho.org",
            SourceKind::Url => "Direct URL",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = AtlasregError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "allen" => Ok(SourceKind::Allen),
            "mouselight" => Ok(SourceKind::MouseLight),
            "neuromorpho" => Ok(SourceKind::NeuroMorpho),
            "url" => Ok(SourceKind::Url),
            _ => Err(AtlasregError::InvalidSpecifier(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Points,
    Volume,
    Streamlines,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Points => write!(f, "points"),
            DataType::Volume => write!(f, "volume"),
            DataType::Streamlines => write!(f, "streamlines"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Swc,
    Csv,
    Nrrd,
    Tiff,
    Png,
    Jpeg,
    Gif,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Swc => "swc",
            FileFormat::Csv => "csv",
            FileFormat::Nrrd => "nrrd",
            FileFormat::Tiff => "tif",
            FileFormat::Png => "png",
            FileFormat::Jpeg => "jpg",
            FileFormat::Gif => "gif",
        }
    }

    /// Guess from a file extension. Only used for descriptor metadata;
    /// loaders sniff file contents instead.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "swc" => Some(FileFormat::Swc),
            "csv" | "txt" => Some(FileFormat::Csv),
            "nrrd" | "nhdr" => Some(FileFormat::Nrrd),
            "tif" | "tiff" => Some(FileFormat::Tiff),
            "png" => Some(FileFormat::Png),
            "jpg" | "jpeg" => Some(FileFormat::Jpeg),
            "gif" => Some(FileFormat::Gif),
            _ => None,
        }
    }

    pub fn default_data_type(&self) -> DataType {
        match self {
            FileFormat::Swc => DataType::Streamlines,
            FileFormat::Csv => DataType::Points,
            _ => DataType::Volume,
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileFormat::Swc => "swc",
            FileFormat::Csv => "csv",
            FileFormat::Nrrd => "nrrd",
            FileFormat::Tiff => "tiff",
            FileFormat::Png => "png",
            FileFormat::Jpeg => "jpeg",
            FileFormat::Gif => "gif",
        };
        write!(f, "{name}")
    }
}

/// Identifier of a dataset; also the name of its cache directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetId(String);

impl DatasetId {
    /// Deterministic id for an upstream record: `{source}_{native_id}`.
    pub fn for_source(source: SourceKind, native_id: &str) -> Self {
        let sanitized: String = native_id
            .trim()
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        Self(format!("{}_{}", source.as_str(), sanitized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = AtlasregError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed != "."
            && trimmed != ".."
            && trimmed
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(AtlasregError::InvalidDatasetId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for DatasetId {
    type Error = AtlasregError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatasetId> for String {
    fn from(value: DatasetId) -> Self {
        value.0
    }
}

/// How a caller names a dataset on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSpecifier {
    /// `source:native_id`, resolved through the source adapter.
    Upstream { source: SourceKind, native_id: String },
    /// An id already known to the registry or the cache.
    Registered(DatasetId),
}

impl FromStr for DatasetSpecifier {
    type Err = AtlasregError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Some((kind, rest)) = trimmed.split_once(':') {
            let source: SourceKind = kind.parse()?;
            let native_id = rest.trim();
            if native_id.is_empty() || source == SourceKind::Url {
                return Err(AtlasregError::InvalidSpecifier(value.to_string()));
            }
            return Ok(DatasetSpecifier::Upstream {
                source,
                native_id: native_id.to_string(),
            });
        }
        Ok(DatasetSpecifier::Registered(trimmed.parse()?))
    }
}

/// Normalized search hit returned by a source adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetCandidate {
    pub source: SourceKind,
    pub native_id: String,
    pub name: String,
    pub species: String,
    pub structure_area: Option<String>,
    pub structure_name: Option<String>,
    pub format: FileFormat,
    pub data_type: DataType,
    pub atlas: Option<String>,
    pub url: Option<String>,
    pub size_mb: f64,
    pub source_ids: BTreeMap<String, String>,
}

impl DatasetCandidate {
    /// A neuron reconstruction candidate with the defaults shared by all
    /// neuron databases.
    pub fn neuron(source: SourceKind, native_id: impl Into<String>, species: &str) -> Self {
        let native_id = native_id.into();
        let species = normalize_species(species);
        let atlas = default_atlas_for(&species);
        Self {
            source,
            name: format!("{} Neuron {}", source.label(), native_id),
            native_id,
            species,
            structure_area: None,
            structure_name: None,
            format: FileFormat::Swc,
            data_type: DataType::Streamlines,
            atlas,
            url: None,
            size_mb: NEURON_SIZE_ESTIMATE_MB,
            source_ids: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub id: DatasetId,
    pub name: String,
    pub source: SourceKind,
    pub source_label: String,
    pub description: String,
    pub species: String,
    pub atlas: Option<String>,
    pub data_type: DataType,
    pub format: FileFormat,
    pub size_mb: f64,
    pub native_id: String,
    pub file_name: String,
    pub structure_area: Option<String>,
    pub structure_name: Option<String>,
    pub url: Option<String>,
    pub source_ids: BTreeMap<String, String>,
}

impl From<DatasetCandidate> for DatasetDescriptor {
    fn from(value: DatasetCandidate) -> Self {
        let id = DatasetId::for_source(value.source, &value.native_id);
        let description = format!(
            "Dataset from {}. Structure: {}, Species: {}",
            value.source.label(),
            value.structure_area.as_deref().unwrap_or("Unknown"),
            value.species
        );
        let prefix = format!("{}_", value.source.as_str());
        let stem = id.as_str().strip_prefix(prefix.as_str()).unwrap_or(id.as_str());
        let file_name = format!("{stem}.{}", value.format.extension());
        Self {
            id,
            name: value.name,
            source: value.source,
            source_label: value.source.label().to_string(),
            description,
            species: value.species,
            atlas: value.atlas,
            data_type: value.data_type,
            format: value.format,
            size_mb: value.size_mb,
            native_id: value.native_id,
            file_name,
            structure_area: value.structure_area,
            structure_name: value.structure_name,
            url: value.url,
            source_ids: value.source_ids,
        }
    }
}

/// Status shown to the user; always derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Available,
    Downloading,
    Downloaded,
    AtlasRequired,
    Failed,
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DownloadState::Available => "Available",
            DownloadState::Downloading => "Downloading",
            DownloadState::Downloaded => "Downloaded",
            DownloadState::AtlasRequired => "Atlas Required",
            DownloadState::Failed => "Failed",
        };
        write!(f, "{label}")
    }
}

/// Read-only description of the target atlas space.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AtlasFrame {
    pub name: String,
    /// Physical units per pixel, indexed like the raw (x, y, z) input.
    pub resolution: [f64; 3],
    /// Volume shape in (z, y, x) order.
    pub shape: [usize; 3],
    pub version: String,
}

impl AtlasFrame {
    pub fn validate(&self) -> Result<(), AtlasregError> {
        if self
            .resolution
            .iter()
            .any(|value| !value.is_finite() || *value <= 0.0)
        {
            return Err(AtlasregError::InvalidAtlasFrame(format!(
                "{}: resolution must be positive, got {:?}",
                self.name, self.resolution
            )));
        }
        if self.shape.iter().any(|value| *value == 0) {
            return Err(AtlasregError::InvalidAtlasFrame(format!(
                "{}: shape must be non-empty, got {:?}",
                self.name, self.shape
            )));
        }
        Ok(())
    }
}

/// Parsed tree-structured neuron reconstruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NeuronMorphology {
    pub points: Vec<[f64; 3]>,
    /// (parent row, child row) pairs over `points`.
    pub connections: Vec<(usize, usize)>,
    pub radii: Vec<f64>,
}

impl NeuronMorphology {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn validate(&self) -> Result<(), AtlasregError> {
        if self.radii.len() != self.points.len() {
            return Err(AtlasregError::InvalidGeometry(format!(
                "{} radii for {} points",
                self.radii.len(),
                self.points.len()
            )));
        }
        if let Some((parent, child)) = self
            .connections
            .iter()
            .find(|(parent, child)| *parent >= self.points.len() || *child >= self.points.len())
        {
            return Err(AtlasregError::InvalidGeometry(format!(
                "connection ({parent}, {child}) references a missing point"
            )));
        }
        Ok(())
    }

    /// Parent-to-child line segments, skipping connections with out of
    /// range indices.
    pub fn segments(&self) -> Vec<[[f64; 3]; 2]> {
        segments(&self.points, &self.connections)
    }
}

pub fn segments(points: &[[f64; 3]], connections: &[(usize, usize)]) -> Vec<[[f64; 3]; 2]> {
    connections
        .iter()
        .filter_map(|(parent, child)| {
            let start = points.get(*parent)?;
            let end = points.get(*child)?;
            Some([*start, *end])
        })
        .collect()
}

pub fn normalize_species(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    match lowered.as_str() {
        "" => "unknown".to_string(),
        "mus musculus" => "mouse".to_string(),
        "rattus norvegicus" => "rat".to_string(),
        "homo sapiens" => "human".to_string(),
        "danio rerio" => "zebrafish".to_string(),
        _ => lowered,
    }
}

pub fn default_atlas_for(species: &str) -> Option<String> {
    species
        .contains("mouse")
        .then(|| DEFAULT_MOUSE_ATLAS.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn dataset_id_is_deterministic() {
        let first = DatasetId::for_source(SourceKind::Allen, "485574832");
        let second = DatasetId::for_source(SourceKind::Allen, " 485574832 ");
        assert_eq!(first, second);
        assert_eq!(first.as_str(), "allen_485574832");
    }

    #[test]
    fn dataset_id_sanitizes_separators() {
        let id = DatasetId::for_source(SourceKind::NeuroMorpho, "cell/../01 a");
        assert_eq!(id.as_str(), "neuromorpho_cell_.._01_a");
        assert!(!id.as_str().contains('/'));
    }

    #[test]
    fn parse_dataset_id_rejects_traversal() {
        assert_matches!(
            "../etc".parse::<DatasetId>(),
            Err(AtlasregError::InvalidDatasetId(_))
        );
        assert_matches!("..".parse::<DatasetId>(), Err(AtlasregError::InvalidDatasetId(_)));
    }

    #[test]
    fn parse_specifier() {
        let spec: DatasetSpecifier = "mouselight:AA0001".parse().unwrap();
        assert_eq!(
            spec,
            DatasetSpecifier::Upstream {
                source: SourceKind::MouseLight,
                native_id: "AA0001".to_string()
            }
        );

        let spec: DatasetSpecifier = "allen_12345".parse().unwrap();
        assert_matches!(spec, DatasetSpecifier::Registered(_));

        assert_matches!(
            "url:anything".parse::<DatasetSpecifier>(),
            Err(AtlasregError::InvalidSpecifier(_))
        );
    }

    #[test]
    fn species_normalization() {
        assert_eq!(normalize_species("Mus musculus"), "mouse");
        assert_eq!(normalize_species("Rat"), "rat");
        assert_eq!(default_atlas_for("mouse").as_deref(), Some(DEFAULT_MOUSE_ATLAS));
        assert_eq!(default_atlas_for("human"), None);
    }

    #[test]
    fn descriptor_file_name_uses_native_id() {
        let candidate = DatasetCandidate::neuron(SourceKind::MouseLight, "AA0001", "Mus musculus");
        let descriptor = DatasetDescriptor::from(candidate);
        assert_eq!(descriptor.id.as_str(), "mouselight_AA0001");
        assert_eq!(descriptor.file_name, "AA0001.swc");
        assert_eq!(descriptor.atlas.as_deref(), Some(DEFAULT_MOUSE_ATLAS));
    }

    #[test]
    fn segments_skip_invalid_indices() {
        let points = vec![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]];
        let segments = segments(&points, &[(0, 1), (1, 5)]);
        assert_eq!(segments, vec![[[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]]]);
    }
}
