use std::fs;

use assert_matches::assert_matches;
use serde_json::json;

use atlasreg::domain::{DatasetCandidate, DatasetDescriptor, FileFormat, SourceKind};
use atlasreg::error::AtlasregError;
use atlasreg::providers::allen::{normalize_allen_row, resolve_download_link, select_swc_link};
use atlasreg::providers::mouselight::normalize_mouselight;
use atlasreg::providers::neuromorpho::normalize_neuromorpho;
use atlasreg::providers::{
    AllenAdapter, MouseLightAdapter, NeuroMorphoAdapter, Providers, SearchQuery, SourceAdapter,
    UrlAdapter,
};

#[test]
fn allen_row_is_normalized() {
    let row = json!({
        "specimen__id": 485574832,
        "specimen__name": "Sst-IRES-Cre;Ai14-167638.03.01.01",
        "structure__acronym": "VISp",
        "structure__name": "Primary visual area",
        "donor__species": "Mus musculus",
        "line_name": "Sst-IRES-Cre",
        "nr__reconstruction_type": "full"
    });
    let candidate = normalize_allen_row(&row).unwrap();
    let descriptor = DatasetDescriptor::from(candidate);
    assert_eq!(descriptor.id.as_str(), "allen_485574832");
    assert_eq!(descriptor.name, "Sst-IRES-Cre;Ai14-167638.03.01.01");
    assert_eq!(descriptor.species, "mouse");
    assert_eq!(descriptor.atlas.as_deref(), Some("allen_mouse_25um"));
    assert_eq!(descriptor.structure_area.as_deref(), Some("VISp"));
    assert_eq!(descriptor.format, FileFormat::Swc);
    assert_eq!(descriptor.file_name, "485574832.swc");
    assert_eq!(descriptor.source_ids.get("transgenic_line").map(String::as_str), Some("Sst-IRES-Cre"));
    assert!(descriptor.description.contains("Structure: VISp"));
}

#[test]
fn allen_rows_without_reconstruction_are_skipped() {
    let row = json!({ "specimen__id": 1, "structure__acronym": "VISp" });
    assert!(normalize_allen_row(&row).is_none());
}

#[test]
fn swc_link_skips_marker_files() {
    let files = vec![
        json!({ "path": "/data/485574832_marker.swc", "download_link": "/api/v2/well_known_file_download/1" }),
        json!({ "path": "/data/485574832.png", "download_link": "/api/v2/well_known_file_download/2" }),
        json!({ "path": "/data/485574832.swc", "download_link": "/api/v2/well_known_file_download/3" }),
    ];
    assert_eq!(
        select_swc_link(&files).as_deref(),
        Some("/api/v2/well_known_file_download/3")
    );
    assert_eq!(select_swc_link(&files[..2]), None);
}

#[test]
fn download_links_are_made_absolute() {
    let base = "https://api.brain-map.org/api/v2";
    assert_eq!(
        resolve_download_link(base, "/api/v2/well_known_file_download/3"),
        "https://api.brain-map.org/api/v2/well_known_file_download/3"
    );
    assert_eq!(
        resolve_download_link(base, "https://cdn.example.org/a.swc"),
        "https://cdn.example.org/a.swc"
    );
    assert_eq!(
        resolve_download_link("http://localhost:9000", "/files/a.swc"),
        "http://localhost:9000/files/a.swc"
    );
}

#[test]
fn allen_search_url_carries_filters_and_limit() {
    let adapter = AllenAdapter::new(Some("http://localhost:9000/"), None).unwrap();
    let query = SearchQuery {
        structure: Some("VISp".to_string()),
        species: Some("mouse".to_string()),
        cell_type: None,
        limit: 7,
    };
    let url = adapter.search_url(&query);
    assert!(url.starts_with("http://localhost:9000/data/query.json?criteria=model::ApiCellTypesSpecimenDetail"));
    assert!(url.contains("[structure__acronym$eq'VISp']"));
    assert!(url.contains("[donor__species$il'Mus%20musculus']"));
    assert!(url.ends_with("rma::options[num_rows$eq7]"));
}

#[test]
fn mouselight_neuron_is_normalized() {
    let neuron = json!({
        "id": "4d3c1a5e-uuid",
        "idString": "AA0001",
        "brainArea": { "acronym": "MOp", "name": "Primary motor area" }
    });
    let candidate = normalize_mouselight(&neuron).unwrap();
    assert_eq!(candidate.native_id, "AA0001");
    assert_eq!(candidate.name, "AA0001");
    assert_eq!(candidate.structure_area.as_deref(), Some("MOp"));
    assert_eq!(candidate.species, "mouse");
    assert_eq!(candidate.source_ids.get("neuron_uuid").map(String::as_str), Some("4d3c1a5e-uuid"));
    assert!(normalize_mouselight(&json!({ "idString": "  " })).is_none());
}

#[test]
fn mouselight_lookup_validates_ids() {
    let adapter = MouseLightAdapter::new(None, None)
        .unwrap()
        .with_file_base("http://localhost:9000/swc/");
    let candidate = adapter.lookup("aa0042").unwrap();
    assert_eq!(candidate.native_id, "AA0042");
    assert_eq!(candidate.url.as_deref(), Some("http://localhost:9000/swc/aa0042.swc"));
    assert_matches!(adapter.lookup("neuron-1"), Err(AtlasregError::InvalidSpecifier(_)));
}

#[test]
fn neuromorpho_record_is_normalized() {
    let record = json!({
        "neuron_id": 102,
        "neuron_name": "cnic_001",
        "archive": "Wearne_Hof",
        "species": "monkey",
        "brain_region": ["neocortex", "prefrontal"],
        "cell_type": ["pyramidal", "principal cell"]
    });
    let candidate = normalize_neuromorpho(&record).unwrap();
    assert_eq!(candidate.native_id, "cnic_001");
    assert_eq!(candidate.structure_area.as_deref(), Some("neocortex, prefrontal"));
    assert_eq!(candidate.atlas, None);
    assert_eq!(candidate.source_ids.get("archive").map(String::as_str), Some("Wearne_Hof"));
    assert_eq!(candidate.source_ids.get("neuron_id").map(String::as_str), Some("102"));
}

#[test]
fn neuromorpho_select_url_encodes_filters() {
    let adapter = NeuroMorphoAdapter::new(None, None).unwrap();
    let query = SearchQuery {
        structure: Some("neocortex".to_string()),
        species: Some("rat".to_string()),
        cell_type: Some("pyramidal cell".to_string()),
        limit: 3,
    };
    assert_eq!(
        adapter.select_url(&query),
        "https://neuromorpho.org/api/neuron/select?q=species:rat&size=3&fq=brain_region:neocortex&fq=cell_type:pyramidal%20cell"
    );
}

#[test]
fn url_adapter_copies_local_files() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("cells.csv");
    fs::write(&source, "1,2,3\n4,5,6\n").unwrap();
    let destination_dir = temp.path().join("entry");
    fs::create_dir_all(&destination_dir).unwrap();

    let mut candidate = DatasetCandidate::neuron(SourceKind::Url, "cells", "mouse");
    candidate.format = FileFormat::Csv;
    candidate.url = Some(format!("file://{}", source.display()));
    let descriptor = DatasetDescriptor::from(candidate);

    let adapter = UrlAdapter::new(None).unwrap();
    let mut reported = Vec::new();
    let written = adapter
        .download(&descriptor, &destination_dir, &mut |done, total| {
            reported.push((done, total))
        })
        .unwrap();
    assert_eq!(written, destination_dir.join("cells.csv"));
    assert_eq!(fs::read_to_string(&written).unwrap(), "1,2,3\n4,5,6\n");
    assert_eq!(reported.last(), Some(&(12, 12)));
}

#[test]
fn url_adapter_requires_a_url() {
    let temp = tempfile::tempdir().unwrap();
    let descriptor = DatasetDescriptor::from(DatasetCandidate::neuron(SourceKind::Url, "x", "mouse"));
    let adapter = UrlAdapter::new(None).unwrap();
    assert_matches!(
        adapter.download(&descriptor, temp.path(), &mut |_, _| {}),
        Err(AtlasregError::MissingField { field, .. }) if field == "url"
    );
}

#[test]
fn disabled_source_is_not_available() {
    let providers = Providers::new().with(std::sync::Arc::new(UrlAdapter::new(None).unwrap()));
    assert_eq!(providers.kinds(), vec![SourceKind::Url]);
    assert_matches!(
        providers.get(SourceKind::Allen).err(),
        Some(AtlasregError::NotAvailable(_))
    );
    assert!(providers.search(&SearchQuery::structure("VISp"), None).is_empty());
}
