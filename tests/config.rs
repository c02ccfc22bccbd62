use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use atlasreg::config::ConfigLoader;
use atlasreg::domain::{DataType, FileFormat, SourceKind};
use atlasreg::error::AtlasregError;

fn write_config(body: &str) -> (tempfile::TempDir, String) {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("atlasreg.json");
    fs::write(&path, body).unwrap();
    let path = path.to_string_lossy().to_string();
    (temp, path)
}

#[test]
fn explicit_config_file_is_resolved() {
    let (_temp, path) = write_config(
        r#"{
            "schema_version": 1,
            "cache_root": "/data/brainglobe",
            "default_atlas": "allen_mouse_10um",
            "search_limit": 5,
            "http_timeout_secs": 30,
            "sources": {
                "neuromorpho": { "enabled": false },
                "allen": { "base_url": "http://localhost:9000" }
            },
            "datasets": [
                "https://example.org/cells.csv",
                {
                    "url": "https://example.org/volumes/scan.tiff",
                    "id": "url_scan_one",
                    "name": "Scan one",
                    "species": "Homo sapiens",
                    "size_mb": 12.5
                }
            ]
        }"#,
    );

    let resolved = ConfigLoader::resolve(Some(&path)).unwrap();
    assert_eq!(resolved.cache_root.as_ref().map(|root| root.as_str()), Some("/data/brainglobe"));
    assert_eq!(resolved.default_atlas, "allen_mouse_10um");
    assert_eq!(resolved.search_limit, 5);
    assert_eq!(resolved.http_timeout, Some(Duration::from_secs(30)));

    assert!(!resolved.source(SourceKind::NeuroMorpho).enabled);
    let allen = resolved.source(SourceKind::Allen);
    assert!(allen.enabled);
    assert_eq!(allen.base_url.as_deref(), Some("http://localhost:9000"));
    assert!(resolved.source(SourceKind::MouseLight).enabled);

    let cells = &resolved.datasets[0];
    assert_eq!(cells.id.as_str(), "url_cells");
    assert_eq!(cells.format, FileFormat::Csv);
    assert_eq!(cells.data_type, DataType::Points);
    assert_eq!(cells.file_name, "data.csv");

    let scan = &resolved.datasets[1];
    assert_eq!(scan.id.as_str(), "url_scan_one");
    assert_eq!(scan.name, "Scan one");
    assert_eq!(scan.format, FileFormat::Tiff);
    assert_eq!(scan.species, "human");
    assert_eq!(scan.size_mb, 12.5);
    assert_eq!(scan.url.as_deref(), Some("https://example.org/volumes/scan.tiff"));
}

#[test]
fn empty_config_uses_defaults() {
    let (_temp, path) = write_config("{}");
    let resolved = ConfigLoader::resolve(Some(&path)).unwrap();
    assert_eq!(resolved.default_atlas, "allen_mouse_25um");
    assert!(resolved.cache_root.is_none());
    assert!(resolved.datasets.is_empty());
    assert_eq!(resolved.http_timeout, None);
}

#[test]
fn explicit_missing_path_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("nope.json");
    let result = ConfigLoader::resolve(Some(&missing.to_string_lossy()));
    assert_matches!(result, Err(AtlasregError::ConfigRead(path)) if path == missing);
}

#[test]
fn malformed_json_is_a_parse_error() {
    let (_temp, path) = write_config("{ \"datasets\": [ ");
    assert_matches!(
        ConfigLoader::resolve(Some(&path)),
        Err(AtlasregError::ConfigParse(_))
    );
}

#[test]
fn zero_search_limit_is_rejected() {
    let (_temp, path) = write_config(r#"{ "search_limit": 0 }"#);
    assert_matches!(
        ConfigLoader::resolve(Some(&path)),
        Err(AtlasregError::ConfigParse(message)) if message.contains("search_limit")
    );
}

#[test]
fn dataset_without_known_format_is_rejected() {
    let (_temp, path) = write_config(r#"{ "datasets": ["https://example.org/archive.bin"] }"#);
    assert_matches!(
        ConfigLoader::resolve(Some(&path)),
        Err(AtlasregError::ConfigParse(_))
    );
}

#[test]
fn explicit_format_overrides_extension() {
    let (_temp, path) = write_config(
        r#"{ "datasets": [{ "url": "https://example.org/download?id=7", "id": "url_seven", "format": "nrrd" }] }"#,
    );
    let resolved = ConfigLoader::resolve(Some(&path)).unwrap();
    let dataset = &resolved.datasets[0];
    assert_eq!(dataset.format, FileFormat::Nrrd);
    assert_eq!(dataset.data_type, DataType::Volume);
}

#[test]
fn invalid_dataset_id_is_rejected() {
    let (_temp, path) =
        write_config(r#"{ "datasets": [{ "url": "https://example.org/a.csv", "id": "../evil" }] }"#);
    assert_matches!(
        ConfigLoader::resolve(Some(&path)),
        Err(AtlasregError::InvalidDatasetId(_))
    );
}
