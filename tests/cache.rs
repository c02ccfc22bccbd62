use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use atlasreg::cache::{CacheMetadata, LocalCache, METADATA_FILE};
use atlasreg::domain::{DatasetCandidate, DatasetDescriptor, DatasetId, SourceKind};
use atlasreg::error::AtlasregError;

fn temp_cache() -> (tempfile::TempDir, LocalCache) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, LocalCache::new_with_root(root))
}

fn descriptor(native_id: &str) -> DatasetDescriptor {
    let mut candidate = DatasetCandidate::neuron(SourceKind::MouseLight, native_id, "mouse");
    candidate.structure_area = Some("MOp".to_string());
    DatasetDescriptor::from(candidate)
}

fn store_entry(cache: &LocalCache, descriptor: &DatasetDescriptor, body: &str) -> Utf8PathBuf {
    let staging = cache.staging_dir(&descriptor.id).unwrap();
    fs::write(staging.path().join(&descriptor.file_name), body).unwrap();
    let staging_path = Utf8PathBuf::from_path_buf(staging.path().to_path_buf()).unwrap();
    let metadata = CacheMetadata::from_descriptor(descriptor, &descriptor.file_name);
    LocalCache::write_metadata(&staging_path.join(METADATA_FILE), &metadata).unwrap();
    cache.commit(staging, &descriptor.id).unwrap()
}

#[test]
fn committed_entry_is_downloaded() {
    let (_temp, cache) = temp_cache();
    let descriptor = descriptor("AA0001");
    let path = store_entry(&cache, &descriptor, "1 1 0 0 0 1 -1\n");

    assert_eq!(path, cache.dataset_dir(&descriptor.id));
    assert!(cache.is_downloaded(&descriptor.id));
    assert_eq!(cache.dataset_path(&descriptor.id), Some(path.clone()));
    assert_eq!(cache.data_file(&descriptor.id).unwrap(), path.join("AA0001.swc"));
    assert!(!path.join("metadata.json.tmp").exists());
}

#[test]
fn metadata_round_trips_into_descriptor() {
    let (_temp, cache) = temp_cache();
    let descriptor = descriptor("AA0002");
    store_entry(&cache, &descriptor, "1 1 0 0 0 1 -1\n");

    let metadata = cache.read_metadata(&descriptor.id).unwrap();
    assert_eq!(metadata.api_source, Some(SourceKind::MouseLight));
    assert_eq!(metadata.neuron_id.as_deref(), Some("AA0002"));
    assert_eq!(metadata.source, "Janelia MouseLight");
    assert!(metadata.downloaded_at.is_some());
    assert!(metadata.tool.as_deref().unwrap().starts_with("atlasreg/"));
    assert_eq!(metadata.to_descriptor(), descriptor);
}

#[test]
fn entry_without_data_file_is_not_downloaded() {
    let (_temp, cache) = temp_cache();
    let descriptor = descriptor("AA0003");
    let path = store_entry(&cache, &descriptor, "1 1 0 0 0 1 -1\n");
    fs::remove_file(path.join("AA0003.swc")).unwrap();

    assert!(!cache.is_downloaded(&descriptor.id));
    assert_matches!(
        cache.read_metadata(&descriptor.id),
        Err(AtlasregError::NotDownloaded(_))
    );
    assert!(cache.list_downloaded().unwrap().is_empty());
}

#[test]
fn metadata_tolerates_unknown_and_missing_fields() {
    let (_temp, cache) = temp_cache();
    let id: DatasetId = "url_injection".parse().unwrap();
    let dir = cache.dataset_dir(&id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("data.nrrd"), b"NRRD0004\n").unwrap();
    fs::write(
        dir.join(METADATA_FILE),
        r#"{
            "dataset_id": "url_injection",
            "name": "injection",
            "source": "Direct URL",
            "data_type": "volume",
            "format": "nrrd",
            "file_name": "data.nrrd",
            "viewer_layer": "ignored"
        }"#,
    )
    .unwrap();

    let metadata = cache.read_metadata(&id).unwrap();
    assert_eq!(metadata.species, "unknown");
    assert_eq!(metadata.atlas, None);
    assert_eq!(metadata.to_descriptor().source, SourceKind::Url);
}

#[test]
fn list_skips_staging_and_broken_entries() {
    let (_temp, cache) = temp_cache();
    store_entry(&cache, &descriptor("AA0010"), "1 1 0 0 0 1 -1\n");
    store_entry(&cache, &descriptor("AA0011"), "1 1 0 0 0 1 -1\n");

    let _pending = cache.staging_dir(&"mouselight_AA0012".parse().unwrap()).unwrap();
    let broken = cache.datasets_dir().join("mouselight_AA0013");
    fs::create_dir_all(&broken).unwrap();
    fs::write(broken.join(METADATA_FILE), "{ not json").unwrap();

    let listed: Vec<String> = cache
        .list_downloaded()
        .unwrap()
        .into_iter()
        .map(|metadata| metadata.dataset_id.to_string())
        .collect();
    assert_eq!(listed, vec!["mouselight_AA0010", "mouselight_AA0011"]);
}

#[test]
fn metadata_file_name_cannot_escape_entry() {
    let (_temp, cache) = temp_cache();
    let id: DatasetId = "url_escape".parse().unwrap();
    let dir = cache.dataset_dir(&id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join(METADATA_FILE),
        r#"{"dataset_id":"url_escape","name":"x","source":"Direct URL","data_type":"points","format":"csv","file_name":"../outside.csv"}"#,
    )
    .unwrap();
    assert!(!cache.is_downloaded(&id));
    assert_matches!(cache.read_metadata(&id), Err(AtlasregError::Filesystem(_)));
}

#[test]
fn remove_deletes_entry() {
    let (_temp, cache) = temp_cache();
    let descriptor = descriptor("AA0020");
    store_entry(&cache, &descriptor, "1 1 0 0 0 1 -1\n");

    assert!(cache.remove(&descriptor.id).unwrap());
    assert!(!cache.dataset_dir(&descriptor.id).exists());
    assert!(!cache.remove(&descriptor.id).unwrap());
}

#[test]
fn commit_replaces_previous_entry() {
    let (_temp, cache) = temp_cache();
    let descriptor = descriptor("AA0030");
    store_entry(&cache, &descriptor, "old\n");
    let path = store_entry(&cache, &descriptor, "1 1 0 0 0 1 -1\n");
    let body = fs::read_to_string(path.join("AA0030.swc")).unwrap();
    assert_eq!(body, "1 1 0 0 0 1 -1\n");
}

#[test]
fn dropped_staging_dir_leaves_nothing() {
    let (_temp, cache) = temp_cache();
    let id: DatasetId = "mouselight_AA0040".parse().unwrap();
    {
        let staging = cache.staging_dir(&id).unwrap();
        fs::write(staging.path().join("partial.swc"), "1 1 0").unwrap();
    }
    let leftovers = fs::read_dir(cache.datasets_dir()).unwrap().count();
    assert_eq!(leftovers, 0);
    assert!(!cache.is_downloaded(&id));
}
