use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use atlasreg::atlas::{AtlasProvider, AtlasStatus, AtlasTracker, LatestVersions};
use atlasreg::cache::LocalCache;
use atlasreg::error::AtlasregError;

const ATLAS: &str = "allen_mouse_25um";

struct FixedVersions(Option<&'static str>);

impl LatestVersions for FixedVersions {
    fn latest_versions(&self) -> Result<BTreeMap<String, String>, AtlasregError> {
        match self.0 {
            Some(version) => Ok(BTreeMap::from([(ATLAS.to_string(), version.to_string())])),
            None => Err(AtlasregError::NetworkFailure {
                provider: "BrainGlobe".to_string(),
                message: "offline".to_string(),
            }),
        }
    }
}

fn fixture(latest: Option<&'static str>) -> (tempfile::TempDir, AtlasTracker) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let tracker = AtlasTracker::new(LocalCache::new_with_root(root), Arc::new(FixedVersions(latest)));
    (temp, tracker)
}

fn install_atlas(temp: &tempfile::TempDir, version: &str, metadata: &str) {
    let dir = temp.path().join(format!("{ATLAS}_v{version}"));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("metadata.json"), metadata).unwrap();
    fs::write(
        dir.join("structures.json"),
        r#"[{"acronym": "root", "id": 997, "name": "root", "structure_id_path": [997], "rgb_triplet": [255, 255, 255]},
            {"acronym": "VISp", "id": 385, "name": "Primary visual area"}]"#,
    )
    .unwrap();
}

const METADATA: &str =
    r#"{"name": "allen_mouse_25um", "resolution": [25.0, 25.0, 25.0], "shape": [528, 320, 456], "species": "Mus musculus"}"#;

#[test]
fn missing_atlas_is_not_downloaded() {
    let (_temp, tracker) = fixture(Some("1.2"));
    assert_eq!(tracker.status(ATLAS), AtlasStatus::NotDownloaded);
    assert!(!tracker.is_available(ATLAS));
    assert_matches!(tracker.frame(ATLAS), Err(AtlasregError::AtlasMetadata(_)));
}

#[test]
fn cached_atlas_exposes_frame() {
    let (temp, tracker) = fixture(Some("1.2"));
    install_atlas(&temp, "1.2", METADATA);

    assert!(tracker.is_available(ATLAS));
    assert_eq!(
        tracker.status(ATLAS),
        AtlasStatus::UpToDate {
            version: "1.2".to_string()
        }
    );
    let frame = tracker.frame(ATLAS).unwrap();
    assert_eq!(frame.resolution, [25.0, 25.0, 25.0]);
    assert_eq!(frame.shape, [528, 320, 456]);
    assert_eq!(frame.version, "1.2");

    let structures = tracker.structures(ATLAS).unwrap();
    assert_eq!(structures.len(), 2);
    assert_eq!(structures[1].acronym, "VISp");
    assert!(structures[1].rgb_triplet.is_empty());
}

#[test]
fn highest_local_version_wins() {
    let (temp, tracker) = fixture(Some("1.10"));
    install_atlas(&temp, "1.2", METADATA);
    install_atlas(&temp, "1.10", METADATA);
    fs::create_dir_all(temp.path().join("allen_mouse_25um_vnext")).unwrap();
    fs::create_dir_all(temp.path().join("allen_mouse_10um_v9.0")).unwrap();

    assert_eq!(tracker.local_version(ATLAS).as_deref(), Some("1.10"));
    assert!(!tracker.needs_update(ATLAS));
}

#[test]
fn newer_upstream_version_is_reported() {
    let (temp, tracker) = fixture(Some("1.3"));
    install_atlas(&temp, "1.2", METADATA);
    assert_eq!(
        tracker.status(ATLAS),
        AtlasStatus::UpdateAvailable {
            local: "1.2".to_string(),
            latest: "1.3".to_string()
        }
    );
    assert!(tracker.needs_update(ATLAS));
}

#[test]
fn offline_lookup_leaves_status_unknown() {
    let (temp, tracker) = fixture(None);
    install_atlas(&temp, "1.2", METADATA);
    assert_eq!(
        tracker.status(ATLAS),
        AtlasStatus::Unknown {
            local: "1.2".to_string()
        }
    );
    assert!(tracker.is_available(ATLAS));
}

#[test]
fn malformed_frame_metadata_is_rejected() {
    let (temp, tracker) = fixture(Some("1.2"));
    install_atlas(&temp, "1.2", r#"{"resolution": [25.0, 25.0], "shape": [1, 2, 3]}"#);
    assert_matches!(
        tracker.frame(ATLAS),
        Err(AtlasregError::AtlasMetadata(message)) if message.contains("resolution")
    );

    let (temp, tracker) = fixture(Some("1.2"));
    install_atlas(&temp, "1.2", r#"{"resolution": [25.0, 25.0, 25.0], "shape": [0, 2, 3]}"#);
    assert_matches!(tracker.frame(ATLAS), Err(AtlasregError::InvalidAtlasFrame(_)));
}
