use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{info, warn};

use crate::atlas::{AtlasProvider, AtlasStatus, AtlasTracker, HttpLatestVersions};
use crate::cache::LocalCache;
use crate::config::ResolvedConfig;
use crate::domain::{
    AtlasFrame, DataType, DatasetDescriptor, DatasetId, DatasetSpecifier, DownloadState,
    FileFormat, SourceKind,
};
use crate::download::{DownloadManager, DownloadOptions, DownloadOutcome};
use crate::error::AtlasregError;
use crate::formats::nrrd::write_nrrd;
use crate::formats::volume::SNIFF_LEN;
use crate::formats::{DetectedFormat, detect_format, load_volume, read_points, read_swc};
use crate::providers::{
    AllenAdapter, MouseLightAdapter, NeuroMorphoAdapter, Providers, SearchQuery, UrlAdapter,
};
use crate::registration::{RawGeometry, RegisteredGeometry, register};
use crate::registry::DatasetRegistry;
use crate::worker::{TaskHandle, WorkerPool};

#[derive(Debug, Clone, Serialize)]
pub struct DatasetRow {
    pub id: DatasetId,
    pub name: String,
    pub source: SourceKind,
    pub species: String,
    pub structure: Option<String>,
    pub data_type: DataType,
    pub format: FileFormat,
    pub size_mb: f64,
    pub atlas: Option<String>,
    pub status: DownloadState,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub query: SearchQuery,
    pub datasets: Vec<DatasetRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub datasets: Vec<DatasetRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub dataset: DatasetDescriptor,
    pub status: DownloadState,
    pub path: Option<Utf8PathBuf>,
    pub data_file: Option<Utf8PathBuf>,
    pub downloaded_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveResult {
    pub dataset_id: DatasetId,
    pub removed: bool,
}

/// Counts reported while parsing a cached data file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub format: Option<FileFormat>,
    pub skipped_lines: usize,
    pub dropped_parents: usize,
    pub strategy: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub geometry: RawGeometry,
    pub report: LoadReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationSummary {
    pub kind: &'static str,
    pub total: usize,
    pub kept: usize,
    pub dropped: usize,
    pub shape: Option<[usize; 3]>,
    pub source_shape: Option<[usize; 3]>,
    pub strategy: Option<&'static str>,
}

impl RegistrationSummary {
    fn of(geometry: &RegisteredGeometry) -> Self {
        match geometry {
            RegisteredGeometry::Points(points) => Self {
                kind: "points",
                total: points.total,
                kept: points.points.len(),
                dropped: points.dropped,
                shape: None,
                source_shape: None,
                strategy: None,
            },
            RegisteredGeometry::Volume(volume) => {
                let voxels = volume.shape.iter().product();
                Self {
                    kind: "volume",
                    total: voxels,
                    kept: voxels,
                    dropped: 0,
                    shape: Some(volume.shape),
                    source_shape: Some(volume.source_shape),
                    strategy: volume.strategy,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationResult {
    pub dataset_id: DatasetId,
    pub atlas: String,
    pub atlas_version: String,
    pub download: DownloadOutcome,
    pub load: LoadReport,
    pub summary: RegistrationSummary,
    pub output: Option<PathBuf>,
    #[serde(skip)]
    pub geometry: RegisteredGeometry,
}

#[derive(Debug, Clone, Serialize)]
pub struct AtlasResult {
    pub atlas: String,
    pub status: AtlasStatus,
    pub frame: Option<AtlasFrame>,
    pub structures: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn emit(sink: &dyn ProgressSink, message: String, started: Option<Instant>) {
    sink.event(ProgressEvent {
        message,
        elapsed: started.map(|start| start.elapsed()),
    });
}

pub struct App {
    config: ResolvedConfig,
    registry: Arc<DatasetRegistry>,
    cache: LocalCache,
    providers: Providers,
    tracker: AtlasTracker,
    downloads: DownloadManager,
}

impl App {
    /// Wires the pipeline and seeds the registry from configured datasets
    /// and previously downloaded cache entries.
    pub fn new(
        config: ResolvedConfig,
        cache: LocalCache,
        providers: Providers,
        tracker: AtlasTracker,
    ) -> Result<Self, AtlasregError> {
        let registry = Arc::new(DatasetRegistry::new());
        for descriptor in &config.datasets {
            registry.insert(descriptor.clone());
        }
        let downloads = DownloadManager::new(
            Arc::clone(&registry),
            cache.clone(),
            providers.clone(),
            Arc::new(tracker.clone()),
        );
        let app = Self {
            config,
            registry,
            cache,
            providers,
            tracker,
            downloads,
        };
        app.hydrate_from_cache()?;
        Ok(app)
    }

    /// Production wiring: HTTP adapters for every enabled source and the
    /// published atlas version list.
    pub fn from_config(config: ResolvedConfig) -> Result<Self, AtlasregError> {
        let cache = match &config.cache_root {
            Some(root) => LocalCache::new_with_root(root.clone()),
            None => LocalCache::new()?,
        };
        let providers = build_providers(&config)?;
        let latest = HttpLatestVersions::new(config.http_timeout)?;
        let tracker = AtlasTracker::new(cache.clone(), Arc::new(latest));
        Self::new(config, cache, providers, tracker)
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DatasetRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn tracker(&self) -> &AtlasTracker {
        &self.tracker
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    /// Registers every valid cache entry not already known. Returns how
    /// many entries were added.
    pub fn hydrate_from_cache(&self) -> Result<usize, AtlasregError> {
        let mut added = 0;
        for metadata in self.cache.list_downloaded()? {
            if self.registry.contains(&metadata.dataset_id) {
                continue;
            }
            self.registry.insert(metadata.to_descriptor());
            added += 1;
        }
        if added > 0 {
            info!(entries = added, "registered cached datasets");
        }
        Ok(added)
    }

    pub fn search(
        &self,
        query: SearchQuery,
        only: Option<SourceKind>,
        sink: &dyn ProgressSink,
    ) -> Result<SearchResult, AtlasregError> {
        let started = Instant::now();
        let sources = match only {
            Some(kind) => kind.to_string(),
            None => self
                .providers
                .kinds()
                .iter()
                .filter(|kind| **kind != SourceKind::Url)
                .map(|kind| kind.to_string())
                .collect::<Vec<_>>()
                .join(","),
        };
        emit(sink, format!("phase=Resolve; searching {sources}"), None);
        if let Some(kind) = only {
            self.providers.get(kind)?;
        }
        let candidates = self.providers.search(&query, only);
        let datasets = candidates
            .into_iter()
            .map(|candidate| self.registry.register(candidate))
            .filter_map(|id| self.registry.lookup(&id))
            .map(|descriptor| self.row(descriptor))
            .collect::<Vec<_>>();
        emit(
            sink,
            format!("phase=Resolve; {} datasets found", datasets.len()),
            Some(started),
        );
        Ok(SearchResult { query, datasets })
    }

    pub fn list(
        &self,
        species: Option<&str>,
        data_type: Option<DataType>,
        sink: &dyn ProgressSink,
    ) -> Result<ListResult, AtlasregError> {
        emit(sink, "phase=Resolve; scanning registry".to_string(), None);
        let datasets = self
            .registry
            .list(species, data_type)
            .into_iter()
            .map(|descriptor| self.row(descriptor))
            .collect();
        Ok(ListResult { datasets })
    }

    pub fn info(
        &self,
        specifier: &DatasetSpecifier,
        sink: &dyn ProgressSink,
    ) -> Result<InfoResult, AtlasregError> {
        let id = self.resolve(specifier, sink)?;
        let dataset = self.descriptor(&id)?;
        let metadata = self.cache.read_metadata(&id).ok();
        let path = self.cache.dataset_path(&id);
        let data_file = path
            .as_ref()
            .and_then(|dir| metadata.as_ref().map(|meta| dir.join(&meta.file_name)));
        Ok(InfoResult {
            status: self.downloads.state(&id),
            dataset,
            path,
            data_file,
            downloaded_at: metadata.and_then(|meta| meta.downloaded_at),
        })
    }

    /// Turns a specifier into a registered id. Upstream specifiers not yet
    /// in the registry are looked up through their adapter.
    pub fn resolve(
        &self,
        specifier: &DatasetSpecifier,
        sink: &dyn ProgressSink,
    ) -> Result<DatasetId, AtlasregError> {
        match specifier {
            DatasetSpecifier::Registered(id) => {
                if self.registry.contains(id) {
                    Ok(id.clone())
                } else {
                    Err(AtlasregError::NotAvailable(id.to_string()))
                }
            }
            DatasetSpecifier::Upstream { source, native_id } => {
                let id = DatasetId::for_source(*source, native_id);
                if self.registry.contains(&id) {
                    return Ok(id);
                }
                emit(
                    sink,
                    format!("phase=Resolve; looking up {source}:{native_id}"),
                    None,
                );
                let candidate = self.providers.get(*source)?.lookup(native_id)?;
                Ok(self.registry.register(candidate))
            }
        }
    }

    pub fn download(
        &self,
        specifier: &DatasetSpecifier,
        options: DownloadOptions,
        progress: &mut dyn FnMut(u64, u64),
        sink: &dyn ProgressSink,
    ) -> Result<DownloadOutcome, AtlasregError> {
        let id = self.resolve(specifier, sink)?;
        let started = Instant::now();
        emit(sink, format!("phase=Fetch; {id}"), None);
        let outcome = self.downloads.download(&id, options, progress)?;
        emit(
            sink,
            format!("phase=Store; {id} -> {}", outcome.path),
            Some(started),
        );
        Ok(outcome)
    }

    /// Queues a download of an already resolved id on `pool`.
    pub fn spawn_download(
        &self,
        pool: &WorkerPool,
        id: DatasetId,
        options: DownloadOptions,
    ) -> TaskHandle<DownloadOutcome> {
        let downloads = self.downloads.clone();
        pool.submit(move |reporter| {
            downloads.download(&id, options, &mut |completed: u64, total: u64| {
                reporter.report(completed, total)
            })
        })
    }

    pub fn remove(
        &self,
        specifier: &DatasetSpecifier,
        sink: &dyn ProgressSink,
    ) -> Result<RemoveResult, AtlasregError> {
        let id = match specifier {
            DatasetSpecifier::Registered(id) => id.clone(),
            DatasetSpecifier::Upstream { source, native_id } => {
                DatasetId::for_source(*source, native_id)
            }
        };
        emit(sink, format!("phase=Store; removing {id}"), None);
        let removed = self.cache.remove(&id)?;
        if removed {
            info!(dataset = %id, "cache entry removed");
        }
        Ok(RemoveResult {
            dataset_id: id,
            removed,
        })
    }

    /// Parses the cached data file of `id`. `frame` supplies the expected
    /// volume shape for raw byte reinterpretation.
    pub fn load(
        &self,
        id: &DatasetId,
        frame: Option<&AtlasFrame>,
        sink: &dyn ProgressSink,
    ) -> Result<LoadedDataset, AtlasregError> {
        if !self.cache.is_downloaded(id) {
            return Err(AtlasregError::NotDownloaded(id.to_string()));
        }
        let descriptor = self.descriptor(id)?;
        let data_file = self.cache.data_file(id)?;
        let started = Instant::now();
        emit(
            sink,
            format!("phase=Parse; {} ({})", data_file, descriptor.format),
            None,
        );

        let path = data_file.as_std_path();
        let detected = sniff(path)?;
        let text_format = match (detected, descriptor.format) {
            (DetectedFormat::Unknown, format @ (FileFormat::Swc | FileFormat::Csv)) => Some(format),
            _ => None,
        };
        if detected != DetectedFormat::Unknown
            && matches!(descriptor.format, FileFormat::Swc | FileFormat::Csv)
        {
            warn!(
                dataset = %id,
                declared = %descriptor.format,
                detected = ?detected,
                "file content does not match the declared format"
            );
        }
        let loaded = match text_format {
            Some(FileFormat::Swc) => {
                let parsed = read_swc(path)?;
                LoadedDataset {
                    report: LoadReport {
                        format: Some(FileFormat::Swc),
                        skipped_lines: parsed.skipped.len(),
                        dropped_parents: parsed.dropped_parents,
                        strategy: None,
                    },
                    geometry: RawGeometry::Morphology(parsed.morphology),
                }
            }
            Some(_) => {
                let parsed = read_points(path)?;
                LoadedDataset {
                    report: LoadReport {
                        format: Some(FileFormat::Csv),
                        skipped_lines: parsed.skipped.len(),
                        dropped_parents: 0,
                        strategy: None,
                    },
                    geometry: RawGeometry::Points(parsed.points),
                }
            }
            None => {
                let volume = load_volume(path, frame.map(|frame| frame.shape))?;
                LoadedDataset {
                    report: LoadReport {
                        format: volume_format(volume.detected).or(Some(descriptor.format)),
                        skipped_lines: 0,
                        dropped_parents: 0,
                        strategy: Some(volume.strategy),
                    },
                    geometry: RawGeometry::Volume(volume.data),
                }
            }
        };
        if loaded.report.skipped_lines > 0 || loaded.report.dropped_parents > 0 {
            warn!(
                dataset = %id,
                skipped = loaded.report.skipped_lines,
                dropped_parents = loaded.report.dropped_parents,
                "records skipped while parsing"
            );
        }
        emit(sink, format!("phase=Parse; {id} parsed"), Some(started));
        Ok(loaded)
    }

    /// Downloads if needed, parses and maps `specifier` into `atlas` (or
    /// the dataset's own atlas, or the configured default). Writes the
    /// result to `output` when given: NRRD for volumes, JSON otherwise.
    pub fn register(
        &self,
        specifier: &DatasetSpecifier,
        atlas: Option<&str>,
        output: Option<&Path>,
        progress: &mut dyn FnMut(u64, u64),
        sink: &dyn ProgressSink,
    ) -> Result<RegistrationResult, AtlasregError> {
        let id = self.resolve(specifier, sink)?;
        let descriptor = self.descriptor(&id)?;
        let atlas_name = atlas
            .map(str::to_string)
            .or_else(|| descriptor.atlas.clone())
            .unwrap_or_else(|| self.config.default_atlas.clone());
        if !self.tracker.is_available(&atlas_name) {
            return Err(AtlasregError::MissingAtlas {
                dataset: id.to_string(),
                atlas: atlas_name,
            });
        }
        let frame = self.tracker.frame(&atlas_name)?;

        let download = self.download(
            &DatasetSpecifier::Registered(id.clone()),
            DownloadOptions::default(),
            progress,
            sink,
        )?;
        let loaded = self.load(&id, Some(&frame), sink)?;

        let started = Instant::now();
        emit(
            sink,
            format!("phase=Register; {id} -> {} v{}", frame.name, frame.version),
            None,
        );
        let geometry = register(loaded.geometry, &frame)?;
        let summary = RegistrationSummary::of(&geometry);
        info!(
            dataset = %id,
            atlas = %frame.name,
            kept = summary.kept,
            dropped = summary.dropped,
            "dataset registered"
        );

        let output = match output {
            Some(path) => {
                write_registered(path, &geometry, &frame)?;
                emit(
                    sink,
                    format!("phase=Store; wrote {}", path.display()),
                    None,
                );
                Some(path.to_path_buf())
            }
            None => None,
        };
        emit(sink, format!("phase=Register; {id} done"), Some(started));

        Ok(RegistrationResult {
            dataset_id: id,
            atlas: atlas_name,
            atlas_version: frame.version,
            download,
            load: loaded.report,
            summary,
            output,
            geometry,
        })
    }

    pub fn atlas_status(&self, atlas_name: &str) -> AtlasResult {
        let status = self.tracker.status(atlas_name);
        let frame = match self.tracker.frame(atlas_name) {
            Ok(frame) => Some(frame),
            Err(err) => {
                if status != AtlasStatus::NotDownloaded {
                    warn!(atlas = atlas_name, error = %err, "atlas frame unreadable");
                }
                None
            }
        };
        let structures = self
            .tracker
            .structures(atlas_name)
            .ok()
            .map(|structures| structures.len());
        AtlasResult {
            atlas: atlas_name.to_string(),
            status,
            frame,
            structures,
        }
    }

    fn descriptor(&self, id: &DatasetId) -> Result<DatasetDescriptor, AtlasregError> {
        if let Some(descriptor) = self.registry.lookup(id) {
            return Ok(descriptor);
        }
        self.cache
            .read_metadata(id)
            .map(|metadata| metadata.to_descriptor())
            .map_err(|_| AtlasregError::NotAvailable(id.to_string()))
    }

    fn row(&self, descriptor: DatasetDescriptor) -> DatasetRow {
        DatasetRow {
            status: self.downloads.state(&descriptor.id),
            id: descriptor.id,
            name: descriptor.name,
            source: descriptor.source,
            species: descriptor.species,
            structure: descriptor.structure_area,
            data_type: descriptor.data_type,
            format: descriptor.format,
            size_mb: descriptor.size_mb,
            atlas: descriptor.atlas,
        }
    }
}

/// One adapter per enabled source, honoring configured base URLs.
pub fn build_providers(config: &ResolvedConfig) -> Result<Providers, AtlasregError> {
    let timeout = config.http_timeout;
    let mut providers = Providers::new();
    let allen = config.source(SourceKind::Allen);
    if allen.enabled {
        providers.insert(Arc::new(AllenAdapter::new(allen.base_url.as_deref(), timeout)?));
    }
    let mouselight = config.source(SourceKind::MouseLight);
    if mouselight.enabled {
        providers.insert(Arc::new(MouseLightAdapter::new(
            mouselight.base_url.as_deref(),
            timeout,
        )?));
    }
    let neuromorpho = config.source(SourceKind::NeuroMorpho);
    if neuromorpho.enabled {
        providers.insert(Arc::new(NeuroMorphoAdapter::new(
            neuromorpho.base_url.as_deref(),
            timeout,
        )?));
    }
    providers.insert(Arc::new(UrlAdapter::new(timeout)?));
    Ok(providers)
}

/// Magic detected in the leading bytes of `path`.
fn sniff(path: &Path) -> Result<DetectedFormat, AtlasregError> {
    let filesystem = |err: std::io::Error| AtlasregError::Filesystem(format!("{}: {err}", path.display()));
    let mut head = Vec::with_capacity(SNIFF_LEN);
    File::open(path)
        .map_err(filesystem)?
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)
        .map_err(filesystem)?;
    Ok(detect_format(&head))
}

fn volume_format(detected: DetectedFormat) -> Option<FileFormat> {
    match detected {
        DetectedFormat::Nrrd => Some(FileFormat::Nrrd),
        DetectedFormat::Tiff => Some(FileFormat::Tiff),
        DetectedFormat::Png => Some(FileFormat::Png),
        DetectedFormat::Jpeg => Some(FileFormat::Jpeg),
        DetectedFormat::Gif => Some(FileFormat::Gif),
        DetectedFormat::Unknown => None,
    }
}

fn write_registered(
    path: &Path,
    geometry: &RegisteredGeometry,
    frame: &AtlasFrame,
) -> Result<(), AtlasregError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|err| AtlasregError::Filesystem(format!("{}: {err}", parent.display())))?;
    }
    match geometry {
        RegisteredGeometry::Volume(volume) => write_nrrd(path, &volume.data, Some(frame.resolution)),
        RegisteredGeometry::Points(points) => {
            let content = serde_json::to_vec_pretty(points)
                .map_err(|err| AtlasregError::Filesystem(err.to_string()))?;
            fs::write(path, content)
                .map_err(|err| AtlasregError::Filesystem(format!("{}: {err}", path.display())))
        }
    }
}
