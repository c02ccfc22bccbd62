use serde::Serialize;

pub mod nrrd;
pub mod points;
pub mod swc;
pub mod volume;

pub use points::{PointsParse, parse_points, read_points};
pub use swc::{SwcParse, parse_swc, read_swc};
pub use volume::{DetectedFormat, LoadedVolume, LoaderChain, detect_format, load_volume};

/// A record that was skipped during parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedLine {
    /// 1-based.
    pub line: usize,
    pub reason: String,
}
