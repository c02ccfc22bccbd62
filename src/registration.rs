//! Maps raw physical-unit geometry into an atlas's pixel space.
//!
//! Raw coordinates are (x, y, z) in the atlas's physical unit; registered
//! coordinates are (z, y, x) pixels. Points outside the atlas volume are
//! dropped and connections re-indexed over the survivors. Volumes whose
//! shape differs from the atlas are resampled through [`ResampleChain`].

use std::collections::HashMap;

use ndarray::{Array3, Axis};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{AtlasFrame, NeuronMorphology, segments};
use crate::error::{AtlasregError, StrategyFailure};

/// Parsed input awaiting registration.
#[derive(Debug, Clone)]
pub enum RawGeometry {
    Points(Vec<[f64; 3]>),
    Morphology(NeuronMorphology),
    Volume(Array3<f32>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegisteredGeometry {
    Points(RegisteredPoints),
    Volume(RegisteredVolume),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredPoints {
    /// (z, y, x) pixel coordinates.
    pub points: Vec<[f64; 3]>,
    pub connections: Vec<(usize, usize)>,
    /// Empty for plain point clouds.
    pub radii: Vec<f64>,
    pub total: usize,
    pub dropped: usize,
}

impl RegisteredPoints {
    pub fn segments(&self) -> Vec<[[f64; 3]; 2]> {
        segments(&self.points, &self.connections)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredVolume {
    #[serde(skip)]
    pub data: Array3<f32>,
    pub shape: [usize; 3],
    pub source_shape: [usize; 3],
    /// `None` when the source already had the atlas shape.
    pub strategy: Option<&'static str>,
    pub attempts: Vec<StrategyFailure>,
}

pub fn register(raw: RawGeometry, frame: &AtlasFrame) -> Result<RegisteredGeometry, AtlasregError> {
    match raw {
        RawGeometry::Points(points) => register_points(&points, frame).map(RegisteredGeometry::Points),
        RawGeometry::Morphology(morphology) => {
            register_morphology(&morphology, frame).map(RegisteredGeometry::Points)
        }
        RawGeometry::Volume(volume) => register_volume(volume, frame).map(RegisteredGeometry::Volume),
    }
}

/// Physical (x, y, z) to pixel (z, y, x).
pub fn to_pixel(point: [f64; 3], resolution: [f64; 3]) -> [f64; 3] {
    [
        point[2] / resolution[2],
        point[1] / resolution[1],
        point[0] / resolution[0],
    ]
}

pub fn in_bounds(pixel: [f64; 3], shape: [usize; 3]) -> bool {
    pixel
        .iter()
        .zip(shape.iter())
        .all(|(coordinate, size)| *coordinate >= 0.0 && *coordinate < *size as f64)
}

pub fn register_points(
    points: &[[f64; 3]],
    frame: &AtlasFrame,
) -> Result<RegisteredPoints, AtlasregError> {
    let morphology = NeuronMorphology {
        points: points.to_vec(),
        connections: Vec::new(),
        radii: Vec::new(),
    };
    register_tree(&morphology, frame, false)
}

pub fn register_morphology(
    morphology: &NeuronMorphology,
    frame: &AtlasFrame,
) -> Result<RegisteredPoints, AtlasregError> {
    morphology.validate()?;
    register_tree(morphology, frame, true)
}

fn register_tree(
    morphology: &NeuronMorphology,
    frame: &AtlasFrame,
    keep_radii: bool,
) -> Result<RegisteredPoints, AtlasregError> {
    frame.validate()?;
    let total = morphology.points.len();
    if total == 0 {
        return Err(AtlasregError::InvalidGeometry("no points to register".to_string()));
    }

    let mut new_index = HashMap::with_capacity(total);
    let mut registered = RegisteredPoints {
        points: Vec::with_capacity(total),
        connections: Vec::new(),
        radii: Vec::new(),
        total,
        dropped: 0,
    };
    for (old, point) in morphology.points.iter().enumerate() {
        let pixel = to_pixel(*point, frame.resolution);
        if !in_bounds(pixel, frame.shape) {
            continue;
        }
        new_index.insert(old, registered.points.len());
        registered.points.push(pixel);
        if keep_radii {
            registered.radii.push(morphology.radii[old]);
        }
    }
    if registered.points.is_empty() {
        return Err(AtlasregError::OutOfBounds {
            total,
            shape: frame.shape,
        });
    }
    registered.dropped = total - registered.points.len();
    registered.connections = morphology
        .connections
        .iter()
        .filter_map(|(parent, child)| Some((*new_index.get(parent)?, *new_index.get(child)?)))
        .collect();

    if registered.dropped > 0 {
        warn!(
            atlas = %frame.name,
            kept = registered.points.len(),
            total,
            shape = ?frame.shape,
            "points outside the atlas volume were dropped"
        );
    } else {
        debug!(atlas = %frame.name, total, "all points inside the atlas volume");
    }
    Ok(registered)
}

pub fn register_volume(
    volume: Array3<f32>,
    frame: &AtlasFrame,
) -> Result<RegisteredVolume, AtlasregError> {
    frame.validate()?;
    let (z, y, x) = volume.dim();
    let source_shape = [z, y, x];
    if source_shape.contains(&0) {
        return Err(AtlasregError::InvalidGeometry(format!(
            "volume has an empty axis: {source_shape:?}"
        )));
    }
    if source_shape == frame.shape {
        return Ok(RegisteredVolume {
            data: volume,
            shape: source_shape,
            source_shape,
            strategy: None,
            attempts: Vec::new(),
        });
    }
    let resampled = ResampleChain::default().resample(&volume, frame.shape)?;
    info!(
        atlas = %frame.name,
        from = ?source_shape,
        to = ?frame.shape,
        strategy = resampled.strategy,
        "volume resampled"
    );
    Ok(RegisteredVolume {
        data: resampled.data,
        shape: frame.shape,
        source_shape,
        strategy: Some(resampled.strategy),
        attempts: resampled.attempts,
    })
}

pub trait Resampler: Send + Sync {
    fn name(&self) -> &'static str;
    fn resample(&self, volume: &Array3<f32>, target: [usize; 3]) -> Result<Array3<f32>, String>;
}

pub struct Resampled {
    pub data: Array3<f32>,
    pub strategy: &'static str,
    /// Strategies that failed before the one that succeeded.
    pub attempts: Vec<StrategyFailure>,
}

pub struct ResampleChain {
    strategies: Vec<Box<dyn Resampler>>,
}

impl Default for ResampleChain {
    fn default() -> Self {
        Self {
            strategies: vec![Box::new(Trilinear), Box::new(SliceResize), Box::new(CropPad)],
        }
    }
}

impl ResampleChain {
    pub fn with_strategies(strategies: Vec<Box<dyn Resampler>>) -> Self {
        Self { strategies }
    }

    /// Tries each strategy in order; an output of the wrong shape counts
    /// as a failure.
    pub fn resample(
        &self,
        volume: &Array3<f32>,
        target: [usize; 3],
    ) -> Result<Resampled, AtlasregError> {
        let mut attempts = Vec::new();
        for strategy in &self.strategies {
            match strategy.resample(volume, target) {
                Ok(data) => {
                    let (z, y, x) = data.dim();
                    if [z, y, x] == target {
                        return Ok(Resampled {
                            data,
                            strategy: strategy.name(),
                            attempts,
                        });
                    }
                    attempts.push(StrategyFailure::new(
                        strategy.name(),
                        format!("produced shape {:?}, expected {target:?}", [z, y, x]),
                    ));
                }
                Err(reason) => attempts.push(StrategyFailure::new(strategy.name(), reason)),
            }
        }
        Err(AtlasregError::ResampleFailed { attempts })
    }
}

/// Source position of each output sample along one axis, corners aligned.
fn aligned_positions(source: usize, target: usize) -> Vec<(usize, usize, f32)> {
    if target == 1 || source == 1 {
        return vec![(0, 0, 0.0); target];
    }
    let scale = (source - 1) as f64 / (target - 1) as f64;
    (0..target)
        .map(|index| {
            let position = index as f64 * scale;
            let lower = (position.floor() as usize).min(source - 1);
            let upper = (lower + 1).min(source - 1);
            (lower, upper, (position - lower as f64) as f32)
        })
        .collect()
}

/// Pixel-center mapping used for 2D resizes.
fn centered_positions(source: usize, target: usize) -> Vec<(usize, usize, f32)> {
    let scale = source as f64 / target as f64;
    (0..target)
        .map(|index| {
            let position = ((index as f64 + 0.5) * scale - 0.5).clamp(0.0, (source - 1) as f64);
            let lower = position.floor() as usize;
            let upper = (lower + 1).min(source - 1);
            (lower, upper, (position - lower as f64) as f32)
        })
        .collect()
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Linear interpolation along all three axes.
pub struct Trilinear;

impl Resampler for Trilinear {
    fn name(&self) -> &'static str {
        "trilinear"
    }

    fn resample(&self, volume: &Array3<f32>, target: [usize; 3]) -> Result<Array3<f32>, String> {
        let (sz, sy, sx) = volume.dim();
        if let Some(axis) = [sz, sy, sx].iter().position(|size| *size < 2) {
            return Err(format!("axis {axis} has fewer than 2 samples"));
        }
        let zs = aligned_positions(sz, target[0]);
        let ys = aligned_positions(sy, target[1]);
        let xs = aligned_positions(sx, target[2]);
        Ok(Array3::from_shape_fn(
            (target[0], target[1], target[2]),
            |(z, y, x)| {
                let (z0, z1, tz) = zs[z];
                let (y0, y1, ty) = ys[y];
                let (x0, x1, tx) = xs[x];
                let plane = |zi: usize| {
                    let top = lerp(volume[[zi, y0, x0]], volume[[zi, y0, x1]], tx);
                    let bottom = lerp(volume[[zi, y1, x0]], volume[[zi, y1, x1]], tx);
                    lerp(top, bottom, ty)
                };
                lerp(plane(z0), plane(z1), tz)
            },
        ))
    }
}

/// Bilinear resize of each slice, then depth matched by replicating the
/// last slice or picking evenly spaced slices.
pub struct SliceResize;

impl Resampler for SliceResize {
    fn name(&self) -> &'static str {
        "slice-resize"
    }

    fn resample(&self, volume: &Array3<f32>, target: [usize; 3]) -> Result<Array3<f32>, String> {
        let (depth, sy, sx) = volume.dim();
        if depth == 0 || sy == 0 || sx == 0 {
            return Err("volume is empty".to_string());
        }
        let ys = centered_positions(sy, target[1]);
        let xs = centered_positions(sx, target[2]);
        let slice_for = |z: usize| -> usize {
            if depth <= target[0] {
                z.min(depth - 1)
            } else if target[0] == 1 {
                0
            } else {
                z * (depth - 1) / (target[0] - 1)
            }
        };
        let mut out = Array3::<f32>::zeros((target[0], target[1], target[2]));
        for (z, mut plane) in out.axis_iter_mut(Axis(0)).enumerate() {
            let source = volume.index_axis(Axis(0), slice_for(z));
            for ((y, x), value) in plane.indexed_iter_mut() {
                let (y0, y1, ty) = ys[y];
                let (x0, x1, tx) = xs[x];
                let top = lerp(source[[y0, x0]], source[[y0, x1]], tx);
                let bottom = lerp(source[[y1, x0]], source[[y1, x1]], tx);
                *value = lerp(top, bottom, ty);
            }
        }
        Ok(out)
    }
}

/// Centered crop or zero pad on each axis.
pub struct CropPad;

impl Resampler for CropPad {
    fn name(&self) -> &'static str {
        "crop-pad"
    }

    fn resample(&self, volume: &Array3<f32>, target: [usize; 3]) -> Result<Array3<f32>, String> {
        let (sz, sy, sx) = volume.dim();
        let offset = |source: usize, target: usize| -> isize {
            if source >= target {
                ((source - target) / 2) as isize
            } else {
                -(((target - source) / 2) as isize)
            }
        };
        let offsets = [offset(sz, target[0]), offset(sy, target[1]), offset(sx, target[2])];
        let source_shape = [sz, sy, sx];
        Ok(Array3::from_shape_fn(
            (target[0], target[1], target[2]),
            |(z, y, x)| {
                let mut index = [0usize; 3];
                for (axis, position) in [z, y, x].into_iter().enumerate() {
                    let mapped = position as isize + offsets[axis];
                    if mapped < 0 || mapped as usize >= source_shape[axis] {
                        return 0.0;
                    }
                    index[axis] = mapped as usize;
                }
                volume[index]
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_positions_hit_both_corners() {
        let positions = aligned_positions(3, 5);
        assert_eq!(positions.first(), Some(&(0, 1, 0.0)));
        assert_eq!(positions.last().map(|p| p.0), Some(2));
    }

    #[test]
    fn crop_pad_centers_content() {
        let volume = Array3::from_elem((1, 2, 2), 1.0f32);
        let padded = CropPad.resample(&volume, [1, 4, 4]).unwrap();
        assert_eq!(padded[[0, 0, 0]], 0.0);
        assert_eq!(padded[[0, 1, 1]], 1.0);
        assert_eq!(padded[[0, 2, 2]], 1.0);
        assert_eq!(padded[[0, 3, 3]], 0.0);
    }
}
