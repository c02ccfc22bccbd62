use assert_matches::assert_matches;
use ndarray::Array3;

use atlasreg::domain::{AtlasFrame, NeuronMorphology};
use atlasreg::error::AtlasregError;
use atlasreg::registration::{
    CropPad, RawGeometry, RegisteredGeometry, ResampleChain, Resampler, SliceResize, Trilinear,
    register, register_morphology, register_points, register_volume, to_pixel,
};

fn frame(shape: [usize; 3]) -> AtlasFrame {
    AtlasFrame {
        name: "allen_mouse_25um".to_string(),
        resolution: [25.0, 25.0, 25.0],
        shape,
        version: "1.2".to_string(),
    }
}

#[test]
fn physical_point_maps_to_pixel() {
    let registered = register_points(&[[250.0, 250.0, 250.0]], &frame([528, 320, 456])).unwrap();
    assert_eq!(registered.points, vec![[10.0, 10.0, 10.0]]);
    assert_eq!(registered.total, 1);
    assert_eq!(registered.dropped, 0);
}

#[test]
fn axes_are_scaled_independently_and_reversed() {
    let pixel = to_pixel([100.0, 50.0, 30.0], [10.0, 5.0, 2.0]);
    assert_eq!(pixel, [15.0, 10.0, 10.0]);
}

#[test]
fn points_outside_are_dropped_and_connections_reindexed() {
    let morphology = NeuronMorphology {
        points: vec![
            [25.0, 25.0, 25.0],
            [100_000.0, 25.0, 25.0],
            [50.0, 50.0, 50.0],
            [75.0, 75.0, 75.0],
        ],
        connections: vec![(0, 1), (1, 2), (0, 2), (2, 3)],
        radii: vec![1.0, 2.0, 3.0, 4.0],
    };
    let registered = register_morphology(&morphology, &frame([10, 10, 10])).unwrap();
    assert_eq!(registered.total, 4);
    assert_eq!(registered.dropped, 1);
    assert_eq!(registered.points.len(), 3);
    assert_eq!(registered.connections, vec![(0, 1), (1, 2)]);
    assert_eq!(registered.radii, vec![1.0, 3.0, 4.0]);
    assert_eq!(registered.segments().len(), 2);
}

#[test]
fn upper_bound_is_exclusive() {
    // x = 250 / 25 = 10 equals the x extent of a 10-wide atlas.
    let registered = register_points(&[[250.0, 0.0, 0.0], [0.0, 0.0, 0.0]], &frame([10, 10, 10])).unwrap();
    assert_eq!(registered.points, vec![[0.0, 0.0, 0.0]]);
    assert_eq!(registered.dropped, 1);
}

#[test]
fn all_points_outside_is_an_error() {
    let result = register_points(&[[-25.0, 0.0, 0.0], [1.0e6, 0.0, 0.0]], &frame([10, 10, 10]));
    assert_matches!(
        result,
        Err(AtlasregError::OutOfBounds { total: 2, shape: [10, 10, 10] })
    );
}

#[test]
fn empty_input_is_invalid() {
    assert_matches!(
        register_points(&[], &frame([10, 10, 10])),
        Err(AtlasregError::InvalidGeometry(_))
    );
}

#[test]
fn invalid_frame_is_rejected() {
    let mut bad = frame([10, 10, 10]);
    bad.resolution = [25.0, 0.0, 25.0];
    assert_matches!(
        register_points(&[[1.0, 1.0, 1.0]], &bad),
        Err(AtlasregError::InvalidAtlasFrame(_))
    );
}

#[test]
fn morphology_with_dangling_connection_is_invalid() {
    let morphology = NeuronMorphology {
        points: vec![[0.0, 0.0, 0.0]],
        connections: vec![(0, 3)],
        radii: vec![1.0],
    };
    assert_matches!(
        register_morphology(&morphology, &frame([10, 10, 10])),
        Err(AtlasregError::InvalidGeometry(_))
    );
}

#[test]
fn matching_volume_is_passed_through() {
    let volume = Array3::from_elem((4, 5, 6), 2.0f32);
    let registered = register_volume(volume.clone(), &frame([4, 5, 6])).unwrap();
    assert_eq!(registered.strategy, None);
    assert_eq!(registered.data, volume);
}

#[test]
fn volume_is_resampled_to_atlas_shape() {
    let volume = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (z + y + x) as f32);
    let registered = register_volume(volume, &frame([6, 8, 10])).unwrap();
    assert_eq!(registered.shape, [6, 8, 10]);
    assert_eq!(registered.source_shape, [3, 4, 5]);
    assert_eq!(registered.data.dim(), (6, 8, 10));
    assert_eq!(registered.strategy, Some("trilinear"));
    assert_eq!(registered.data[[0, 0, 0]], 0.0);
    assert!((registered.data[[5, 7, 9]] - 9.0).abs() < 1e-5);
}

#[test]
fn single_slice_falls_back_to_slice_resize() {
    let volume = Array3::from_elem((1, 4, 4), 3.0f32);
    let registered = register_volume(volume, &frame([3, 8, 8])).unwrap();
    assert_eq!(registered.strategy, Some("slice-resize"));
    assert_eq!(registered.attempts.len(), 1);
    assert_eq!(registered.attempts[0].strategy, "trilinear");
    assert!(registered.data.iter().all(|value| (*value - 3.0).abs() < 1e-6));
}

#[test]
fn slice_resize_subsamples_depth() {
    let volume = Array3::from_shape_fn((5, 2, 2), |(z, _, _)| z as f32);
    let resized = SliceResize.resample(&volume, [3, 2, 2]).unwrap();
    let depths: Vec<f32> = (0..3).map(|z| resized[[z, 0, 0]]).collect();
    assert_eq!(depths, vec![0.0, 2.0, 4.0]);
}

struct WrongShape;

impl Resampler for WrongShape {
    fn name(&self) -> &'static str {
        "wrong-shape"
    }

    fn resample(&self, _volume: &Array3<f32>, _target: [usize; 3]) -> Result<Array3<f32>, String> {
        Ok(Array3::zeros((1, 1, 1)))
    }
}

#[test]
fn strategy_output_shape_is_verified() {
    let chain = ResampleChain::with_strategies(vec![Box::new(WrongShape), Box::new(CropPad)]);
    let volume = Array3::from_elem((2, 2, 2), 1.0f32);
    let resampled = chain.resample(&volume, [4, 4, 4]).unwrap();
    assert_eq!(resampled.strategy, "crop-pad");
    assert_eq!(resampled.attempts[0].strategy, "wrong-shape");
}

#[test]
fn exhausted_chain_reports_every_failure() {
    let chain = ResampleChain::with_strategies(vec![Box::new(Trilinear), Box::new(WrongShape)]);
    let volume = Array3::from_elem((1, 2, 2), 1.0f32);
    let err = chain.resample(&volume, [4, 4, 4]).err().unwrap();
    assert_matches!(err, AtlasregError::ResampleFailed { ref attempts } if attempts.len() == 2);
}

#[test]
fn register_dispatches_on_geometry() {
    let registered = register(RawGeometry::Points(vec![[25.0, 50.0, 75.0]]), &frame([10, 10, 10])).unwrap();
    let RegisteredGeometry::Points(points) = registered else {
        panic!("expected points");
    };
    assert_eq!(points.points, vec![[3.0, 2.0, 1.0]]);
}
