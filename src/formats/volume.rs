use std::fs;
use std::io::Cursor;
use std::path::Path;

use image::{AnimationDecoder, DynamicImage, ImageFormat};
use ndarray::{Array3, Axis, stack};
use serde::Serialize;
use tiff::decoder::{Decoder as TiffDecoder, DecodingResult};
use tracing::{debug, info};

use crate::error::{AtlasregError, StrategyFailure};
use crate::formats::nrrd;

/// Leading bytes [`detect_format`] looks at.
pub const SNIFF_LEN: usize = 20;
const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectedFormat {
    Nrrd,
    Jpeg,
    Png,
    Tiff,
    Gif,
    Unknown,
}

impl DetectedFormat {
    fn image_format(&self) -> Option<ImageFormat> {
        match self {
            DetectedFormat::Jpeg => Some(ImageFormat::Jpeg),
            DetectedFormat::Png => Some(ImageFormat::Png),
            DetectedFormat::Tiff => Some(ImageFormat::Tiff),
            DetectedFormat::Gif => Some(ImageFormat::Gif),
            DetectedFormat::Nrrd | DetectedFormat::Unknown => None,
        }
    }
}

/// Identifies a file from its leading bytes. Extensions are never used.
pub fn detect_format(bytes: &[u8]) -> DetectedFormat {
    let head = &bytes[..bytes.len().min(SNIFF_LEN)];
    if nrrd::is_nrrd(head) {
        DetectedFormat::Nrrd
    } else if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        DetectedFormat::Jpeg
    } else if head.starts_with(PNG_SIGNATURE) {
        DetectedFormat::Png
    } else if head.starts_with(b"II*\0") || head.starts_with(b"MM\0*") {
        DetectedFormat::Tiff
    } else if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        DetectedFormat::Gif
    } else {
        DetectedFormat::Unknown
    }
}

/// What a loader gets to look at.
pub struct Input<'a> {
    pub bytes: &'a [u8],
    pub detected: DetectedFormat,
    /// (z, y, x) shape the caller expects, if known.
    pub expected_shape: Option<[usize; 3]>,
}

pub trait VolumeLoader: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Err(reason)` when the loader's precondition is not met.
    fn accepts(&self, input: &Input<'_>) -> Result<(), String>;

    fn load(&self, input: &Input<'_>) -> Result<Array3<f32>, AtlasregError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadedVolume {
    #[serde(skip)]
    pub data: Array3<f32>,
    pub shape: [usize; 3],
    pub detected: DetectedFormat,
    pub strategy: &'static str,
}

/// Ordered loaders tried until one succeeds.
pub struct LoaderChain {
    loaders: Vec<Box<dyn VolumeLoader>>,
}

impl Default for LoaderChain {
    fn default() -> Self {
        Self {
            loaders: vec![
                Box::new(NrrdLoader),
                Box::new(ImageLoader),
                Box::new(HintedImageLoader),
                Box::new(RawLoader),
            ],
        }
    }
}

impl LoaderChain {
    pub fn with_loaders(loaders: Vec<Box<dyn VolumeLoader>>) -> Self {
        Self { loaders }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.loaders.iter().map(|loader| loader.name()).collect()
    }

    pub fn load_file(
        &self,
        path: &Path,
        expected_shape: Option<[usize; 3]>,
    ) -> Result<LoadedVolume, AtlasregError> {
        let bytes = fs::read(path)
            .map_err(|err| AtlasregError::Filesystem(format!("{}: {err}", path.display())))?;
        self.load_bytes(&path.display().to_string(), &bytes, expected_shape)
    }

    pub fn load_bytes(
        &self,
        label: &str,
        bytes: &[u8],
        expected_shape: Option<[usize; 3]>,
    ) -> Result<LoadedVolume, AtlasregError> {
        let input = Input {
            bytes,
            detected: detect_format(bytes),
            expected_shape,
        };
        debug!(file = label, detected = ?input.detected, "loading volume");
        let mut attempts = Vec::new();
        for loader in &self.loaders {
            if let Err(reason) = loader.accepts(&input) {
                attempts.push(StrategyFailure::new(loader.name(), format!("skipped: {reason}")));
                continue;
            }
            match loader.load(&input) {
                Ok(data) => {
                    let (z, y, x) = data.dim();
                    info!(file = label, strategy = loader.name(), shape = ?[z, y, x], "volume loaded");
                    return Ok(LoadedVolume {
                        data,
                        shape: [z, y, x],
                        detected: input.detected,
                        strategy: loader.name(),
                    });
                }
                Err(err) => attempts.push(StrategyFailure::new(loader.name(), err.to_string())),
            }
        }
        Err(AtlasregError::UnsupportedFormat {
            path: label.to_string(),
            attempts,
        })
    }
}

pub fn load_volume(
    path: &Path,
    expected_shape: Option<[usize; 3]>,
) -> Result<LoadedVolume, AtlasregError> {
    LoaderChain::default().load_file(path, expected_shape)
}

pub struct NrrdLoader;

impl VolumeLoader for NrrdLoader {
    fn name(&self) -> &'static str {
        "nrrd"
    }

    fn accepts(&self, input: &Input<'_>) -> Result<(), String> {
        match input.detected {
            DetectedFormat::Nrrd => Ok(()),
            _ => Err("no NRRD magic".to_string()),
        }
    }

    fn load(&self, input: &Input<'_>) -> Result<Array3<f32>, AtlasregError> {
        Ok(nrrd::parse_nrrd(input.bytes)?.data)
    }
}

/// Decodes a single-frame raster with the format the `image` crate
/// guesses from content.
pub struct ImageLoader;

impl VolumeLoader for ImageLoader {
    fn name(&self) -> &'static str {
        "image"
    }

    fn accepts(&self, input: &Input<'_>) -> Result<(), String> {
        match input.detected {
            DetectedFormat::Nrrd => Err("NRRD is not a raster image".to_string()),
            DetectedFormat::Tiff | DetectedFormat::Gif => {
                Err("multi-page formats are read page by page".to_string())
            }
            _ => Ok(()),
        }
    }

    fn load(&self, input: &Input<'_>) -> Result<Array3<f32>, AtlasregError> {
        let image = image::load_from_memory(input.bytes).map_err(image_error)?;
        single_slice(&image)
    }
}

/// Decoding forced to the sniffed format, reading every page of TIFF
/// stacks and every frame of GIFs.
pub struct HintedImageLoader;

impl VolumeLoader for HintedImageLoader {
    fn name(&self) -> &'static str {
        "image-hinted"
    }

    fn accepts(&self, input: &Input<'_>) -> Result<(), String> {
        input
            .detected
            .image_format()
            .map(|_| ())
            .ok_or_else(|| "no raster signature".to_string())
    }

    fn load(&self, input: &Input<'_>) -> Result<Array3<f32>, AtlasregError> {
        match input.detected {
            DetectedFormat::Tiff => tiff_stack(input.bytes),
            DetectedFormat::Gif => gif_stack(input.bytes),
            detected => {
                let format = detected.image_format().ok_or_else(|| {
                    AtlasregError::InvalidGeometry("no raster signature".to_string())
                })?;
                let image = image::load_from_memory_with_format(input.bytes, format)
                    .map_err(image_error)?;
                single_slice(&image)
            }
        }
    }
}

/// Reinterprets bytes as u8, u16-LE or f32-LE samples when the length
/// matches the expected shape exactly.
pub struct RawLoader;

impl RawLoader {
    fn sample_width(input: &Input<'_>) -> Result<([usize; 3], usize), String> {
        let shape = input
            .expected_shape
            .ok_or_else(|| "no expected shape to match".to_string())?;
        let count: usize = shape.iter().product();
        if count == 0 {
            return Err("expected shape is empty".to_string());
        }
        match input.bytes.len() / count {
            width @ (1 | 2 | 4) if input.bytes.len() % count == 0 => Ok((shape, width)),
            _ => Err(format!(
                "{} bytes do not match shape {shape:?}",
                input.bytes.len()
            )),
        }
    }
}

impl VolumeLoader for RawLoader {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn accepts(&self, input: &Input<'_>) -> Result<(), String> {
        Self::sample_width(input).map(|_| ())
    }

    fn load(&self, input: &Input<'_>) -> Result<Array3<f32>, AtlasregError> {
        let ([z, y, x], width) = Self::sample_width(input).map_err(AtlasregError::InvalidGeometry)?;
        let samples: Vec<f32> = match width {
            1 => input.bytes.iter().map(|value| f32::from(*value)).collect(),
            2 => input
                .bytes
                .chunks_exact(2)
                .map(|chunk| f32::from(u16::from_le_bytes([chunk[0], chunk[1]])))
                .collect(),
            _ => input
                .bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        };
        to_volume((z, y, x), samples)
    }
}

fn image_error(err: image::ImageError) -> AtlasregError {
    AtlasregError::InvalidGeometry(format!("image decode: {err}"))
}

fn to_volume(shape: (usize, usize, usize), samples: Vec<f32>) -> Result<Array3<f32>, AtlasregError> {
    Array3::from_shape_vec(shape, samples)
        .map_err(|err| AtlasregError::InvalidGeometry(format!("sample layout: {err}")))
}

/// Luminance of a 2D image as a 1×H×W volume, keeping the sample scale
/// of 8- and 16-bit sources.
fn single_slice(image: &DynamicImage) -> Result<Array3<f32>, AtlasregError> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let color = image.color();
    let bytes_per_channel = color.bytes_per_pixel() / color.channel_count().max(1);
    let values: Vec<f32> = match bytes_per_channel {
        1 => image.to_luma8().into_raw().into_iter().map(f32::from).collect(),
        2 => image.to_luma16().into_raw().into_iter().map(f32::from).collect(),
        _ => image.to_luma32f().into_raw(),
    };
    to_volume((1, height, width), values)
}

fn stack_slices(slices: Vec<Array3<f32>>) -> Result<Array3<f32>, AtlasregError> {
    let views: Vec<_> = slices.iter().map(|slice| slice.index_axis(Axis(0), 0)).collect();
    stack(Axis(0), &views)
        .map_err(|err| AtlasregError::InvalidGeometry(format!("slices differ in size: {err}")))
}

fn gif_stack(bytes: &[u8]) -> Result<Array3<f32>, AtlasregError> {
    let decoder = image::codecs::gif::GifDecoder::new(Cursor::new(bytes)).map_err(image_error)?;
    let frames = decoder.into_frames().collect_frames().map_err(image_error)?;
    if frames.is_empty() {
        return Err(AtlasregError::InvalidGeometry("gif has no frames".to_string()));
    }
    let slices = frames
        .into_iter()
        .map(|frame| single_slice(&DynamicImage::ImageRgba8(frame.into_buffer())))
        .collect::<Result<Vec<_>, _>>()?;
    stack_slices(slices)
}

fn tiff_stack(bytes: &[u8]) -> Result<Array3<f32>, AtlasregError> {
    let tiff_error = |err: tiff::TiffError| AtlasregError::InvalidGeometry(format!("tiff decode: {err}"));
    let mut decoder = TiffDecoder::new(Cursor::new(bytes)).map_err(tiff_error)?;
    let mut slices = Vec::new();
    loop {
        let (width, height) = decoder.dimensions().map_err(tiff_error)?;
        let (width, height) = (width as usize, height as usize);
        let samples = decoding_to_f32(decoder.read_image().map_err(tiff_error)?);
        let pixels = width * height;
        if pixels == 0 || samples.len() % pixels != 0 {
            return Err(AtlasregError::InvalidGeometry(format!(
                "tiff page has {} samples for {width}x{height} pixels",
                samples.len()
            )));
        }
        let channels = samples.len() / pixels;
        let luminance: Vec<f32> = samples
            .chunks_exact(channels)
            .map(|pixel| match pixel {
                [r, g, b, ..] => (r + g + b) / 3.0,
                [gray, ..] => *gray,
                [] => 0.0,
            })
            .collect();
        slices.push(to_volume((1, height, width), luminance)?);
        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(tiff_error)?;
    }
    stack_slices(slices)
}

fn decoding_to_f32(result: DecodingResult) -> Vec<f32> {
    match result {
        DecodingResult::U8(values) => values.into_iter().map(f32::from).collect(),
        DecodingResult::U16(values) => values.into_iter().map(f32::from).collect(),
        DecodingResult::U32(values) => values.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U64(values) => values.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(values) => values.into_iter().map(f32::from).collect(),
        DecodingResult::I16(values) => values.into_iter().map(f32::from).collect(),
        DecodingResult::I32(values) => values.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I64(values) => values.into_iter().map(|v| v as f32).collect(),
        DecodingResult::F32(values) => values,
        DecodingResult::F64(values) => values.into_iter().map(|v| v as f32).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nrrd_magic_may_follow_leading_bytes() {
        assert_eq!(detect_format(b"\n\nNRRD0004\n"), DetectedFormat::Nrrd);
        assert_eq!(detect_format(b"0123456789NRRD"), DetectedFormat::Unknown);
    }

    #[test]
    fn raw_accepts_only_matching_lengths() {
        let bytes = vec![0u8; 2 * 3 * 4 * 2];
        let input = Input {
            bytes: &bytes,
            detected: DetectedFormat::Unknown,
            expected_shape: Some([2, 3, 4]),
        };
        assert!(RawLoader.accepts(&input).is_ok());
        let short = Input {
            bytes: &bytes[..5],
            ..input
        };
        assert!(RawLoader.accepts(&short).is_err());
    }

    #[test]
    fn sample_count_must_fill_the_shape() {
        assert!(matches!(
            to_volume((1, 2, 2), vec![0.0; 3]),
            Err(AtlasregError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn sixteen_bit_slice_keeps_its_scale() {
        let pixels = vec![0u16, 1000, 2000, 3000, 4000, 65535];
        let image = image::ImageBuffer::<image::Luma<u16>, _>::from_raw(3, 2, pixels).unwrap();
        let volume = single_slice(&DynamicImage::ImageLuma16(image)).unwrap();
        assert_eq!(volume.dim(), (1, 2, 3));
        assert_eq!(volume[[0, 0, 1]], 1000.0);
        assert_eq!(volume[[0, 1, 2]], 65535.0);
    }
}
