//! Reader and writer for NRRD volumes with attached headers.
//!
//! Supported: scalar sample types from 8 to 64 bits, 2 or 3 dimensions,
//! `raw`, `gzip` and `ascii` encodings in either byte order. Samples are
//! converted to `f32` and laid out (z, y, x), i.e. NRRD's fastest axis last.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ndarray::Array3;

use crate::error::AtlasregError;

pub const NRRD_MAGIC: &[u8] = b"NRRD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl SampleType {
    fn parse(value: &str) -> Option<Self> {
        let sample = match value.trim() {
            "signed char" | "int8" | "int8_t" => SampleType::I8,
            "uchar" | "unsigned char" | "uint8" | "uint8_t" => SampleType::U8,
            "short" | "short int" | "signed short" | "signed short int" | "int16" | "int16_t" => {
                SampleType::I16
            }
            "ushort" | "unsigned short" | "unsigned short int" | "uint16" | "uint16_t" => {
                SampleType::U16
            }
            "int" | "signed int" | "int32" | "int32_t" => SampleType::I32,
            "uint" | "unsigned int" | "uint32" | "uint32_t" => SampleType::U32,
            "longlong" | "long long" | "long long int" | "signed long long"
            | "signed long long int" | "int64" | "int64_t" => SampleType::I64,
            "ulonglong" | "unsigned long long" | "unsigned long long int" | "uint64"
            | "uint64_t" => SampleType::U64,
            "float" => SampleType::F32,
            "double" => SampleType::F64,
            _ => return None,
        };
        Some(sample)
    }

    pub fn width(&self) -> usize {
        match self {
            SampleType::I8 | SampleType::U8 => 1,
            SampleType::I16 | SampleType::U16 => 2,
            SampleType::I32 | SampleType::U32 | SampleType::F32 => 4,
            SampleType::I64 | SampleType::U64 | SampleType::F64 => 8,
        }
    }

    fn decode(&self, chunk: &[u8], big_endian: bool) -> f32 {
        macro_rules! read {
            ($ty:ty) => {{
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(chunk);
                if big_endian {
                    <$ty>::from_be_bytes(buf) as f32
                } else {
                    <$ty>::from_le_bytes(buf) as f32
                }
            }};
        }
        match self {
            SampleType::I8 => chunk[0] as i8 as f32,
            SampleType::U8 => chunk[0] as f32,
            SampleType::I16 => read!(i16),
            SampleType::U16 => read!(u16),
            SampleType::I32 => read!(i32),
            SampleType::U32 => read!(u32),
            SampleType::I64 => read!(i64),
            SampleType::U64 => read!(u64),
            SampleType::F32 => read!(f32),
            SampleType::F64 => read!(f64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Raw,
    Gzip,
    Ascii,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NrrdHeader {
    pub sample_type: SampleType,
    /// Axis sizes, fastest axis first as written in the header.
    pub sizes: Vec<usize>,
    pub encoding: Encoding,
    pub big_endian: bool,
    /// Per-axis spacing in header axis order, when present.
    pub spacings: Option<Vec<f64>>,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NrrdVolume {
    pub header: NrrdHeader,
    pub data: Array3<f32>,
}

pub fn is_nrrd(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(10)];
    head.windows(NRRD_MAGIC.len()).any(|window| window == NRRD_MAGIC)
}

pub fn read_nrrd(path: &Path) -> Result<NrrdVolume, AtlasregError> {
    let bytes = std::fs::read(path)
        .map_err(|err| AtlasregError::Filesystem(format!("{}: {err}", path.display())))?;
    parse_nrrd(&bytes)
}

pub fn parse_nrrd(bytes: &[u8]) -> Result<NrrdVolume, AtlasregError> {
    let (header, body) = parse_header(bytes)?;
    let count = sample_count(&header.sizes)?;
    let samples = decode_samples(&header, body, count)?;
    let shape = zyx_shape(&header.sizes)?;
    let data = Array3::from_shape_vec(shape, samples)
        .map_err(|err| malformed(format!("sample count does not match sizes: {err}")))?;
    Ok(NrrdVolume { header, data })
}

fn sample_count(sizes: &[usize]) -> Result<usize, AtlasregError> {
    sizes
        .iter()
        .try_fold(1usize, |count, size| count.checked_mul(*size))
        .ok_or_else(|| malformed(format!("sizes overflow: {sizes:?}")))
}

fn malformed(reason: impl Into<String>) -> AtlasregError {
    AtlasregError::Nrrd(reason.into())
}

fn parse_header(bytes: &[u8]) -> Result<(NrrdHeader, &[u8]), AtlasregError> {
    let start = bytes[..bytes.len().min(10)]
        .windows(NRRD_MAGIC.len())
        .position(|window| window == NRRD_MAGIC)
        .ok_or_else(|| malformed("missing NRRD magic"))?;
    let bytes = &bytes[start..];
    let mut fields = BTreeMap::new();
    let mut offset = 0usize;
    let mut first = true;
    let body_start = loop {
        let Some(end) = bytes[offset..].iter().position(|byte| *byte == b'\n') else {
            return Err(malformed("header is not terminated by a blank line"));
        };
        let line = &bytes[offset..offset + end];
        let next = offset + end + 1;
        let line = std::str::from_utf8(line)
            .map_err(|_| malformed("header is not valid text"))?
            .trim_end_matches('\r');
        if first {
            first = false;
        } else if line.is_empty() {
            break next;
        } else if !line.starts_with('#') && !line.contains(":=") {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| malformed(format!("unreadable header line {line:?}")))?;
            fields.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
        offset = next;
        if offset >= bytes.len() {
            return Err(malformed("header is not terminated by a blank line"));
        }
    };

    if fields.contains_key("data file") || fields.contains_key("datafile") {
        return Err(malformed("detached data files are not supported"));
    }
    let field = |name: &str| required(&fields, name);
    let sample_type = SampleType::parse(field("type")?)
        .ok_or_else(|| malformed(format!("unsupported type {:?}", fields.get("type"))))?;
    let dimension: usize = field("dimension")?
        .parse()
        .map_err(|_| malformed("dimension is not a number"))?;
    if !(2..=3).contains(&dimension) {
        return Err(malformed(format!("dimension {dimension} is not 2 or 3")));
    }
    let sizes = field("sizes")?
        .split_whitespace()
        .map(|size| size.parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| malformed("sizes are not numbers"))?;
    if sizes.len() != dimension || sizes.contains(&0) {
        return Err(malformed(format!(
            "sizes {sizes:?} do not match dimension {dimension}"
        )));
    }
    let encoding = match field("encoding")?.to_ascii_lowercase().as_str() {
        "raw" => Encoding::Raw,
        "gzip" | "gz" => Encoding::Gzip,
        "ascii" | "text" | "txt" => Encoding::Ascii,
        other => return Err(malformed(format!("unsupported encoding {other}"))),
    };
    let big_endian = match fields.get("endian").map(|value| value.to_ascii_lowercase()) {
        Some(value) if value == "big" => true,
        Some(value) if value == "little" => false,
        Some(value) => return Err(malformed(format!("unknown endian {value}"))),
        None => false,
    };
    let spacings = fields
        .get("spacings")
        .and_then(|value| parse_spacings(value))
        .or_else(|| {
            fields
                .get("space directions")
                .and_then(|value| parse_space_directions(value))
        })
        .filter(|values| values.len() == dimension);

    Ok((
        NrrdHeader {
            sample_type,
            sizes,
            encoding,
            big_endian,
            spacings,
            fields,
        },
        &bytes[body_start..],
    ))
}

fn required<'a>(fields: &'a BTreeMap<String, String>, name: &str) -> Result<&'a str, AtlasregError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| malformed(format!("missing field {name}")))
}

fn parse_spacings(value: &str) -> Option<Vec<f64>> {
    value
        .split_whitespace()
        .map(|part| part.parse::<f64>().ok())
        .collect()
}

/// `(25,0,0) (0,25,0) (0,0,25)` → vector lengths.
fn parse_space_directions(value: &str) -> Option<Vec<f64>> {
    value
        .split_whitespace()
        .filter(|part| *part != "none")
        .map(|vector| {
            let components = vector
                .trim_matches(|ch: char| ch == '(' || ch == ')')
                .split(',')
                .map(|component| component.trim().parse::<f64>().ok())
                .collect::<Option<Vec<_>>>()?;
            Some(components.iter().map(|c| c * c).sum::<f64>().sqrt())
        })
        .collect()
}

fn zyx_shape(sizes: &[usize]) -> Result<(usize, usize, usize), AtlasregError> {
    match sizes {
        [x, y] => Ok((1, *y, *x)),
        [x, y, z] => Ok((*z, *y, *x)),
        _ => Err(malformed(format!("unsupported sizes {sizes:?}"))),
    }
}

fn decode_samples(
    header: &NrrdHeader,
    body: &[u8],
    count: usize,
) -> Result<Vec<f32>, AtlasregError> {
    match header.encoding {
        Encoding::Ascii => {
            let text = std::str::from_utf8(body).map_err(|_| malformed("ascii data is not text"))?;
            let samples = text
                .split_whitespace()
                .take(count)
                .map(|value| value.parse::<f64>().map(|parsed| parsed as f32))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| malformed(format!("ascii sample: {err}")))?;
            if samples.len() != count {
                return Err(malformed(format!(
                    "expected {count} samples, found {}",
                    samples.len()
                )));
            }
            Ok(samples)
        }
        Encoding::Raw => binary_samples(header, body, count),
        Encoding::Gzip => {
            let mut decoded = Vec::new();
            GzDecoder::new(body)
                .read_to_end(&mut decoded)
                .map_err(|err| malformed(format!("gzip data: {err}")))?;
            binary_samples(header, &decoded, count)
        }
    }
}

fn binary_samples(header: &NrrdHeader, body: &[u8], count: usize) -> Result<Vec<f32>, AtlasregError> {
    let width = header.sample_type.width();
    let needed = count
        .checked_mul(width)
        .ok_or_else(|| malformed(format!("{count} samples of {width} bytes overflow")))?;
    if body.len() < needed {
        return Err(malformed(format!(
            "expected {needed} data bytes, found {}",
            body.len()
        )));
    }
    // Data sits at the end of the file; anything before it is padding.
    let data = &body[body.len() - needed..];
    Ok(data
        .chunks_exact(width)
        .map(|chunk| header.sample_type.decode(chunk, header.big_endian))
        .collect())
}

/// Writes a gzip-encoded little-endian float volume.
pub fn write_nrrd(
    path: &Path,
    data: &Array3<f32>,
    spacing: Option<[f64; 3]>,
) -> Result<(), AtlasregError> {
    let io = |err: std::io::Error| AtlasregError::Filesystem(format!("{}: {err}", path.display()));
    let (depth, height, width) = data.dim();
    let file = File::create(path).map_err(io)?;
    let mut writer = BufWriter::new(file);
    let mut header = format!(
        "NRRD0004\n# written by atlasreg\ntype: float\ndimension: 3\nsizes: {width} {height} {depth}\nencoding: gzip\nendian: little\n"
    );
    if let Some([x, y, z]) = spacing {
        header.push_str(&format!("spacings: {x} {y} {z}\n"));
    }
    header.push('\n');
    writer.write_all(header.as_bytes()).map_err(io)?;
    let mut encoder = GzEncoder::new(writer, Compression::default());
    for value in data.iter() {
        encoder.write_all(&value.to_le_bytes()).map_err(io)?;
    }
    encoder.finish().map_err(io)?.flush().map_err(io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn space_directions_give_spacing() {
        let spacing = parse_space_directions("(25,0,0) (0,25,0) (0,0,10)").unwrap();
        assert_eq!(spacing, vec![25.0, 25.0, 10.0]);
    }

    #[test]
    fn big_endian_shorts_decode() {
        let mut bytes = b"NRRD0004\ntype: short\ndimension: 2\nsizes: 2 1\nencoding: raw\nendian: big\n\n".to_vec();
        bytes.extend_from_slice(&(-2i16).to_be_bytes());
        bytes.extend_from_slice(&300i16.to_be_bytes());
        let volume = parse_nrrd(&bytes).unwrap();
        assert_eq!(volume.data.dim(), (1, 1, 2));
        assert_eq!(volume.data[[0, 0, 0]], -2.0);
        assert_eq!(volume.data[[0, 0, 1]], 300.0);
    }

    #[test]
    fn detached_data_is_rejected() {
        let bytes = b"NRRD0004\ntype: uchar\ndimension: 2\nsizes: 1 1\nencoding: raw\ndata file: x.raw\n\n";
        assert!(parse_nrrd(bytes).is_err());
    }
}
