use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::error::AtlasregError;
use crate::formats::SkippedLine;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PointsParse {
    /// Raw (x, y, z) coordinates in physical units.
    pub points: Vec<[f64; 3]>,
    pub skipped: Vec<SkippedLine>,
}

pub fn read_points(path: &Path) -> Result<PointsParse, AtlasregError> {
    let file = File::open(path)
        .map_err(|err| AtlasregError::Filesystem(format!("{}: {err}", path.display())))?;
    let parsed = parse_points(BufReader::new(file));
    if parsed.points.is_empty() {
        return Err(AtlasregError::EmptyDataset(path.display().to_string()));
    }
    Ok(parsed)
}

/// Reads comma-separated rows and keeps the first three numeric columns.
/// Rows that do not parse, a header included, are skipped.
pub fn parse_points<R: Read>(input: R) -> PointsParse {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(input);

    let mut parsed = PointsParse::default();
    for (index, record) in reader.records().enumerate() {
        let line = index + 1;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                parsed.skipped.push(SkippedLine {
                    line,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        match parse_row(&record) {
            Ok(point) => parsed.points.push(point),
            Err(reason) => parsed.skipped.push(SkippedLine {
                line: record.position().map(|pos| pos.line() as usize).unwrap_or(line),
                reason,
            }),
        }
    }
    if !parsed.skipped.is_empty() {
        debug!(skipped = parsed.skipped.len(), "point rows skipped");
    }
    parsed
}

fn parse_row(record: &csv::StringRecord) -> Result<[f64; 3], String> {
    if record.len() < 3 {
        return Err(format!("expected 3 columns, found {}", record.len()));
    }
    let mut point = [0.0; 3];
    for (axis, slot) in point.iter_mut().enumerate() {
        let field = &record[axis];
        *slot = field
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| format!("column {} is not a number: {field:?}", axis + 1))?;
    }
    Ok(point)
}
