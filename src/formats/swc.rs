use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::domain::NeuronMorphology;
use crate::error::AtlasregError;
use crate::formats::SkippedLine;

const ROOT_PARENT: i64 = -1;

#[derive(Debug, Clone, Copy)]
struct SwcNode {
    position: [f64; 3],
    radius: f64,
    parent: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SwcParse {
    pub morphology: NeuronMorphology,
    pub skipped: Vec<SkippedLine>,
    /// Parent references to ids not present in the file.
    pub dropped_parents: usize,
}

pub fn read_swc(path: &Path) -> Result<SwcParse, AtlasregError> {
    let content = fs::read_to_string(path)
        .map_err(|err| AtlasregError::Filesystem(format!("{}: {err}", path.display())))?;
    let parsed = parse_swc(&content);
    if parsed.morphology.is_empty() {
        return Err(AtlasregError::EmptyDataset(path.display().to_string()));
    }
    Ok(parsed)
}

/// Parses SWC text (`id type x y z radius parent`). Malformed lines are
/// recorded and skipped. Rows follow sorted node id order.
pub fn parse_swc(content: &str) -> SwcParse {
    let mut nodes = BTreeMap::new();
    let mut skipped = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_node(line) {
            Ok((id, node)) => {
                nodes.insert(id, node);
            }
            Err(reason) => {
                debug!(line = index + 1, reason = %reason, "swc line skipped");
                skipped.push(SkippedLine {
                    line: index + 1,
                    reason,
                });
            }
        }
    }

    let row_of: HashMap<i64, usize> = nodes
        .keys()
        .enumerate()
        .map(|(row, id)| (*id, row))
        .collect();
    let mut morphology = NeuronMorphology::default();
    let mut dropped_parents = 0;
    for (row, node) in nodes.values().enumerate() {
        morphology.points.push(node.position);
        morphology.radii.push(node.radius);
        if node.parent == ROOT_PARENT {
            continue;
        }
        match row_of.get(&node.parent) {
            Some(parent_row) => morphology.connections.push((*parent_row, row)),
            None => dropped_parents += 1,
        }
    }
    SwcParse {
        morphology,
        skipped,
        dropped_parents,
    }
}

fn parse_node(line: &str) -> Result<(i64, SwcNode), String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 7 {
        return Err(format!("expected 7 fields, found {}", fields.len()));
    }
    let id = parse_integral(fields[0], "id")?;
    let mut values = [0.0f64; 4];
    for (slot, (value, name)) in values
        .iter_mut()
        .zip(fields[2..6].iter().zip(["x", "y", "z", "radius"]))
    {
        *slot = value
            .parse::<f64>()
            .ok()
            .filter(|parsed| parsed.is_finite())
            .ok_or_else(|| format!("invalid {name} {value:?}"))?;
    }
    let parent = parse_integral(fields[6], "parent")?;
    Ok((
        id,
        SwcNode {
            position: [values[0], values[1], values[2]],
            radius: values[3],
            parent,
        },
    ))
}

/// Accepts `12` and `12.0`; rejects `12.5`.
fn parse_integral(value: &str, name: &str) -> Result<i64, String> {
    if let Ok(parsed) = value.parse::<i64>() {
        return Ok(parsed);
    }
    match value.parse::<f64>() {
        Ok(parsed) if parsed.is_finite() && parsed.fract() == 0.0 => Ok(parsed as i64),
        _ => Err(format!("invalid {name} {value:?}")),
    }
}
