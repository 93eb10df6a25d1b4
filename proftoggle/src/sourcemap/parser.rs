//! Source map v3 parsing and position lookup.

use std::collections::HashMap;

use serde::Deserialize;

use crate::domain::SourcemapError;

pub type Result<T> = std::result::Result<T, SourcemapError>;

/// A zero-based line/column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Which neighbouring mapping a lookup settles on when the column has no
/// exact segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchBias {
    /// Closest segment starting at or before the column.
    GreatestLowerBound,
    /// Closest segment starting at or after the column.
    LeastUpperBound,
}

/// Original location of a generated position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalPosition {
    pub source_index: usize,
    pub position: Position,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    generated: Position,
    original: Option<(usize, Position)>,
    name_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSourceMap {
    version: u32,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    source_root: Option<String>,
    #[serde(default)]
    sources: Vec<Option<String>>,
    #[serde(default)]
    sources_content: Option<Vec<Option<String>>>,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    mappings: String,
}

/// Parsed source map with a per-line index of generated columns.
#[derive(Debug, Clone)]
pub struct SourceMap {
    file: Option<String>,
    sources: Vec<String>,
    sources_content: HashMap<usize, String>,
    names: Vec<String>,
    mappings: Vec<Mapping>,
    /// generated line -> (column, mapping index), sorted by column
    generated_index: HashMap<u32, Vec<(u32, usize)>>,
}

impl SourceMap {
    /// Parse a source map from its JSON text.
    ///
    /// # Errors
    /// Fails on malformed JSON, a version other than 3, or bad VLQ data.
    pub fn parse(json: &str) -> Result<Self> {
        let raw: RawSourceMap =
            serde_json::from_str(json).map_err(|e| SourcemapError::InvalidJson(e.to_string()))?;
        if raw.version != 3 {
            return Err(SourcemapError::UnsupportedVersion(raw.version));
        }
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSourceMap) -> Result<Self> {
        let mappings = parse_vlq_mappings(&raw.mappings)?;

        let root = raw.source_root.unwrap_or_default();
        let sources = raw
            .sources
            .into_iter()
            .map(|s| {
                let s = s.unwrap_or_default();
                if root.is_empty() || s.contains("://") || s.starts_with('/') {
                    s
                } else if root.ends_with('/') {
                    format!("{root}{s}")
                } else {
                    format!("{root}/{s}")
                }
            })
            .collect();

        let sources_content = raw
            .sources_content
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .filter_map(|(idx, content)| content.map(|c| (idx, c)))
            .collect();

        let mut generated_index: HashMap<u32, Vec<(u32, usize)>> = HashMap::new();
        for (idx, mapping) in mappings.iter().enumerate() {
            generated_index
                .entry(mapping.generated.line)
                .or_default()
                .push((mapping.generated.column, idx));
        }
        for columns in generated_index.values_mut() {
            columns.sort_by_key(|(col, _)| *col);
        }

        Ok(Self {
            file: raw.file,
            sources,
            sources_content,
            names: raw.names,
            mappings,
            generated_index,
        })
    }

    /// The `file` field: name of the generated file this map describes.
    #[must_use]
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    /// Source paths with `sourceRoot` already applied.
    #[must_use]
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Embedded `sourcesContent` for a source, if the map carries it.
    #[must_use]
    pub fn source_content(&self, source_index: usize) -> Option<&str> {
        self.sources_content.get(&source_index).map(String::as_str)
    }

    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    /// Look up the original position of a generated position.
    ///
    /// Returns `None` when the line has no segment on the requested side of
    /// the column, or the chosen segment carries no original position.
    #[must_use]
    pub fn original_position_for(
        &self,
        generated: Position,
        bias: SearchBias,
    ) -> Option<OriginalPosition> {
        let columns = self.generated_index.get(&generated.line)?;
        let mapping_idx = match bias {
            SearchBias::GreatestLowerBound => greatest_lower_bound(columns, generated.column)?,
            SearchBias::LeastUpperBound => least_upper_bound(columns, generated.column)?,
        };

        let mapping = &self.mappings[mapping_idx];
        let (source_index, position) = mapping.original?;
        if source_index >= self.sources.len() {
            return None;
        }
        let name = mapping.name_index.and_then(|idx| self.names.get(idx)).cloned();

        Some(OriginalPosition { source_index, position, name })
    }
}

/// Index of the segment with the largest column `<= target`.
fn greatest_lower_bound(columns: &[(u32, usize)], target: u32) -> Option<usize> {
    let upper = columns.partition_point(|(col, _)| *col <= target);
    upper.checked_sub(1).map(|i| columns[i].1)
}

/// Index of the segment with the smallest column `>= target`.
fn least_upper_bound(columns: &[(u32, usize)], target: u32) -> Option<usize> {
    let lower = columns.partition_point(|(col, _)| *col < target);
    columns.get(lower).map(|(_, idx)| *idx)
}

fn parse_vlq_mappings(mappings: &str) -> Result<Vec<Mapping>> {
    let mut result = Vec::new();

    let mut prev_source: i64 = 0;
    let mut prev_orig_line: i64 = 0;
    let mut prev_orig_col: i64 = 0;
    let mut prev_name: i64 = 0;

    for (gen_line, line_mappings) in mappings.split(';').enumerate() {
        let line = u32::try_from(gen_line)
            .map_err(|_| SourcemapError::InvalidVlq(format!("generated line {gen_line} out of range")))?;
        // Generated column resets at the start of each line
        let mut prev_gen_col: i64 = 0;

        for segment in line_mappings.split(',') {
            if segment.is_empty() {
                continue;
            }

            let values = decode_vlq(segment)?;
            if values.is_empty() {
                continue;
            }

            prev_gen_col = accumulate(prev_gen_col, values[0], "generated column", line)?;
            let mut mapping = Mapping {
                generated: Position::new(line, to_u32(prev_gen_col, "generated column", line)?),
                original: None,
                name_index: None,
            };

            if values.len() >= 4 {
                prev_source = accumulate(prev_source, values[1], "source index", line)?;
                prev_orig_line = accumulate(prev_orig_line, values[2], "original line", line)?;
                prev_orig_col = accumulate(prev_orig_col, values[3], "original column", line)?;
                mapping.original = Some((
                    to_usize(prev_source, "source index", line)?,
                    Position::new(
                        to_u32(prev_orig_line, "original line", line)?,
                        to_u32(prev_orig_col, "original column", line)?,
                    ),
                ));

                if values.len() >= 5 {
                    prev_name = accumulate(prev_name, values[4], "name index", line)?;
                    mapping.name_index = Some(to_usize(prev_name, "name index", line)?);
                }
            }

            result.push(mapping);
        }
    }

    Ok(result)
}

/// Apply a VLQ delta to a running total.
fn accumulate(total: i64, delta: i64, what: &str, line: u32) -> Result<i64> {
    total
        .checked_add(delta)
        .ok_or_else(|| SourcemapError::InvalidVlq(format!("{what} overflows on line {line}")))
}

fn to_u32(value: i64, what: &str, line: u32) -> Result<u32> {
    u32::try_from(value).map_err(|_| SourcemapError::InvalidVlq(format!("{what} {value} out of range on line {line}")))
}

fn to_usize(value: i64, what: &str, line: u32) -> Result<usize> {
    usize::try_from(value).map_err(|_| SourcemapError::InvalidVlq(format!("{what} {value} out of range on line {line}")))
}

/// Decode one base64 VLQ segment into signed integers.
fn decode_vlq(segment: &str) -> Result<Vec<i64>> {
    const VLQ_CONTINUATION_BIT: u8 = 32;
    const VLQ_VALUE_MASK: u8 = 31;

    let mut result = Vec::new();
    let mut value: i64 = 0;
    let mut shift = 0;

    for c in segment.bytes() {
        let digit = base64_value(c)
            .ok_or_else(|| SourcemapError::InvalidVlq(format!("Invalid VLQ character: {}", c as char)))?;

        if shift > 60 {
            return Err(SourcemapError::InvalidVlq("VLQ value overflows 64 bits".to_string()));
        }
        value |= i64::from(digit & VLQ_VALUE_MASK) << shift;
        shift += 5;

        if digit & VLQ_CONTINUATION_BIT == 0 {
            // Sign lives in the lowest bit
            let signed = if value & 1 == 1 { -(value >> 1) } else { value >> 1 };
            result.push(signed);
            value = 0;
            shift = 0;
        }
    }

    if shift > 0 {
        return Err(SourcemapError::InvalidVlq("Incomplete VLQ sequence".to_string()));
    }

    Ok(result)
}

fn base64_value(c: u8) -> Option<u8> {
    match c {
        b'A'..=b'Z' => Some(c - b'A'),
        b'a'..=b'z' => Some(c - b'a' + 26),
        b'0'..=b'9' => Some(c - b'0' + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_vlq_simple() {
        assert_eq!(decode_vlq("A").unwrap(), vec![0]);
        assert_eq!(decode_vlq("C").unwrap(), vec![1]);
        assert_eq!(decode_vlq("D").unwrap(), vec![-1]);
        assert_eq!(decode_vlq("gB").unwrap(), vec![16]);
        assert_eq!(decode_vlq("AACA").unwrap(), vec![0, 0, 1, 0]);
    }

    #[test]
    fn test_decode_vlq_rejects_garbage() {
        assert!(decode_vlq("A!").is_err());
        // continuation bit set on the last digit
        assert!(decode_vlq("g").is_err());
    }

    #[test]
    fn test_parse_and_lookup() {
        // line 0: col 0 -> src 0 (0,0); col 10 -> src 0 (1,4) named "run"
        let json = r#"{
            "version": 3,
            "file": "out.js",
            "sources": ["in.ts"],
            "names": ["run"],
            "mappings": "AAAA,UACIA"
        }"#;
        let map = SourceMap::parse(json).unwrap();
        assert_eq!(map.file(), Some("out.js"));
        assert_eq!(map.mapping_count(), 2);

        let hit = map
            .original_position_for(Position::new(0, 12), SearchBias::GreatestLowerBound)
            .unwrap();
        assert_eq!(hit.position, Position::new(1, 4));
        assert_eq!(hit.name.as_deref(), Some("run"));

        let first = map
            .original_position_for(Position::new(0, 3), SearchBias::GreatestLowerBound)
            .unwrap();
        assert_eq!(first.position, Position::new(0, 0));
        assert!(first.name.is_none());
    }

    #[test]
    fn test_bias_selects_side() {
        // only one segment at column 8 on line 0
        let json = r#"{"version":3,"sources":["a.ts"],"names":[],"mappings":"QAAA"}"#;
        let map = SourceMap::parse(json).unwrap();
        assert!(map
            .original_position_for(Position::new(0, 2), SearchBias::GreatestLowerBound)
            .is_none());
        assert!(map
            .original_position_for(Position::new(0, 2), SearchBias::LeastUpperBound)
            .is_some());
        assert!(map
            .original_position_for(Position::new(0, 9), SearchBias::LeastUpperBound)
            .is_none());
    }

    #[test]
    fn test_out_of_range_positions_are_errors() {
        // "D" moves the generated column to -1
        let negative = r#"{"version":3,"sources":["a.ts"],"names":[],"mappings":"D"}"#;
        assert!(matches!(SourceMap::parse(negative), Err(SourcemapError::InvalidVlq(_))));

        // 2^33 does not fit a u32 column
        let huge = r#"{"version":3,"sources":["a.ts"],"names":[],"mappings":"ggggggQ"}"#;
        assert!(matches!(SourceMap::parse(huge), Err(SourcemapError::InvalidVlq(_))));

        // Source index deltas of 2^62 - 1 overflow the running total on the third segment
        let big = format!("A+{}HAA", "/".repeat(11));
        let overflow = format!(r#"{{"version":3,"sources":["a.ts"],"names":[],"mappings":"{big},{big},{big}"}}"#);
        assert!(matches!(SourceMap::parse(&overflow), Err(SourcemapError::InvalidVlq(_))));
    }

    #[test]
    fn test_source_root_is_applied() {
        let json = r#"{"version":3,"sourceRoot":"src","sources":["a.ts"],"mappings":""}"#;
        let map = SourceMap::parse(json).unwrap();
        assert_eq!(map.sources(), &["src/a.ts".to_string()]);
    }

    #[test]
    fn test_rejects_other_versions() {
        let json = r#"{"version":2,"sources":[],"mappings":""}"#;
        assert!(matches!(SourceMap::parse(json), Err(SourcemapError::UnsupportedVersion(2))));
    }
}
