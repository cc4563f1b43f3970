//! Class-name tables.
//!
//! Labels come from a plain text file (one name per line), from JSON (`{"names": {...}}`,
//! a bare index map, or an array), or from the `names` metadata string embedded in
//! exported ONNX detectors, which uses Python dict syntax (`{0: 'person', 1: 'bicycle'}`).

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result};
use serde_json::Value;

/// Name reported for class ids without a label.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Ordered class names indexed by class id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet {
    names: Vec<String>,
}

impl LabelSet {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Load labels from disk. `.json` files are parsed as JSON, anything else as text.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read labels from {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let labels = if is_json {
            Self::from_json_str(&contents)
        } else {
            Ok(Self::from_text(&contents))
        };
        labels.with_context(|| format!("invalid labels file {}", path.display()))
    }

    /// One label per line; blank lines are skipped and surrounding whitespace trimmed.
    pub fn from_text(contents: &str) -> Self {
        let names = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();
        Self { names }
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(contents).context("labels are not valid JSON")?;
        Self::from_json_value(&value)
    }

    fn from_json_value(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) if map.contains_key("names") => {
                Self::from_json_value(&map["names"])
            }
            Value::Object(map) => {
                let mut indexed = BTreeMap::new();
                for (key, name) in map {
                    let id: usize = key
                        .trim()
                        .parse()
                        .with_context(|| format!("label key '{key}' is not a class index"))?;
                    let name = name
                        .as_str()
                        .with_context(|| format!("label for class {id} is not a string"))?;
                    indexed.insert(id, name.to_owned());
                }
                Ok(Self::from_indexed(indexed))
            }
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(id, name)| {
                    name.as_str()
                        .map(str::to_owned)
                        .with_context(|| format!("label for class {id} is not a string"))
                })
                .collect::<Result<Vec<_>>>()
                .map(Self::new),
            other => anyhow::bail!("unsupported labels JSON: expected object or array, got {other}"),
        }
    }

    /// Parse the `names` metadata string stored in exported detector models.
    ///
    /// JSON is tried first; otherwise the value is read as a Python dict literal with
    /// integer keys and single- or double-quoted names.
    pub fn from_metadata(value: &str) -> Result<Self> {
        if let Ok(labels) = Self::from_json_str(value) {
            return Ok(labels);
        }
        parse_python_dict(value).map(Self::from_indexed)
    }

    fn from_indexed(indexed: BTreeMap<usize, String>) -> Self {
        let len = indexed.keys().next_back().map_or(0, |last| last + 1);
        let mut names = vec![UNKNOWN_LABEL.to_owned(); len];
        for (id, name) in indexed {
            names[id] = name;
        }
        Self { names }
    }

    /// Name for `class_id`, or [`UNKNOWN_LABEL`] when out of range.
    pub fn name(&self, class_id: usize) -> &str {
        self.names.get(class_id).map_or(UNKNOWN_LABEL, String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

fn parse_python_dict(value: &str) -> Result<BTreeMap<usize, String>> {
    let body = value
        .trim()
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .context("label metadata must be a dict literal")?;

    let mut indexed = BTreeMap::new();
    let mut rest = body.trim_start();
    while !rest.is_empty() {
        let (key, after_key) = rest
            .split_once(':')
            .with_context(|| format!("missing ':' in label metadata near '{rest}'"))?;
        let id: usize = key
            .trim()
            .parse()
            .with_context(|| format!("label key '{}' is not a class index", key.trim()))?;

        let after_key = after_key.trim_start();
        let quote = after_key
            .chars()
            .next()
            .filter(|c| *c == '\'' || *c == '"')
            .with_context(|| format!("label for class {id} is not quoted"))?;
        let quoted = &after_key[1..];
        let end = quoted
            .find(quote)
            .with_context(|| format!("unterminated label for class {id}"))?;
        indexed.insert(id, quoted[..end].to_owned());

        rest = quoted[end + 1..].trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    }
    Ok(indexed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_skips_blank_lines() {
        let labels = LabelSet::from_text("person\n\n  bicycle \ncar\n");
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.name(1), "bicycle");
        assert_eq!(labels.name(3), UNKNOWN_LABEL);
    }

    #[test]
    fn json_names_map_orders_by_index() {
        let labels =
            LabelSet::from_json_str(r#"{"names": {"1": "bicycle", "0": "person", "10": "x"}}"#)
                .unwrap();
        assert_eq!(labels.name(0), "person");
        assert_eq!(labels.name(1), "bicycle");
        assert_eq!(labels.name(5), UNKNOWN_LABEL);
        assert_eq!(labels.name(10), "x");
        assert_eq!(labels.len(), 11);
    }

    #[test]
    fn json_array_is_accepted() {
        let labels = LabelSet::from_json_str(r#"["cat", "dog"]"#).unwrap();
        assert_eq!(labels.iter().collect::<Vec<_>>(), vec!["cat", "dog"]);
        assert!(LabelSet::from_json_str(r#"{"names": {"a": "cat"}}"#).is_err());
        assert!(LabelSet::from_json_str("42").is_err());
    }

    #[test]
    fn python_dict_metadata_is_parsed() {
        let labels =
            LabelSet::from_metadata("{0: 'person', 1: \"traffic light\", 2: 'hair drier'}")
                .unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.name(1), "traffic light");
        assert_eq!(labels.name(2), "hair drier");
        assert!(LabelSet::from_metadata("{0: person}").is_err());
        assert!(LabelSet::from_metadata("[0: 'a']").is_err());
    }

    #[test]
    fn reads_label_files_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("coco.txt");
        fs::write(&txt, "person\nbicycle\n").unwrap();
        assert_eq!(LabelSet::from_path(&txt).unwrap().name(0), "person");

        let json = dir.path().join("meta.JSON");
        fs::write(&json, r#"{"names": ["a", "b"]}"#).unwrap();
        assert_eq!(LabelSet::from_path(&json).unwrap().name(1), "b");

        assert!(LabelSet::from_path(dir.path().join("missing.txt")).is_err());
    }
}
