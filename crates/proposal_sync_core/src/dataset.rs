use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// One proposal as stored in the dataset file. Field order is the on-disk key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub id: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub champions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub example: Option<String>,
    #[serde(default)]
    pub has_specification: bool,
    #[serde(default)]
    pub presented: Vec<Presentation>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<String>>,
}

/// A meeting where the proposal was presented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presentation {
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// When a stored field counts as a cache hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Any stored record for the id wins, even if the field is missing or null.
    RecordPresent,
    /// The stored record must carry a non-null value for the field.
    ValuePresent,
}

/// The dataset written by the previous run, kept as raw mappings so that a
/// missing key and an explicit `null` stay distinguishable.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    source: Option<String>,
    entries: Vec<Mapping>,
    by_id: HashMap<String, usize>,
}

impl Dataset {
    /// Load the dataset at `path`. A missing or empty file is an empty dataset.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse dataset {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let root: Value = if content.trim().is_empty() {
            Value::Null
        } else {
            serde_yaml::from_str(content)?
        };
        let items = match root {
            Value::Null => Vec::new(),
            Value::Sequence(items) => items,
            _ => bail!("dataset must be a YAML sequence of proposal records"),
        };

        let mut entries = Vec::with_capacity(items.len());
        let mut by_id = HashMap::new();
        for (index, item) in items.into_iter().enumerate() {
            let Value::Mapping(mapping) = item else {
                bail!("dataset entry #{index} is not a mapping");
            };
            let Some(id) = mapping.get("id").and_then(Value::as_str) else {
                bail!("dataset entry #{index} has no string `id`");
            };
            by_id.entry(id.to_string()).or_insert(index);
            entries.push(mapping);
        }

        Ok(Self {
            source: Some(content.to_string()),
            entries,
            by_id,
        })
    }

    /// File content as it was loaded, `None` if there was no file.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    fn record(&self, id: &str) -> Option<&Mapping> {
        self.by_id.get(id).map(|index| &self.entries[*index])
    }

    /// Stored value of `field` for `id`: outer `None` when there is no
    /// record, inner `None` when the key is missing or null.
    pub fn stored<T: DeserializeOwned>(&self, id: &str, field: &str) -> Result<Option<Option<T>>> {
        let Some(record) = self.record(id) else {
            return Ok(None);
        };
        match record.get(field) {
            None | Some(Value::Null) => Ok(Some(None)),
            Some(value) => serde_yaml::from_value(value.clone())
                .map(|parsed| Some(Some(parsed)))
                .with_context(|| format!("dataset field `{field}` of `{id}` has an unexpected shape")),
        }
    }

    /// Stored value when `policy` counts it as a hit, otherwise `fallback()`.
    pub fn cached_field<T, F>(
        &self,
        id: &str,
        field: &str,
        policy: CachePolicy,
        fallback: F,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Result<Option<T>>,
    {
        match (self.stored::<T>(id, field)?, policy) {
            (Some(value), CachePolicy::RecordPresent) => Ok(value),
            (Some(Some(value)), CachePolicy::ValuePresent) => Ok(Some(value)),
            _ => fallback(),
        }
    }
}

/// Render records as the YAML document written to disk.
pub fn render_records(records: &[ProposalRecord]) -> Result<String> {
    serde_yaml::to_string(records).context("failed to serialize proposal records")
}

/// Replace the dataset at `path` with `records` in a single write.
pub fn write_records(path: &Path, records: &[ProposalRecord]) -> Result<String> {
    let rendered = render_records(records)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, &rendered).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::tempdir;

    const STORED: &str = r#"
- id: temporal
  authors: [Maggie Pint]
  champions: [Philipp Dunkel]
  description: Date and time API
  example: "Temporal.Now.instant()"
  has_specification: true
  presented:
  - date: March 2021
    url: https://example.com/notes
  title: Temporal
- id: decorators
  authors: []
  champions: []
  example: null
  has_specification: false
  presented: []
  title: Decorators
"#;

    fn record(id: &str) -> ProposalRecord {
        ProposalRecord {
            id: id.to_string(),
            authors: vec!["A".to_string(), "B".to_string()],
            champions: vec!["C".to_string()],
            description: None,
            example: None,
            has_specification: true,
            presented: vec![Presentation {
                date: "September 2020".to_string(),
                url: None,
            }],
            title: "<code>x</code>".to_string(),
            tests: None,
        }
    }

    #[test]
    fn load_missing_file_is_empty() {
        let temp = tempdir().expect("tempdir");
        let dataset = Dataset::load(&temp.path().join("missing.yml")).expect("load");
        assert!(dataset.is_empty());
        assert!(dataset.source().is_none());
    }

    #[test]
    fn parse_rejects_non_sequence_documents() {
        let error = Dataset::parse("id: temporal\n").expect_err("must fail");
        assert!(error.to_string().contains("YAML sequence"));
        let error = Dataset::parse("- title: no id\n").expect_err("must fail");
        assert!(error.to_string().contains("no string `id`"));
    }

    #[test]
    fn load_reports_malformed_yaml_with_path() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("stage3.yml");
        fs::write(&path, "- id: [unclosed\n").expect("write");
        let error = Dataset::load(&path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse dataset"));
    }

    #[test]
    fn stored_distinguishes_missing_record_from_null_field() {
        let dataset = Dataset::parse(STORED).expect("parse");
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.stored::<String>("nope", "example").expect("stored"), None);
        assert_eq!(
            dataset.stored::<String>("decorators", "example").expect("stored"),
            Some(None)
        );
        assert_eq!(
            dataset.stored::<String>("decorators", "description").expect("stored"),
            Some(None)
        );
        let presented = dataset
            .stored::<Vec<Presentation>>("temporal", "presented")
            .expect("stored");
        assert_eq!(presented.flatten().map(|items| items.len()), Some(1));
    }

    #[test]
    fn record_present_policy_keeps_explicit_absence() {
        let dataset = Dataset::parse(STORED).expect("parse");
        let called = Cell::new(false);
        let value = dataset
            .cached_field::<String, _>("decorators", "example", CachePolicy::RecordPresent, || {
                called.set(true);
                Ok(Some("fetched".to_string()))
            })
            .expect("resolve");
        assert_eq!(value, None);
        assert!(!called.get());
    }

    #[test]
    fn value_present_policy_falls_back_on_missing_field() {
        let dataset = Dataset::parse(STORED).expect("parse");
        let value = dataset
            .cached_field::<String, _>("decorators", "description", CachePolicy::ValuePresent, || {
                Ok(Some("fetched".to_string()))
            })
            .expect("resolve");
        assert_eq!(value.as_deref(), Some("fetched"));

        let value = dataset
            .cached_field::<String, _>("temporal", "description", CachePolicy::ValuePresent, || {
                Ok(Some("fetched".to_string()))
            })
            .expect("resolve");
        assert_eq!(value.as_deref(), Some("Date and time API"));
    }

    #[test]
    fn render_uses_record_key_order() {
        let rendered = render_records(&[record("x")]).expect("render");
        let keys = rendered
            .lines()
            .filter(|line| !line.starts_with("  -") && !line.starts_with("    "))
            .filter_map(|line| line.trim_start_matches("- ").trim().split(':').next())
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![
                "id",
                "authors",
                "champions",
                "example",
                "has_specification",
                "presented",
                "title"
            ]
        );
        assert!(rendered.contains("example: null"));
        assert!(!rendered.contains("tests"));
        assert!(!rendered.contains("url"));
    }

    #[test]
    fn write_records_creates_parent_and_round_trips() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("_data").join("stage3.yml");
        let mut first = record("alpha");
        first.tests = Some(vec!["https://example.com/tests".to_string()]);
        first.example = Some("line one\nline two".to_string());
        write_records(&path, &[first.clone(), record("beta")]).expect("write");

        let content = fs::read_to_string(&path).expect("read");
        let parsed: Vec<ProposalRecord> = serde_yaml::from_str(&content).expect("parse");
        assert_eq!(parsed, vec![first, record("beta")]);

        let dataset = Dataset::load(&path).expect("load");
        assert!(dataset.contains("alpha"));
        assert_eq!(dataset.source(), Some(content.as_str()));
    }
}
