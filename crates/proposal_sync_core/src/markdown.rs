use std::collections::BTreeMap;
use std::sync::OnceLock;

use anyhow::{Result, bail};
use regex::{Captures, Regex};

pub const LINE_BREAK: &str = "<br />";

/// One data row of a markdown table keyed by normalized header name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRow {
    cells: BTreeMap<String, String>,
}

impl TableRow {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            cells: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// Cell value for `key`, empty when the column is missing.
    pub fn get(&self, key: &str) -> &str {
        self.cells.get(key).map(String::as_str).unwrap_or("")
    }
}

/// A `[text][label]` link whose target is defined elsewhere in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullReference {
    pub text: String,
    pub label: String,
}

impl FullReference {
    pub fn parse(value: &str) -> Option<Self> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"^\[((?:[^\[\]]|\[[^\[\]]*\])+)\]\[([^\[\]]+)\]$")
                .expect("full reference regex")
        });
        let captures = re.captures(value.trim())?;
        Some(Self {
            text: captures[1].trim().to_string(),
            label: captures[2].trim().to_string(),
        })
    }
}

/// Link reference definitions (`[label]: url`) collected from a document.
#[derive(Debug, Clone, Default)]
pub struct LinkReferences {
    targets: BTreeMap<String, String>,
}

impl LinkReferences {
    pub fn parse(document: &str) -> Self {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"^ {0,3}\[([^\]]+)\]:\s*<?([^\s>]+)>?").expect("link definition regex")
        });

        let mut targets = BTreeMap::new();
        for line in document.lines() {
            let Some(captures) = re.captures(line) else {
                continue;
            };
            let label = normalize_label(&captures[1]);
            if label.is_empty() {
                continue;
            }
            // First definition wins, as in CommonMark.
            targets
                .entry(label)
                .or_insert_with(|| captures[2].to_string());
        }
        Self { targets }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Resolve a label to its URL. An exact (case-insensitive) match wins;
    /// otherwise the label must be a prefix of exactly one definition.
    pub fn resolve(&self, label: &str) -> Result<&str> {
        let key = normalize_label(label);
        if key.is_empty() {
            bail!("cannot resolve an empty link label");
        }
        if let Some(url) = self.targets.get(&key) {
            return Ok(url.as_str());
        }

        let mut candidates = self
            .targets
            .range(key.clone()..)
            .take_while(|(candidate, _)| candidate.starts_with(&key));
        match (candidates.next(), candidates.next()) {
            (Some((_, url)), None) => Ok(url.as_str()),
            (Some((first, _)), Some((second, _))) => bail!(
                "link label `{label}` is ambiguous (matches `{first}`, `{second}`, ...)"
            ),
            (None, _) => bail!("no link reference definition found for `{label}`"),
        }
    }
}

fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Text strictly between the first `start` marker and the next `end` marker.
pub fn extract_section<'a>(document: &'a str, start: &str, end: &str) -> Result<&'a str> {
    let Some(start_index) = document.find(start) else {
        bail!("upstream document has no `{start}` heading");
    };
    let body_start = start_index + start.len();
    let Some(end_offset) = document[body_start..].find(end) else {
        bail!("upstream document has no `{end}` heading after `{start}`");
    };
    Ok(&document[body_start..body_start + end_offset])
}

/// Parse the first markdown table in `section` into header-keyed rows.
pub fn parse_table(section: &str) -> Result<Vec<TableRow>> {
    let mut lines = section
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.starts_with('|'));

    let Some(header_line) = lines.next() else {
        bail!("section does not contain a markdown table");
    };
    let headers = split_row(header_line)
        .iter()
        .map(|cell| normalize_header(cell))
        .collect::<Vec<_>>();

    match lines.next() {
        Some(line) if is_delimiter_row(line) => {}
        _ => bail!("markdown table is missing its delimiter row"),
    }

    let mut rows = Vec::new();
    for line in lines {
        if !line.starts_with('|') {
            break;
        }
        let cells = split_row(line);
        let row = TableRow::from_pairs(headers.iter().enumerate().map(|(index, header)| {
            let value = cells.get(index).map(|cell| sanitize_cell(cell));
            (header.clone(), value.unwrap_or_default())
        }));
        rows.push(row);
    }
    Ok(rows)
}

fn split_row(line: &str) -> Vec<String> {
    let inner = line.trim();
    let inner = inner.strip_prefix('|').unwrap_or(inner);
    let inner = inner.strip_suffix('|').unwrap_or(inner);

    let mut cells = Vec::new();
    let mut current = String::new();
    let mut chars = inner.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if chars.peek() == Some(&'|') => {
                current.push('|');
                chars.next();
            }
            '|' => cells.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(ch),
        }
    }
    cells.push(current.trim().to_string());
    cells
}

fn is_delimiter_row(line: &str) -> bool {
    let cells = split_row(line);
    !cells.is_empty()
        && cells.iter().all(|cell| {
            let dashes = cell.trim_start_matches(':').trim_end_matches(':');
            !dashes.is_empty() && dashes.chars().all(|ch| ch == '-')
        })
}

/// Lower-cased, tag-free header with spaces replaced by underscores.
pub fn normalize_header(raw: &str) -> String {
    strip_html(raw)
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Remove every HTML tag.
pub fn strip_html(raw: &str) -> String {
    tag_regex().replace_all(raw, "").trim().to_string()
}

/// Remove HTML tags except `<code>` and line breaks; breaks become `<br />`.
pub fn sanitize_cell(raw: &str) -> String {
    tag_regex()
        .replace_all(raw, |captures: &Captures| {
            let closing = !captures[1].is_empty();
            match captures[2].to_ascii_lowercase().as_str() {
                "code" if closing => "</code>".to_string(),
                "code" => "<code>".to_string(),
                "br" => LINE_BREAK.to_string(),
                _ => String::new(),
            }
        })
        .trim()
        .to_string()
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<\s*(/?)\s*([A-Za-z][A-Za-z0-9-]*)(?:\s[^<>]*)?/?\s*>").expect("html tag regex")
    })
}

/// Split on `<br />` keeping order; blank segments are dropped.
pub fn split_line_breaks(value: &str) -> Vec<String> {
    value
        .split(LINE_BREAK)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Convert inline code spans to `<code>` markup.
pub fn code_spans_to_html(value: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"`([^`]+)`").expect("code span regex"));
    re.replace_all(value, "<code>$1</code>").into_owned()
}

/// Bodies of every fenced code block, in document order.
pub fn fenced_code_blocks(markdown: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut open: Option<(char, usize, Vec<&str>)> = None;

    for line in markdown.lines() {
        let trimmed = line.trim_start();
        match open.as_mut() {
            None => {
                if let Some((fence, width)) = fence_marker(trimmed) {
                    open = Some((fence, width, Vec::new()));
                }
            }
            Some((fence, width, body)) => {
                let closes = fence_marker(trimmed).is_some_and(|(ch, len)| {
                    ch == *fence && len >= *width && trimmed.trim_start_matches(ch).trim().is_empty()
                });
                if closes {
                    blocks.push(body.join("\n"));
                    open = None;
                } else {
                    body.push(line);
                }
            }
        }
    }
    blocks
}

fn fence_marker(line: &str) -> Option<(char, usize)> {
    let fence = line.chars().next().filter(|ch| matches!(ch, '`' | '~'))?;
    let width = line.chars().take_while(|ch| *ch == fence).count();
    (width >= 3).then_some((fence, width))
}
