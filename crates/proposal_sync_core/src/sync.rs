use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use rayon::prelude::*;
use similar::TextDiff;
use tracing::{error, info, warn};

use crate::config::{DuplicatePolicy, PresentationPolicy, SyncConfig, UpstreamTarget};
use crate::dataset::{Dataset, Presentation, ProposalRecord, render_records, write_records};
use crate::github::{GitHubClient, ProposalSource, RepositoryRef};
use crate::markdown::{
    FullReference, LinkReferences, TableRow, code_spans_to_html, extract_section, parse_table,
    split_line_breaks, strip_html,
};
use crate::resolve::{
    resolve_description, resolve_example, resolve_has_specification, resolve_presentation,
    resolve_proposal_link, resolve_tests,
};

const PROPOSAL_COLUMNS: &[&str] = &["proposal"];
const AUTHOR_COLUMNS: &[&str] = &["author", "authors"];
const CHAMPION_COLUMNS: &[&str] = &["champion", "champions"];
const TESTS_COLUMNS: &[&str] = &["tests"];
const PRESENTED_COLUMNS: &[&str] = &["last_presented"];

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub upstream: UpstreamTarget,
    pub output_path: PathBuf,
    pub presentations: PresentationPolicy,
    pub duplicates: DuplicatePolicy,
    pub dry_run: bool,
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            upstream: config.upstream_target(),
            output_path: config.output_path(),
            presentations: config.policy.presentations,
            duplicates: config.policy.duplicates,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub output_path: PathBuf,
    pub table_rows: usize,
    pub records: usize,
    pub duplicate_ids: Vec<String>,
    pub changed: bool,
    pub written: bool,
    pub diff: Option<String>,
    pub request_count: usize,
}

/// The stage table together with the link definitions of its document.
#[derive(Debug, Clone)]
pub struct StageTable {
    pub rows: Vec<TableRow>,
    pub links: LinkReferences,
}

#[derive(Debug, Clone)]
pub struct InspectedRow {
    pub label: Option<String>,
    pub title: String,
    pub last_presented: String,
}

pub fn sync_proposals(options: &SyncOptions, config: &SyncConfig) -> Result<SyncReport> {
    let client = GitHubClient::from_config(config)?;
    sync_proposals_with_source(options, &client)
}

pub fn inspect_upstream(config: &SyncConfig) -> Result<Vec<InspectedRow>> {
    let client = GitHubClient::from_config(config)?;
    let table = fetch_stage_table(&config.upstream_target(), &client)?;
    Ok(table
        .rows
        .iter()
        .map(|row| {
            let cell = column(row, PROPOSAL_COLUMNS);
            let reference = FullReference::parse(cell);
            InspectedRow {
                label: reference.as_ref().map(|link| link.label.clone()),
                title: reference
                    .map(|link| code_spans_to_html(&link.text))
                    .unwrap_or_else(|| cell.to_string()),
                last_presented: strip_html(column(row, PRESENTED_COLUMNS)),
            }
        })
        .collect())
}

pub fn fetch_stage_table(
    upstream: &UpstreamTarget,
    source: &dyn ProposalSource,
) -> Result<StageTable> {
    let repository = RepositoryRef::new(&upstream.owner, &upstream.repo);
    let document = source
        .fetch_file(&repository, &upstream.path)
        .context("failed to fetch upstream document")?;
    let section = extract_section(&document, &upstream.start_marker, &upstream.end_marker)?;
    let rows = parse_table(section)
        .with_context(|| format!("failed to parse table under `{}`", upstream.start_marker))?;
    let links = LinkReferences::parse(&document);
    if links.is_empty() && !rows.is_empty() {
        warn!("upstream {}/{} defines no link references", repository, upstream.path);
    }
    info!(
        rows = rows.len(),
        links = links.len(),
        "parsed upstream {}/{}",
        repository,
        upstream.path
    );
    Ok(StageTable { rows, links })
}

pub fn sync_proposals_with_source(
    options: &SyncOptions,
    source: &dyn ProposalSource,
) -> Result<SyncReport> {
    let table = fetch_stage_table(&options.upstream, source)?;
    let dataset = Dataset::load(&options.output_path)?;

    let results = table
        .rows
        .par_iter()
        .enumerate()
        .map(|(index, row)| {
            assemble_record(row, &table.links, &dataset, source, options.presentations)
                .with_context(|| format!("table row {}", index + 1))
        })
        .collect::<Vec<_>>();

    let mut records = Vec::with_capacity(results.len());
    let mut first_error = None;
    let mut failures = 0usize;
    for result in results {
        match result {
            Ok(record) => records.push(record),
            Err(err) => {
                error!("{err:#}");
                failures += 1;
                first_error.get_or_insert(err);
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err.context(format!(
            "{failures} of {} proposals failed; {} was left unchanged",
            table.rows.len(),
            options.output_path.display()
        )));
    }

    let (records, duplicate_ids) = apply_duplicate_policy(records, options.duplicates)?;
    let rendered = render_records(&records)?;
    let previous = dataset.source().unwrap_or_default();
    let changed = previous != rendered;

    let diff = options.dry_run.then(|| {
        TextDiff::from_lines(previous, rendered.as_str())
            .unified_diff()
            .context_radius(3)
            .header("current", "synced")
            .to_string()
    });
    if !options.dry_run {
        write_records(&options.output_path, &records)?;
        info!(
            records = records.len(),
            changed,
            "wrote {}",
            options.output_path.display()
        );
    }

    Ok(SyncReport {
        output_path: options.output_path.clone(),
        table_rows: table.rows.len(),
        records: records.len(),
        duplicate_ids,
        changed,
        written: !options.dry_run,
        diff,
        request_count: source.request_count(),
    })
}

/// Build the record for one table row, resolving every field.
pub fn assemble_record(
    row: &TableRow,
    links: &LinkReferences,
    dataset: &Dataset,
    source: &dyn ProposalSource,
    presentations: PresentationPolicy,
) -> Result<ProposalRecord> {
    let cell = column(row, PROPOSAL_COLUMNS);
    let Some(reference) = FullReference::parse(cell) else {
        bail!("proposal cell `{cell}` is not a reference link");
    };
    let link = resolve_proposal_link(links, &reference.label)?;
    let metadata = source.fetch_repository(&link.repository)?;

    let example = resolve_example(dataset, source, &link)?;
    let description = resolve_description(dataset, &link, &metadata)?;
    let current = resolve_presentation(links, column(row, PRESENTED_COLUMNS))?;
    let presented = match presentations {
        PresentationPolicy::Replace => vec![current],
        PresentationPolicy::Merge => {
            let stored = dataset
                .stored::<Vec<Presentation>>(&link.id, "presented")?
                .flatten()
                .unwrap_or_default();
            merge_presentations(current, stored)
        }
    };

    Ok(ProposalRecord {
        authors: split_line_breaks(column(row, AUTHOR_COLUMNS)),
        champions: split_line_breaks(column(row, CHAMPION_COLUMNS)),
        description,
        example,
        has_specification: resolve_has_specification(&metadata),
        presented,
        title: code_spans_to_html(&reference.text),
        tests: resolve_tests(links, column(row, TESTS_COLUMNS))?,
        id: link.id,
    })
}

/// Current entry first, then stored entries for other dates in stored order.
pub fn merge_presentations(current: Presentation, stored: Vec<Presentation>) -> Vec<Presentation> {
    let mut merged = Vec::with_capacity(stored.len() + 1);
    let current_date = current.date.clone();
    merged.push(current);
    merged.extend(stored.into_iter().filter(|entry| entry.date != current_date));
    merged
}

pub fn apply_duplicate_policy(
    records: Vec<ProposalRecord>,
    policy: DuplicatePolicy,
) -> Result<(Vec<ProposalRecord>, Vec<String>)> {
    let mut first_index = HashMap::<String, usize>::new();
    let mut duplicate_ids = Vec::new();
    for (index, record) in records.iter().enumerate() {
        if first_index.contains_key(&record.id) {
            if !duplicate_ids.contains(&record.id) {
                duplicate_ids.push(record.id.clone());
            }
        } else {
            first_index.insert(record.id.clone(), index);
        }
    }
    if duplicate_ids.is_empty() {
        return Ok((records, duplicate_ids));
    }

    match policy {
        DuplicatePolicy::KeepAll => {
            warn!(ids = ?duplicate_ids, "keeping duplicate proposal ids");
            Ok((records, duplicate_ids))
        }
        DuplicatePolicy::Reject => {
            bail!("duplicate proposal ids: {}", duplicate_ids.join(", "))
        }
        DuplicatePolicy::LastWins => {
            let mut slots: Vec<Option<ProposalRecord>> = Vec::new();
            let mut slot_by_id = HashMap::<String, usize>::new();
            for record in records {
                match slot_by_id.get(&record.id) {
                    Some(&slot) => slots[slot] = Some(record),
                    None => {
                        slot_by_id.insert(record.id.clone(), slots.len());
                        slots.push(Some(record));
                    }
                }
            }
            warn!(ids = ?duplicate_ids, "later rows replaced earlier duplicates");
            Ok((slots.into_iter().flatten().collect(), duplicate_ids))
        }
    }
}

fn column<'a>(row: &'a TableRow, names: &[&str]) -> &'a str {
    names
        .iter()
        .map(|name| row.get(name))
        .find(|value| !value.is_empty())
        .unwrap_or("")
}
