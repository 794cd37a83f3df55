use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::dataset::{CachePolicy, Dataset, Presentation};
use crate::github::{ProposalSource, RepositoryMetadata, RepositoryRef};
use crate::markdown::{FullReference, LinkReferences, fenced_code_blocks, strip_html};

pub const PROPOSAL_README_PATH: &str = "README.md";
pub const SPECIFICATION_FILENAME: &str = "spec.html";

/// Where a proposal lives, resolved from its link label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalLink {
    pub id: String,
    pub url: String,
    pub repository: RepositoryRef,
}

pub fn resolve_proposal_link(links: &LinkReferences, label: &str) -> Result<ProposalLink> {
    let url = links.resolve(label)?;
    let id = slug_from_url(url)?;
    let repository = RepositoryRef::from_url(url)
        .with_context(|| format!("proposal `{label}` does not link to a repository"))?;
    Ok(ProposalLink {
        id,
        url: url.to_string(),
        repository,
    })
}

/// Last path segment of `url`, lower-cased, ignoring a trailing slash.
pub fn slug_from_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    match trimmed.rsplit('/').next() {
        Some(segment) if !segment.is_empty() && segment != trimmed => Ok(segment.to_lowercase()),
        _ => bail!("cannot derive an identifier from `{url}`"),
    }
}

/// Stored example for `id` if the dataset has the record (even when it is
/// null); otherwise the last fenced code block of the proposal README.
pub fn resolve_example(
    dataset: &Dataset,
    source: &dyn ProposalSource,
    link: &ProposalLink,
) -> Result<Option<String>> {
    dataset.cached_field(&link.id, "example", CachePolicy::RecordPresent, || {
        debug!(id = %link.id, "fetching example from README");
        let readme = source.fetch_file(&link.repository, PROPOSAL_README_PATH)?;
        Ok(fenced_code_blocks(&readme).pop())
    })
}

/// Stored description for `id` when non-null; otherwise the host's description.
pub fn resolve_description(
    dataset: &Dataset,
    link: &ProposalLink,
    metadata: &RepositoryMetadata,
) -> Result<Option<String>> {
    dataset.cached_field(&link.id, "description", CachePolicy::ValuePresent, || {
        debug!(id = %link.id, "using repository description");
        Ok(metadata.description.clone())
    })
}

pub fn resolve_has_specification(metadata: &RepositoryMetadata) -> bool {
    metadata.has_top_level_entry(SPECIFICATION_FILENAME)
}

/// Parse a "last presented" cell: `[date][notes-label]` or a bare date.
pub fn resolve_presentation(links: &LinkReferences, cell: &str) -> Result<Presentation> {
    let text = strip_html(cell);
    if text.starts_with('[') {
        let Some(link) = FullReference::parse(&text) else {
            bail!("malformed presentation link `{text}`");
        };
        let url = links.resolve(&link.label)?;
        return Ok(Presentation {
            date: link.text,
            url: Some(url.to_string()),
        });
    }
    Ok(Presentation {
        date: text,
        url: None,
    })
}

/// Test links are kept only when the cell is a full reference link.
pub fn resolve_tests(links: &LinkReferences, cell: &str) -> Result<Option<Vec<String>>> {
    match FullReference::parse(&strip_html(cell)) {
        Some(link) => Ok(Some(vec![links.resolve(&link.label)?.to_string()])),
        None => Ok(None),
    }
}
