//! External boundary: reference records in, metadata-merged records out.
//!
//! The extraction stage hands over numbered reference records with a
//! best-effort title and optional citation-context sentences; the storage
//! and indexing stages expect the same records back with `abstract`, `doi`,
//! `year`, `authors`, `citation_count`, and `source` merged in. Citation
//! contexts pass through untouched.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::resolver::{ResolutionContext, resolve_batch};
use crate::{ProgressEvent, ReferenceQuery, ResolvedMetadata};

/// A reference record as produced by the extraction stage. `year` and
/// `authors`, when present, serve as weak priors for alignment validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub ref_number: usize,
    #[serde(default)]
    pub ref_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_citation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citation_contexts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
}

/// A reference record with resolved metadata merged in. `source` names the
/// accepting provider, or `"none"` when the reference stayed unresolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub ref_number: usize,
    pub ref_title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citation_contexts: Vec<String>,
    #[serde(rename = "abstract", default, skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub citation_count: u64,
    pub source: String,
}

/// Build the resolution input for a record. The raw citation falls back to
/// the title when the extraction stage did not keep the original string.
pub fn query_from_record(record: &ReferenceRecord) -> ReferenceQuery {
    ReferenceQuery {
        raw_citation: record
            .raw_citation
            .clone()
            .unwrap_or_else(|| record.ref_title.clone()),
        extracted_title: record.ref_title.trim().to_string(),
        known_year: record.year,
        known_authors: record.authors.clone(),
    }
}

/// Merge a resolution outcome into its originating record.
pub fn merge(record: ReferenceRecord, resolved: &ResolvedMetadata) -> EnrichedRecord {
    match resolved {
        ResolvedMetadata::Found {
            abstract_text,
            year,
            authors,
            doi,
            citation_count,
            source,
            ..
        } => EnrichedRecord {
            ref_number: record.ref_number,
            ref_title: record.ref_title,
            citation_contexts: record.citation_contexts,
            abstract_text: abstract_text.clone(),
            doi: doi.clone(),
            year: *year,
            authors: authors.clone(),
            citation_count: *citation_count,
            source: source.clone(),
        },
        ResolvedMetadata::Unresolved => EnrichedRecord {
            ref_number: record.ref_number,
            ref_title: record.ref_title,
            citation_contexts: record.citation_contexts,
            abstract_text: None,
            doi: None,
            year: None,
            authors: vec![],
            citation_count: 0,
            source: "none".to_string(),
        },
    }
}

/// Resolve and merge a whole reference list. Records come back in input
/// order, one output per input.
pub async fn enrich_references(
    records: Vec<ReferenceRecord>,
    ctx: Arc<ResolutionContext>,
    progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    cancel: CancellationToken,
) -> Vec<EnrichedRecord> {
    let queries: Vec<ReferenceQuery> = records.iter().map(query_from_record).collect();
    let resolved = resolve_batch(ctx, queries, progress, cancel).await;
    records
        .into_iter()
        .zip(resolved.iter())
        .map(|(record, outcome)| merge(record, outcome))
        .collect()
}
