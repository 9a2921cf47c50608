//! Candidate/query alignment validation.
//!
//! Title similarity alone produces false positives among papers with generic
//! or overlapping titles; a weak corroborating signal (year, author) sharply
//! reduces mismatches without requiring exact bibliographic agreement.

use crate::matching::{normalize_title, similarity};
use crate::{ProviderCandidate, ReferenceQuery};

/// Tunable acceptance policy. The thresholds are configuration, not
/// invariants — see [`Config`](crate::Config).
#[derive(Debug, Clone, Copy)]
pub struct AlignmentPolicy {
    pub loose_threshold: f64,
    pub year_tolerance: i32,
}

impl Default for AlignmentPolicy {
    fn default() -> Self {
        Self {
            loose_threshold: 0.5,
            year_tolerance: 1,
        }
    }
}

/// Decide whether a candidate record is the same work as the query.
///
/// An exact title match (similarity 1.0) is accepted outright. Above the
/// loose threshold the match is accepted only when both the year window and
/// the author-overlap check pass; each is vacuously true when the query
/// carries no prior or the candidate lacks the field.
pub fn is_aligned(
    candidate: &ProviderCandidate,
    query: &ReferenceQuery,
    policy: &AlignmentPolicy,
) -> bool {
    let score = similarity(
        &normalize_title(&candidate.title),
        &normalize_title(&query.extracted_title),
    );
    if score >= 1.0 {
        return true;
    }
    if score <= policy.loose_threshold {
        return false;
    }
    year_aligned(candidate.year, query.known_year, policy.year_tolerance)
        && authors_aligned(&query.known_authors, &candidate.authors)
}

/// Tolerates off-by-one publication/preprint-year discrepancies.
fn year_aligned(candidate: Option<i32>, known: Option<i32>, tolerance: i32) -> bool {
    match (candidate, known) {
        (Some(c), Some(k)) => (c - k).abs() <= tolerance,
        _ => true,
    }
}

/// A single corroborating author is sufficient; name formatting varies too
/// widely across providers for anything stricter. Comparison is
/// substring-or-equality after title normalization.
fn authors_aligned(known: &[String], found: &[String]) -> bool {
    if known.is_empty() {
        return true;
    }
    let found_norm: Vec<String> = found.iter().map(|a| normalize_title(a)).collect();
    known
        .iter()
        .map(|a| normalize_title(a))
        .filter(|a| !a.is_empty())
        .any(|ka| found_norm.iter().any(|fa| fa == &ka || fa.contains(ka.as_str())))
}
