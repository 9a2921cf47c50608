use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use super::{ProviderClient, ProviderError, SearchResult, check_status, classify_transport};
use crate::ProviderCandidate;
use crate::matching::query_words;

pub const NAME: &str = "OpenAlex";

/// Secondary provider. OpenAlex returns abstracts as an inverted index
/// (word → positions) rather than plain text; they are reconstructed here.
pub struct OpenAlex {
    pub api_key: Option<String>,
}

impl ProviderClient for OpenAlex {
    fn name(&self) -> &str {
        NAME
    }

    fn search<'a>(
        &'a self,
        title: &'a str,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = SearchResult> + Send + 'a>> {
        Box::pin(async move {
            let query = query_words(title, 6);
            let mut url = format!(
                "https://api.openalex.org/works?filter=title.search:{}&per-page=5",
                urlencoding::encode(&query)
            );
            if let Some(ref key) = self.api_key {
                url.push_str(&format!("&api_key={}", urlencoding::encode(key)));
            }

            let resp = client
                .get(&url)
                .header("User-Agent", "RefNavi-MetadataFetcher/1.0")
                .timeout(timeout)
                .send()
                .await
                .map_err(classify_transport)?;
            check_status(&resp)?;

            let data: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| ProviderError::Malformed(e.to_string()))?;
            Ok(map_results(&data))
        })
    }
}

fn map_results(data: &serde_json::Value) -> Vec<ProviderCandidate> {
    let results = data["results"].as_array().cloned().unwrap_or_default();
    results
        .iter()
        .take(5)
        .filter_map(|item| {
            let title = item["title"]
                .as_str()
                .or_else(|| item["display_name"].as_str())?;
            Some(ProviderCandidate {
                title: title.to_string(),
                abstract_text: reconstruct_abstract(&item["abstract_inverted_index"]),
                year: item["publication_year"].as_i64().map(|y| y as i32),
                authors: item["authorships"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|a| a["author"]["display_name"].as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default(),
                doi: item["doi"].as_str().map(strip_doi_url),
                citation_count: item["cited_by_count"].as_u64().unwrap_or(0),
                provider: NAME.to_string(),
            })
        })
        .collect()
}

/// OpenAlex serves DOIs as full `https://doi.org/...` URLs; keep the bare DOI.
fn strip_doi_url(doi: &str) -> String {
    doi.strip_prefix("https://doi.org/")
        .unwrap_or(doi)
        .to_string()
}

/// Rebuild a plain-text abstract from OpenAlex's inverted index: each word
/// maps to the list of positions where it occurs; emit words in position
/// order, space-joined.
fn reconstruct_abstract(inverted: &serde_json::Value) -> Option<String> {
    let map = inverted.as_object()?;
    if map.is_empty() {
        return None;
    }

    let mut positions: Vec<(u64, &str)> = Vec::new();
    for (word, occurrences) in map {
        for pos in occurrences.as_array()? {
            if let Some(p) = pos.as_u64() {
                positions.push((p, word.as_str()));
            }
        }
    }
    if positions.is_empty() {
        return None;
    }
    positions.sort_by_key(|(p, _)| *p);

    Some(
        positions
            .into_iter()
            .map(|(_, w)| w)
            .collect::<Vec<_>>()
            .join(" "),
    )
}
