use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use super::{ProviderClient, ProviderError, SearchResult, check_status, classify_transport};
use crate::ProviderCandidate;

pub const NAME: &str = "Semantic Scholar";

/// Primary provider: broadest coverage across paper types. Queries with the
/// raw extracted title — the Graph API's own relevance ranking handles noise
/// better than a pre-simplified query here.
pub struct SemanticScholar {
    pub api_key: Option<String>,
}

impl ProviderClient for SemanticScholar {
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
            let url = format!(
                "https://api.semanticscholar.org/graph/v1/paper/search?query={}&limit=5&fields=title,abstract,year,authors,citationCount,externalIds",
                urlencoding::encode(title)
            );

            let mut req = client
                .get(&url)
                .header("User-Agent", "RefNavi-MetadataFetcher/1.0")
                .timeout(timeout);
            if let Some(ref key) = self.api_key {
                req = req.header("x-api-key", key);
            }

            let resp = req.send().await.map_err(classify_transport)?;
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
    let items = data["data"].as_array().cloned().unwrap_or_default();
    items
        .iter()
        .filter_map(|item| {
            let title = item["title"].as_str()?;
            Some(ProviderCandidate {
                title: title.to_string(),
                abstract_text: item["abstract"].as_str().map(String::from),
                year: item["year"].as_i64().map(|y| y as i32),
                authors: item["authors"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|a| a["name"].as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default(),
                doi: item["externalIds"]["DOI"].as_str().map(String::from),
                citation_count: item["citationCount"].as_u64().unwrap_or(0),
                provider: NAME.to_string(),
            })
        })
        .collect()
}
