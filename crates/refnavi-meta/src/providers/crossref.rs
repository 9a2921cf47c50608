use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{ProviderClient, ProviderError, SearchResult, check_status, classify_transport};
use crate::ProviderCandidate;
use crate::matching::query_words;

pub const NAME: &str = "CrossRef";

/// CrossRef abstracts arrive as JATS XML fragments.
static JATS_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[^>]+>").unwrap());
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Tertiary provider: DOI-authoritative records. Supplying a `mailto`
/// enrolls in CrossRef's polite pool and earns a higher request rate.
pub struct CrossRef {
    pub mailto: Option<String>,
}

impl ProviderClient for CrossRef {
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
                "https://api.crossref.org/works?query.title={}&rows=5",
                urlencoding::encode(&query)
            );

            let user_agent = if let Some(ref email) = self.mailto {
                url.push_str(&format!("&mailto={}", urlencoding::encode(email)));
                format!("RefNavi-MetadataFetcher/1.0 (mailto:{})", email)
            } else {
                "RefNavi-MetadataFetcher/1.0".to_string()
            };

            let resp = client
                .get(&url)
                .header("User-Agent", user_agent)
                .timeout(timeout)
                .send()
                .await
                .map_err(classify_transport)?;
            check_status(&resp)?;

            let data: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| ProviderError::Malformed(e.to_string()))?;
            Ok(map_items(&data))
        })
    }
}

fn map_items(data: &serde_json::Value) -> Vec<ProviderCandidate> {
    let items = data["message"]["items"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    items
        .iter()
        .filter_map(|item| {
            let title = item["title"]
                .as_array()
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())?;
            Some(ProviderCandidate {
                title: title.to_string(),
                abstract_text: item["abstract"].as_str().and_then(strip_jats),
                year: issued_year(item),
                authors: item["author"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|a| {
                                let given = a["given"].as_str().unwrap_or("");
                                let family = a["family"].as_str().unwrap_or("");
                                let name = format!("{} {}", given, family).trim().to_string();
                                if name.is_empty() { None } else { Some(name) }
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
                doi: item["DOI"].as_str().map(String::from),
                citation_count: item["is-referenced-by-count"].as_u64().unwrap_or(0),
                provider: NAME.to_string(),
            })
        })
        .collect()
}

/// Publication year from the `issued` date-parts (`[[year, month, day]]`).
fn issued_year(item: &serde_json::Value) -> Option<i32> {
    item["issued"]["date-parts"]
        .as_array()
        .and_then(|parts| parts.first())
        .and_then(|first| first.as_array())
        .and_then(|ymd| ymd.first())
        .and_then(|y| y.as_i64())
        .map(|y| y as i32)
}

/// Strip JATS tags from a CrossRef abstract and collapse the leftover
/// whitespace. Returns `None` when nothing but markup remains.
fn strip_jats(raw: &str) -> Option<String> {
    let stripped = JATS_TAG.replace_all(raw, " ");
    let collapsed = WHITESPACE_RUN.replace_all(stripped.trim(), " ").into_owned();
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}
