//! Web research aggregation
//!
//! Issues one or more search query variants, merges and deduplicates the
//! hits by normalized URL, extracts page text, and assembles a
//! size-bounded research bundle for the completion prompt. Search trouble
//! degrades the bundle instead of failing the tool call.

mod duckduckgo;

pub use duckduckgo::DuckDuckGoClient;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, warn};
use url::Url;

use crate::Result;

/// Smallest truncated fragment of extracted text worth keeping.
pub const MIN_FRAGMENT_BYTES: usize = 200;

/// A single hit returned by the search backend.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// A deduplicated, rank-ordered search result with extracted text.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub fetched_text: Option<String>,
    pub rank: usize,
}

impl SearchResult {
    /// Text that feeds the research section: extracted page text when the
    /// fetch succeeded, the engine snippet otherwise.
    pub fn text(&self) -> &str {
        self.fetched_text.as_deref().unwrap_or(&self.snippet)
    }
}

/// Aggregated research for one topic.
#[derive(Debug, Clone, Default)]
pub struct ResearchBundle {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub total_bytes: usize,
}

impl ResearchBundle {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Source texts in rank order, one numbered block per source.
    pub fn render(&self) -> String {
        self.results
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{}. {}\n{}\n{}", i + 1, r.title, r.url, r.text()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Search backend seam. Production scrapes DuckDuckGo; tests script a fake.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Run one query and return hits in engine rank order.
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>>;

    /// Fetch a result page and reduce it to visible text.
    async fn fetch_text(&self, url: &str) -> Result<String>;
}

/// Merges search variants into one bounded research bundle.
pub struct SearchAggregator {
    client: Arc<dyn SearchClient>,
    max_bytes: usize,
}

impl SearchAggregator {
    pub fn new(client: Arc<dyn SearchClient>, max_bytes: usize) -> Self {
        Self { client, max_bytes }
    }

    /// Gather research for `topic` by running every query variant and
    /// merging the results.
    ///
    /// Never fails: a variant that errors is skipped, and a fully failed
    /// search yields an empty bundle that callers treat as degraded input.
    pub async fn research(
        &self,
        topic: &str,
        variants: &[String],
        max_results: usize,
    ) -> ResearchBundle {
        let searches = variants.iter().map(|query| self.client.search(query));
        let outcomes = join_all(searches).await;

        // Dedup by normalized URL. First occurrence keeps its fields but
        // the best (lowest) rank seen anywhere wins.
        let mut merged: HashMap<String, SearchResult> = HashMap::new();
        for (variant, outcome) in variants.iter().zip(outcomes) {
            match outcome {
                Ok(hits) => {
                    debug!(variant = %variant, hits = hits.len(), "search variant completed");
                    for (rank, hit) in hits.into_iter().enumerate() {
                        let key = normalize_url(&hit.url);
                        match merged.get_mut(&key) {
                            Some(existing) => {
                                if rank < existing.rank {
                                    existing.rank = rank;
                                }
                            }
                            None => {
                                merged.insert(
                                    key,
                                    SearchResult {
                                        url: hit.url,
                                        title: hit.title,
                                        snippet: hit.snippet,
                                        fetched_text: None,
                                        rank,
                                    },
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(variant = %variant, error = %e, "search variant failed, continuing degraded")
                }
            }
        }

        // Deterministic order: rank, then shorter normalized URL, then
        // lexicographic.
        let mut ordered: Vec<(String, SearchResult)> = merged.into_iter().collect();
        ordered.sort_by(|(key_a, a), (key_b, b)| {
            a.rank
                .cmp(&b.rank)
                .then(key_a.len().cmp(&key_b.len()))
                .then(key_a.cmp(key_b))
        });

        let mut bundle = ResearchBundle {
            query: topic.to_string(),
            ..ResearchBundle::default()
        };

        for (_, mut result) in ordered.into_iter().take(max_results) {
            if bundle.total_bytes >= self.max_bytes {
                break;
            }

            let text = match self.client.fetch_text(&result.url).await {
                Ok(text) if !text.is_empty() => text,
                Ok(_) => result.snippet.clone(),
                Err(e) => {
                    debug!(url = %result.url, error = %e, "text extraction failed, keeping snippet");
                    result.snippet.clone()
                }
            };

            let remaining = self.max_bytes - bundle.total_bytes;
            let text = if text.len() <= remaining {
                text
            } else {
                let fragment = truncate_to_boundary(&text, remaining);
                if fragment.len() < MIN_FRAGMENT_BYTES {
                    break;
                }
                fragment.to_string()
            };

            bundle.total_bytes += text.len();
            result.fetched_text = Some(text);
            bundle.results.push(result);
        }

        bundle
    }
}

/// Normalize a URL for deduplication: lowercase, drop the fragment and
/// known tracking parameters, strip the trailing slash.
pub fn normalize_url(raw: &str) -> String {
    const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "ref", "ref_src"];

    let lowered = raw.trim().to_lowercase();
    let Ok(mut url) = Url::parse(&lowered) else {
        return lowered.trim_end_matches('/').to_string();
    };

    url.set_fragment(None);
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !key.starts_with("utm_") && !TRACKING_PARAMS.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in &kept {
            pairs.append_pair(key, value);
        }
    }

    url.to_string().trim_end_matches('/').to_string()
}

/// Cut `text` to at most `max` bytes without splitting a UTF-8 character.
pub(crate) fn truncate_to_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Scripted search client for tests.
#[cfg(test)]
pub struct FakeSearchClient {
    hits: HashMap<String, Vec<SearchHit>>,
    texts: HashMap<String, String>,
    pub search_calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FakeSearchClient {
    pub fn new() -> Self {
        Self {
            hits: HashMap::new(),
            texts: HashMap::new(),
            search_calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Script the hits returned for a query; unscripted queries fail.
    pub fn hits(mut self, query: &str, hits: Vec<SearchHit>) -> Self {
        self.hits.insert(query.to_string(), hits);
        self
    }

    /// Script the extracted text for a URL; unscripted URLs fail to fetch.
    pub fn text(mut self, url: &str, text: &str) -> Self {
        self.texts.insert(url.to_string(), text.to_string());
        self
    }
}

#[cfg(test)]
#[async_trait]
impl SearchClient for FakeSearchClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        self.search_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.hits
            .get(query)
            .cloned()
            .ok_or_else(|| crate::Error::Search(format!("scripted failure for query {query:?}")))
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        self.texts
            .get(url)
            .cloned()
            .ok_or_else(|| crate::Error::Search(format!("scripted failure for url {url:?}")))
    }
}
