//! DuckDuckGo HTML search client
//!
//! Talks to the `html.duckduckgo.com` endpoint, which needs no API key.
//! Result anchors are pulled out with regexes and fetched pages are
//! reduced to visible text with a tag stripper.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use url::Url;

use super::{SearchClient, SearchHit};
use crate::error::Error;
use crate::Result;

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const MAX_ENGINE_RESULTS: usize = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Search client backed by DuckDuckGo's HTML endpoint.
pub struct DuckDuckGoClient {
    client: Client,
    result_re: Regex,
    snippet_re: Regex,
}

impl DuckDuckGoClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            result_re: compile(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#)?,
            snippet_re: compile(r#"(?s)<a[^>]*class="result__snippet"[^>]*>(.*?)</a>"#)?,
        })
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Config(format!("bad search pattern: {e}")))
}

#[async_trait]
impl SearchClient for DuckDuckGoClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let response = self
            .client
            .get(SEARCH_ENDPOINT)
            .query(&[("q", query)])
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Search(format!("search returned {status}")));
        }

        let body = response.text().await?;
        Ok(parse_results(&body, &self.result_re, &self.snippet_re))
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Search(format!("fetch of {url} returned {status}")));
        }

        let body = response.text().await?;
        Ok(html_to_text(&body))
    }
}

fn parse_results(body: &str, result_re: &Regex, snippet_re: &Regex) -> Vec<SearchHit> {
    // Result and snippet anchors appear in the same document order, so
    // pairing by index lines them up.
    let snippets: Vec<String> = snippet_re
        .captures_iter(body)
        .map(|caps| clean_fragment(&caps[1]))
        .collect();

    let mut hits = Vec::new();
    for (i, caps) in result_re.captures_iter(body).enumerate() {
        if hits.len() >= MAX_ENGINE_RESULTS {
            break;
        }
        let url = resolve_redirect(&caps[1]);
        let title = clean_fragment(&caps[2]);
        if url.is_empty() || title.is_empty() {
            continue;
        }
        hits.push(SearchHit {
            url,
            title,
            snippet: snippets.get(i).cloned().unwrap_or_default(),
        });
    }
    hits
}

/// DuckDuckGo wraps result links in a `/l/?uddg=<target>` redirect; pull
/// the real target out when present.
fn resolve_redirect(href: &str) -> String {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };

    if let Ok(url) = Url::parse(&absolute) {
        if url.host_str() == Some("duckduckgo.com") && url.path() == "/l/" {
            if let Some((_, target)) = url.query_pairs().find(|(key, _)| key == "uddg") {
                return target.into_owned();
            }
        }
    }
    absolute
}

/// Reduce raw HTML to visible text: script and style blocks removed, tags
/// stripped, common entities decoded, whitespace collapsed.
pub(crate) fn html_to_text(html: &str) -> String {
    let text = strip_block(html, "<script", "</script>");
    let text = strip_block(&text, "<style", "</style>");

    let mut out = String::with_capacity(text.len() / 2);
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }

    decode_entities(&out)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip tags and tidy an inline HTML fragment (title or snippet).
fn clean_fragment(fragment: &str) -> String {
    html_to_text(fragment)
}

fn strip_block(html: &str, open: &str, close: &str) -> String {
    let mut text = html.to_string();
    while let Some(start) = text.find(open) {
        match text[start..].find(close) {
            Some(end) => text.replace_range(start..start + end + close.len(), ""),
            None => {
                text.truncate(start);
                break;
            }
        }
    }
    text
}

fn decode_entities(text: &str) -> String {
    // &amp; must go last or it would re-expose other entities.
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
