//! web_search：DuckDuckGo HTML 端点搜索
//!
//! 返回结果标题与真实 URL（解开 DuckDuckGo 的 /l/?uddg= 跳转），供 researcher 挑选后交给 web_fetch。

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Url};
use serde_json::Value;

use crate::tools::schema::{parameters_for, parse_args, WebSearchArgs};
use crate::tools::web_fetch::{strip_html_tags, USER_AGENT};
use crate::tools::Tool;

const DUCKDUCKGO_HTML: &str = "https://html.duckduckgo.com/html/";
const DEFAULT_MAX_RESULTS: usize = 5;

/// 单条搜索结果
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

fn result_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#)
            .expect("static regex")
    })
}

fn snippet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)class="result__snippet"[^>]*>(.*?)</a>"#)
            .expect("static regex")
    })
}

fn decode_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
}

/// 解开 DuckDuckGo 跳转链接；非跳转链接原样返回
fn resolve_href(href: &str) -> Option<String> {
    let href = decode_entities(href);
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else if href.starts_with('/') {
        format!("https://duckduckgo.com{}", href)
    } else {
        href
    };
    let url = Url::parse(&absolute).ok()?;
    if url.path().starts_with("/l/") {
        return url
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned());
    }
    Some(url.to_string())
}

/// 从结果页 HTML 中解析前 max 条结果
pub fn parse_results(html: &str, max: usize) -> Vec<SearchHit> {
    let snippets: Vec<String> = snippet_re()
        .captures_iter(html)
        .map(|c| decode_entities(&strip_html_tags(&c[1])))
        .collect();

    result_link_re()
        .captures_iter(html)
        .filter_map(|c| {
            let url = resolve_href(&c[1])?;
            let title = decode_entities(&strip_html_tags(&c[2]));
            Some((title, url))
        })
        .filter(|(_, url)| !url.contains("duckduckgo.com/y.js"))
        .take(max)
        .enumerate()
        .map(|(i, (title, url))| SearchHit {
            title,
            url,
            snippet: snippets.get(i).cloned().unwrap_or_default(),
        })
        .collect()
}

fn render(hits: &[SearchHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, h)| {
            if h.snippet.is_empty() {
                format!("{}. {}\n   {}", i + 1, h.title, h.url)
            } else {
                format!("{}. {}\n   {}\n   {}", i + 1, h.title, h.url, h.snippet)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct WebSearchTool {
    client: Client,
}

impl WebSearchTool {
    pub fn new(timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web (DuckDuckGo) and return result titles with their URLs."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<WebSearchArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: WebSearchArgs = parse_args(args)?;
        let query = args.query.trim();
        if query.is_empty() {
            return Err("Missing query".to_string());
        }
        let max = args.max_results.unwrap_or(DEFAULT_MAX_RESULTS).clamp(1, 20);
        tracing::info!(query = %query, "web_search");

        let resp = self
            .client
            .get(DUCKDUCKGO_HTML)
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let html = resp.text().await.map_err(|e| format!("Read body: {}", e))?;
        let hits = parse_results(&html, max);
        if hits.is_empty() {
            return Ok(format!("No results found for: {}", query));
        }
        Ok(render(&hits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<div class="result">
  <a rel="nofollow" class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Ftokio.rs%2F&amp;rut=abc">Tokio - An <b>asynchronous</b> Rust runtime</a>
  <a class="result__snippet" href="x">Tokio is an <b>event-driven</b> platform.</a>
</div>
<div class="result">
  <a rel="nofollow" class="result__a" href="https://async.rs/">async-std</a>
  <a class="result__snippet" href="y">Async version of the Rust standard library.</a>
</div>
<div class="result">
  <a rel="nofollow" class="result__a" href="https://example.com/third">Third</a>
</div>
"#;

    #[test]
    fn test_parse_results_unwraps_redirects() {
        let hits = parse_results(PAGE, 5);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].url, "https://tokio.rs/");
        assert_eq!(hits[0].title, "Tokio - An asynchronous Rust runtime");
        assert!(hits[0].snippet.contains("event-driven"));
        assert_eq!(hits[1].url, "https://async.rs/");
    }

    #[test]
    fn test_parse_results_respects_max_and_renders() {
        let hits = parse_results(PAGE, 2);
        assert_eq!(hits.len(), 2);
        let text = render(&hits);
        assert!(text.starts_with("1. Tokio"));
        assert!(text.contains("2. async-std\n   https://async.rs/"));
        assert!(parse_results("<html></html>", 5).is_empty());
    }
}
