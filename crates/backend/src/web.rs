//! Web search and URL fetching.
//!
//! Search goes through the Tavily API when a key is configured, with an
//! HTML-scrape fallback that needs no key. Fetched HTML is reduced to
//! readable text with regex tag stripping — good enough for feeding
//! pages to the LLM without a full DOM parser.

use std::sync::LazyLock;

use serde_json::{json, Value};

use gp_domain::config::WebConfig;
use gp_domain::error::{Error, Result};

const MAX_RESPONSE_BYTES: usize = 5 * 1024 * 1024;
const USER_AGENT: &str = "graphpilot/0.1";

/// A single web search hit.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// A fetched page.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub content: String,
    pub content_type: String,
    pub status_code: u16,
    pub url: String,
}

pub struct WebClient {
    tavily_api_key: String,
    client: reqwest::Client,
}

impl WebClient {
    pub fn from_config(cfg: &WebConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(cfg.timeout))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            tavily_api_key: cfg.resolve_tavily_key(),
            client,
        })
    }

    /// Fetch a URL, extracting readable text from HTML responses.
    pub async fn fetch_url(&self, url: &str) -> Result<FetchResult> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Http(format!("fetch {url}: {e}")))?;

        let status_code = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Http(format!("fetch {url}: {e}")))?;
        let truncated = &bytes[..bytes.len().min(MAX_RESPONSE_BYTES)];
        let mut content = String::from_utf8_lossy(truncated).into_owned();

        if content_type.contains("html") {
            content = extract_text_from_html(&content);
        }

        Ok(FetchResult {
            content,
            content_type,
            status_code,
            url: url.to_owned(),
        })
    }

    /// Fetch a URL as raw bytes (for binary payloads like images).
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Http(format!("fetch {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Http(format!("fetch {url}: HTTP {}", status.as_u16())));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Http(format!("fetch {url}: {e}")))?;
        Ok(bytes[..bytes.len().min(MAX_RESPONSE_BYTES)].to_vec())
    }

    /// Stream a URL into a file (for large payloads like model files).
    /// Returns the number of bytes written.
    pub async fn download_to_file(&self, url: &str, path: &std::path::Path) -> Result<u64> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Http(format!("download {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Http(format!(
                "download {url}: HTTP {}",
                status.as_u16()
            )));
        }

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| Error::Http(format!("create {}: {e}", path.display())))?;
        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| Error::Http(format!("download {url}: {e}")))?
        {
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk)
                .await
                .map_err(|e| Error::Http(format!("write {}: {e}", path.display())))?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    /// Search the web. Tavily when configured, scrape fallback otherwise.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        if !self.tavily_api_key.is_empty() {
            return self.search_tavily(query, max_results).await;
        }
        self.search_fallback(query, max_results).await
    }

    async fn search_tavily(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let payload = json!({
            "api_key": self.tavily_api_key,
            "query": query,
            "max_results": max_results,
            "include_answer": false,
        });
        let resp = self
            .client
            .post("https://api.tavily.com/search")
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Http(format!("tavily: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Http(format!(
                "tavily: HTTP {} - {}",
                status.as_u16(),
                &body[..body.len().min(200)]
            )));
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| Error::Http(format!("tavily: {e}")))?;

        Ok(data
            .get("results")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|item| SearchResult {
                        title: str_of(item, "title"),
                        url: str_of(item, "url"),
                        snippet: str_of(item, "content"),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn search_fallback(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let url = format!(
            "https://html.duckduckgo.com/html/?q={}",
            urlencode(query)
        );
        let resp = self
            .client
            .get(&url)
            .header(
                "User-Agent",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            )
            .send()
            .await
            .map_err(|e| Error::Http(format!("search fallback: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Http(format!(
                "search fallback returned HTTP {}",
                status.as_u16()
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(parse_fallback_html(&body, max_results))
    }
}

fn str_of(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_owned()
}

// ── HTML processing (stdlib + regex, no DOM parser) ────────────────

static SCRIPT_STYLE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>").unwrap()
});
static TAG_RE: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"<[^>]+>").unwrap());
static BLANKS_RE: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"\n{3,}").unwrap());

/// Strip tags and boilerplate from HTML, leaving readable text.
pub fn extract_text_from_html(raw_html: &str) -> String {
    let text = SCRIPT_STYLE_RE.replace_all(raw_html, "");
    let text = TAG_RE.replace_all(&text, "\n");
    let text = unescape_entities(&text);
    let joined: String = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    BLANKS_RE.replace_all(&joined, "\n\n").trim().to_owned()
}

fn unescape_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

static RESULT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r#"(?is)class="result__a"[^>]*href="([^"]*)"[^>]*>(.*?)</a>.*?class="result__snippet"[^>]*>(.*?)</(?:td|div)"#,
    )
    .unwrap()
});

fn parse_fallback_html(raw_html: &str, max_results: usize) -> Vec<SearchResult> {
    let mut results = Vec::new();
    for cap in RESULT_RE.captures_iter(raw_html) {
        if results.len() >= max_results {
            break;
        }
        let url = unescape_entities(&cap[1]);
        let title = TAG_RE.replace_all(&unescape_entities(&cap[2]), "").trim().to_owned();
        let snippet = TAG_RE
            .replace_all(&unescape_entities(&cap[3]), "")
            .trim()
            .to_owned();
        if !url.is_empty() && !title.is_empty() {
            results.push(SearchResult {
                title,
                url,
                snippet,
            });
        }
    }
    results
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
