//! Content providers for remote placeholders: a same-site page crawler and a
//! downloader that extracts document text through Tika.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use scraper::{Html, Selector};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::config::ProviderConfig;
use crate::error::{GatewayError, Result};

const PAGE_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(180);

const SKIP_SUFFIXES: &[&str] = &[
    ".mp3", ".wav", ".aac", ".flac", ".mp4", ".avi", ".mov", ".wmv", ".flv", ".jpg", ".jpeg",
    ".png", ".gif", ".svg", ".webp", ".ico", ".pdf", ".zip", ".rar", ".gz", ".apk", ".exe",
    ".dmg", ".css", ".js", ".woff", ".woff2", ".ttf",
];

const SKIP_MIME_PREFIXES: &[&str] = &[
    "application/octet-stream",
    "application/pdf",
    "application/zip",
    "application/vnd.",
    "image/",
    "audio/",
    "video/",
    "font/",
];

/// Resolves a remote placeholder's source (a URL) into plain text.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn fetch(&self, source: &str) -> Result<String>;
}

/// Crawls a page, and optionally its same-site links, into one text blob.
pub struct PageCrawler {
    client: reqwest::Client,
    depth: usize,
    max_pages: usize,
}

impl PageCrawler {
    pub fn new(client: reqwest::Client, config: &ProviderConfig) -> Self {
        Self {
            client,
            depth: config.crawl_depth.max(1),
            max_pages: config.crawl_max_pages.max(1),
        }
    }

    async fn crawl(&self, entry: &str) -> Result<Vec<String>> {
        let entry = Url::parse(entry)
            .map_err(|e| GatewayError::Provider(format!("invalid url {entry}: {e}")))?;
        let site = site_host(&entry);

        let mut seen = HashSet::from([entry.to_string()]);
        let mut queue = VecDeque::from([(entry, 1usize)]);
        let mut pages = Vec::new();
        let mut visited = 0;

        while let Some((url, level)) = queue.pop_front() {
            if visited >= self.max_pages {
                break;
            }
            visited += 1;

            let html = match self.fetch_html(&url).await {
                Ok(Some(html)) => html,
                Ok(None) => continue,
                Err(e) if level == 1 => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, url = %url, "skipping page");
                    continue;
                }
            };

            let text = strip_html(&html);
            if !text.is_empty() {
                pages.push(text);
            }

            if level < self.depth {
                for link in extract_links(&html, &url) {
                    if in_site(&link, &site) && seen.insert(link.to_string()) {
                        queue.push_back((link, level + 1));
                    }
                }
            }
        }

        tracing::info!(pages = pages.len(), visited, "crawl done");
        Ok(pages)
    }

    /// Fetch a page body, or `None` when the response is not text.
    async fn fetch_html(&self, url: &Url) -> Result<Option<String>> {
        let resp = self
            .client
            .get(url.clone())
            .header("User-Agent", "Mozilla/5.0 (compatible; ragway/1.0)")
            .timeout(PAGE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if SKIP_MIME_PREFIXES.iter().any(|m| content_type.starts_with(m)) {
            tracing::debug!(url = %url, content_type = %content_type, "skipping binary response");
            return Ok(None);
        }
        Ok(Some(resp.text().await?))
    }
}

#[async_trait]
impl ContentProvider for PageCrawler {
    async fn fetch(&self, source: &str) -> Result<String> {
        Ok(self.crawl(source).await?.join(". "))
    }
}

/// Host the crawl stays under: the entry host without a leading `www.`.
fn site_host(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) if rest.contains('.') && host.parse::<IpAddr>().is_err() => rest.to_string(),
        _ => host,
    }
}

fn in_site(url: &Url, site: &str) -> bool {
    let path = url.path().to_ascii_lowercase();
    matches!(url.scheme(), "http" | "https")
        && url.host_str().is_some_and(|h| {
            let h = h.to_ascii_lowercase();
            h == site || h.strip_suffix(site).is_some_and(|sub| sub.ends_with('.'))
        })
        && !SKIP_SUFFIXES.iter().any(|s| path.ends_with(s))
}

fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let Ok(anchor) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    document
        .select(&anchor)
        .filter_map(|el| el.value().attr("href"))
        .filter(|href| !href.starts_with('#') && !href.starts_with("mailto:"))
        .filter_map(|href| base.join(href).ok())
        .map(|mut url| {
            url.set_fragment(None);
            url
        })
        .collect()
}

/// Visible body text: script/style/noscript contents dropped, whitespace
/// collapsed.
fn strip_html(html: &str) -> String {
    let document = Html::parse_document(html);
    let (Ok(body_sel), Ok(hidden_sel)) = (
        Selector::parse("body"),
        Selector::parse("script, style, noscript"),
    ) else {
        return String::new();
    };

    let text = document
        .select(&body_sel)
        .next()
        .map(|body| {
            let hidden: HashSet<_> = body.select(&hidden_sel).map(|el| el.id()).collect();
            body.descendants()
                .filter_map(|node| match node.value() {
                    scraper::node::Node::Text(t)
                        if !node.ancestors().any(|a| hidden.contains(&a.id())) =>
                    {
                        Some(t.text.as_ref())
                    }
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    collapse_whitespace(&text)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Downloads a file and extracts its text through an Apache Tika server.
pub struct TikaFileProvider {
    client: reqwest::Client,
    tika_host: String,
}

impl TikaFileProvider {
    pub fn new(client: reqwest::Client, config: &ProviderConfig) -> Self {
        Self {
            client,
            tika_host: config.tika_host.trim_end_matches('/').to_string(),
        }
    }

    async fn download(&self, url: &str) -> Result<tempfile::NamedTempFile> {
        let tmp = tempfile::Builder::new().prefix("ragway-ext-").tempfile()?;
        let resp = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(tmp.path()).await?;
        let mut body = resp.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            written += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        tracing::debug!(url, bytes = written, dst = %tmp.path().display(), "download finished");
        Ok(tmp)
    }

    async fn extract(&self, path: &std::path::Path) -> Result<String> {
        let file = tokio::fs::File::open(path).await?;
        let resp = self
            .client
            .put(format!("{}/tika", self.tika_host))
            .header(reqwest::header::ACCEPT, "text/plain")
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream { status, body });
        }
        Ok(collapse_whitespace(&resp.text().await?))
    }
}

#[async_trait]
impl ContentProvider for TikaFileProvider {
    async fn fetch(&self, source: &str) -> Result<String> {
        // the temp file is removed when `tmp` drops
        let tmp = self.download(source).await?;
        let text = self.extract(tmp.path()).await?;
        tracing::info!(url = source, chars = text.chars().count(), "file extracted");
        Ok(text)
    }
}
