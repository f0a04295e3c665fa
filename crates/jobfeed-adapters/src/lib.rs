//! Source adapter contract + the selector-driven job board adapter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use jobfeed_core::{normalize, RawJob};
use jobfeed_storage::{FetchError, FetchedPage, HttpFetcher, ListingStore, StoreError};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_id}: no page could be loaded ({failed_pages} failed)")]
    Unreachable { source_id: String, failed_pages: u32 },
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Message(String),
}

/// A site-specific producer of listings.
///
/// `scrape` writes every listing it finds straight into `store`. Per-page
/// failures are handled inside the adapter; an `Err` means the adapter could
/// not make progress at all.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn scrape(&self, store: &ListingStore, max_pages: u32) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageMode {
    Live,
    Fixture,
}

/// CSS selectors for one listing card. Every selector except `card` is
/// evaluated inside the card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSelectors {
    pub card: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Element carrying the link; the card itself when absent.
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default = "default_link_attr")]
    pub link_attr: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub posted: Option<String>,
    /// Read the posting time from this attribute (e.g. `datetime`) instead of text.
    #[serde(default)]
    pub posted_attr: Option<String>,
}

fn default_link_attr() -> String {
    "href".to_string()
}

fn default_true() -> bool {
    true
}

fn default_first_page() -> u32 {
    1
}

fn default_page_step() -> u32 {
    1
}

fn default_query_separator() -> String {
    "+".to_string()
}

/// One job board entry of the source registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub mode: PageMode,
    /// Search URL template with `{query}` and `{page}` placeholders.
    pub listing_url: String,
    #[serde(default)]
    pub fallback_urls: Vec<String>,
    #[serde(default = "default_first_page")]
    pub first_page: u32,
    #[serde(default = "default_page_step")]
    pub page_step: u32,
    #[serde(default = "default_query_separator")]
    pub query_separator: String,
    /// Location recorded when a card does not state one.
    #[serde(default)]
    pub default_location: Option<String>,
    pub selectors: BoardSelectors,
}

impl BoardConfig {
    pub fn page_number(&self, page_index: u32) -> u32 {
        self.first_page
            .saturating_add(page_index.saturating_mul(self.page_step))
    }

    pub fn page_url(&self, query: &str, page_index: u32) -> String {
        render_template(&self.listing_url, query, &self.query_separator, self.page_number(page_index))
    }

    /// Primary URL first, then the configured fallbacks.
    pub fn candidate_urls(&self, query: &str, page_index: u32) -> Vec<String> {
        let page = self.page_number(page_index);
        std::iter::once(&self.listing_url)
            .chain(self.fallback_urls.iter())
            .map(|template| render_template(template, query, &self.query_separator, page))
            .collect()
    }
}

fn render_template(template: &str, query: &str, separator: &str, page: u32) -> String {
    let query = query.split_whitespace().collect::<Vec<_>>().join(separator);
    template
        .replace("{query}", &query)
        .replace("{page}", &page.to_string())
}

#[derive(Debug)]
struct CompiledSelectors {
    card: Selector,
    title: Option<Selector>,
    link: Option<Selector>,
    company: Option<Selector>,
    location: Option<Selector>,
    description: Option<Selector>,
    posted: Option<Selector>,
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn compile_optional(selector: &Option<String>) -> Result<Option<Selector>, AdapterError> {
    selector.as_deref().map(compile).transpose()
}

impl CompiledSelectors {
    fn new(selectors: &BoardSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            card: compile(&selectors.card)?,
            title: compile_optional(&selectors.title)?,
            link: compile_optional(&selectors.link)?,
            company: compile_optional(&selectors.company)?,
            location: compile_optional(&selectors.location)?,
            description: compile_optional(&selectors.description)?,
            posted: compile_optional(&selectors.posted)?,
        })
    }
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(card: &ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    card.select(selector?)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_attr(card: &ElementRef<'_>, selector: Option<&Selector>, attr: &str) -> Option<String> {
    let element = match selector {
        Some(sel) => card.select(sel).next()?,
        None => *card,
    };
    element
        .value()
        .attr(attr)
        .and_then(|s| text_or_none(s.to_string()))
}

fn resolve_link(base: Option<&Url>, href: String) -> String {
    base.and_then(|b| b.join(&href).ok())
        .map(|u| u.to_string())
        .unwrap_or(href)
}

/// Extracts one raw record per listing card. Cards with neither a title nor a
/// link are skipped; relative links resolve against `page_url`.
pub fn extract_listings(
    html: &str,
    config: &BoardConfig,
    page_url: &str,
) -> Result<Vec<RawJob>, AdapterError> {
    let selectors = CompiledSelectors::new(&config.selectors)?;
    Ok(extract_with(html, config, &selectors, page_url))
}

fn extract_with(
    html: &str,
    config: &BoardConfig,
    selectors: &CompiledSelectors,
    page_url: &str,
) -> Vec<RawJob> {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();
    let mut out = Vec::new();

    for card in document.select(&selectors.card) {
        let title = first_text(&card, selectors.title.as_ref());
        let link = first_attr(&card, selectors.link.as_ref(), &config.selectors.link_attr)
            .map(|href| resolve_link(base.as_ref(), href));
        if title.is_none() && link.is_none() {
            debug!(source_id = %config.source_id, "skipping card without title or link");
            continue;
        }

        let posted = match &config.selectors.posted_attr {
            Some(attr) => first_attr(&card, selectors.posted.as_ref(), attr),
            None => first_text(&card, selectors.posted.as_ref()),
        };

        out.push(RawJob {
            title,
            description: first_text(&card, selectors.description.as_ref()),
            link,
            company: first_text(&card, selectors.company.as_ref()),
            source: None,
            location: first_text(&card, selectors.location.as_ref())
                .or_else(|| config.default_location.clone()),
            timestamp: posted,
        });
    }
    out
}

/// Where an adapter reads its result pages from.
#[derive(Debug, Clone)]
pub enum PageSource {
    Http(Arc<HttpFetcher>),
    /// Directory holding `page-1.html`, `page-2.html`, ...
    Fixtures(PathBuf),
}

#[derive(Debug)]
pub struct HtmlBoardAdapter {
    config: BoardConfig,
    query: String,
    pages: PageSource,
    selectors: CompiledSelectors,
}

impl HtmlBoardAdapter {
    pub fn new(
        config: BoardConfig,
        query: impl Into<String>,
        pages: PageSource,
    ) -> Result<Self, AdapterError> {
        let selectors = CompiledSelectors::new(&config.selectors)?;
        Ok(Self {
            config,
            query: query.into(),
            pages,
            selectors,
        })
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    /// `Ok(None)` once a fixture directory runs out of pages.
    async fn load_page(&self, page_index: u32) -> Result<Option<FetchedPage>, AdapterError> {
        match &self.pages {
            PageSource::Http(http) => {
                let urls = self.config.candidate_urls(&self.query, page_index);
                let page = http.fetch_with_fallbacks(&self.config.source_id, &urls).await?;
                Ok(Some(page))
            }
            PageSource::Fixtures(dir) => {
                let path = dir.join(format!("page-{}.html", page_index + 1));
                match tokio::fs::read_to_string(&path).await {
                    Ok(body) => Ok(Some(FetchedPage {
                        url: self.config.page_url(&self.query, page_index),
                        body,
                    })),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(source) => Err(AdapterError::Io { path, source }),
                }
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlBoardAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    async fn scrape(&self, store: &ListingStore, max_pages: u32) -> Result<(), AdapterError> {
        let source_id = self.config.source_id.as_str();
        let mut loaded_pages = 0u32;
        let mut failed_pages = 0u32;
        let mut inserted = 0usize;

        for page_index in 0..max_pages {
            let page = match self.load_page(page_index).await {
                Ok(Some(page)) => page,
                Ok(None) => {
                    debug!(source_id, page = page_index + 1, "no more pages");
                    break;
                }
                Err(err) => {
                    warn!(source_id, page = page_index + 1, error = %err, "skipping page");
                    failed_pages += 1;
                    continue;
                }
            };
            loaded_pages += 1;

            let raws = extract_with(&page.body, &self.config, &self.selectors, &page.url);
            if raws.is_empty() {
                info!(source_id, page = page_index + 1, "page had no listings; stopping");
                break;
            }

            let found = raws.len();
            for raw in raws {
                let job = normalize(raw.with_default_source(source_id));
                if store.insert_if_absent(&job).await? {
                    inserted += 1;
                }
            }
            info!(source_id, page = page_index + 1, found, "page scraped");
        }

        if loaded_pages == 0 && failed_pages > 0 {
            return Err(AdapterError::Unreachable {
                source_id: source_id.to_string(),
                failed_pages,
            });
        }
        info!(source_id, pages = loaded_pages, inserted, "adapter finished");
        Ok(())
    }
}

/// Stand-in for a registry entry whose configuration could not be turned into
/// an adapter. Scraping it always fails with the build error.
#[derive(Debug, Clone)]
pub struct MisconfiguredBoard {
    source_id: String,
    reason: String,
}

impl MisconfiguredBoard {
    pub fn new(source_id: &str, reason: impl Into<String>) -> Self {
        Self {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for MisconfiguredBoard {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn scrape(&self, _store: &ListingStore, _max_pages: u32) -> Result<(), AdapterError> {
        Err(AdapterError::Message(format!(
            "{}: misconfigured board: {}",
            self.source_id, self.reason
        )))
    }
}

/// Builds the adapter for one registry entry. Fixture boards read from
/// `<fixtures_root>/<source_id>/`.
pub fn adapter_for_board(
    config: BoardConfig,
    query: &str,
    http: Arc<HttpFetcher>,
    fixtures_root: &Path,
) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    let pages = match config.mode {
        PageMode::Live => PageSource::Http(http),
        PageMode::Fixture => PageSource::Fixtures(fixtures_root.join(&config.source_id)),
    };
    Ok(Arc::new(HtmlBoardAdapter::new(config, query, pages)?))
}
