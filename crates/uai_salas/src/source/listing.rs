//! Paginated HTML listing source.
//!
//! Page 1 is requested first; its pagination controls tell us how many pages
//! follow. Each page's first data table is read row by row into positional
//! rows. Successive requests are spaced by a fixed delay.

use super::{FetchError, Page, PageFetcher};
use crate::record::RawRow;
use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_LISTING_URL: &str = "https://hoy.uai.cl/";

static TABLE_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").unwrap());
static ROW_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static CELL_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static PAGINATION_LINK_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(".pagination a, .pager a, nav[aria-label*='agin'] a").unwrap()
});

/// Configuration for the paginated listing source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    /// Listing URL; the page parameter is appended to it
    pub base_url: String,
    /// Query parameter carrying the 1-based page number
    pub page_param: String,
    /// Minimum spacing between two page requests
    pub request_delay_ms: u64,
    /// Extra attempts for a page after a transient failure
    pub max_retries: u32,
    /// Base delay for retry backoff
    pub retry_base_delay_ms: u64,
    /// Upper bound on the page count read from pagination controls
    pub max_pages: u32,
    pub user_agent: String,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LISTING_URL.to_string(),
            page_param: "page".to_string(),
            request_delay_ms: 1500,
            max_retries: 2,
            retry_base_delay_ms: 500,
            max_pages: 200,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
        }
    }
}

impl ListingConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }
}

/// Rows and pagination info extracted from one listing page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedListing {
    pub rows: Vec<RawRow>,
    /// A data table was present at all
    pub has_table: bool,
    /// Highest page number advertised by the pagination controls
    pub page_count: Option<u32>,
}

/// Fetcher walking the paginated listing.
pub struct ListingFetcher {
    client: Client,
    config: ListingConfig,
    base_url: Url,
    page_number_regex: Regex,
    next_page: u32,
    total_pages: Option<u32>,
    last_request: Option<Instant>,
}

impl ListingFetcher {
    pub fn new(config: ListingConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::Network {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        let base_url = Url::parse(&config.base_url)?;
        let page_number_regex = Regex::new(&format!(
            r"[?&]{}=(\d+)",
            regex::escape(&config.page_param)
        ))
        .map_err(|e| FetchError::Pagination {
            message: e.to_string(),
        })?;

        Ok(Self {
            client,
            config,
            base_url,
            page_number_regex,
            next_page: 1,
            total_pages: None,
            last_request: None,
        })
    }

    /// Builds the URL for a 1-based page number, replacing any page parameter
    /// already present on the base URL.
    fn page_url(&self, page: u32) -> Url {
        let mut url = self.base_url.clone();
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != self.config.page_param.as_str())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair(&self.config.page_param, &page.to_string());
        url
    }

    /// Sleeps until the configured delay since the previous request has passed.
    async fn wait_for_turn(&self) {
        if let Some(last) = self.last_request {
            let delay = self.config.request_delay();
            let elapsed = last.elapsed();
            if elapsed < delay {
                debug!(wait_ms = (delay - elapsed).as_millis() as u64, "Pausing between page requests");
                tokio::time::sleep(delay - elapsed).await;
            }
        }
    }

    /// Fetches a page, retrying transient failures with backoff.
    async fn fetch_with_retry(&self, page: u32) -> Result<String, FetchError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.fetch_page(page).await {
                Ok(html) => return Ok(html),
                Err(e) if e.is_retryable() && attempt <= self.config.max_retries => {
                    let delay = self.retry_delay(attempt);
                    warn!(
                        page = page,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Page fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(FetchError::RetriesExhausted {
                        page,
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_page(&self, page: u32) -> Result<String, FetchError> {
        let url = self.page_url(page);
        debug!(page = page, url = %url, "Requesting listing page");

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus {
                page,
                status: response.status().as_u16(),
            });
        }

        Ok(response.text().await?)
    }

    /// Exponential backoff with jitter, capped at 10 seconds.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay_ms;
        let exponential = base.saturating_mul(2u64.pow(attempt.saturating_sub(1).min(5)));
        let capped = exponential.min(10_000);
        // 0-20% jitter
        let jitter = rand::thread_rng().gen_range(0..=(capped / 5));
        Duration::from_millis(capped + jitter)
    }
}

#[async_trait]
impl PageFetcher for ListingFetcher {
    async fn next_page(&mut self) -> Result<Page, FetchError> {
        let page = self.next_page;
        self.wait_for_turn().await;

        let html = self.fetch_with_retry(page).await;
        self.last_request = Some(Instant::now());
        let listing = parse_listing(&html?, &self.page_number_regex);

        if page == 1 {
            if !listing.has_table {
                info!("Listing has no schedule table, treating as an empty day");
                return Ok(Page::empty());
            }

            let total = listing.page_count.unwrap_or(1);
            if total > self.config.max_pages {
                return Err(FetchError::Pagination {
                    message: format!(
                        "pagination advertises {} pages (limit {})",
                        total, self.config.max_pages
                    ),
                });
            }
            info!(total_pages = total, "Detected listing page count");
            self.total_pages = Some(total);
        }

        let total = self.total_pages.unwrap_or(1);
        self.next_page += 1;

        info!(page = page, total_pages = total, rows = listing.rows.len(), "Fetched listing page");

        if page >= total {
            Ok(Page::last(listing.rows))
        } else {
            Ok(Page::more(listing.rows))
        }
    }
}

/// Extracts data rows and the advertised page count from listing HTML.
///
/// Only the first table that has `<td>` cells is read; header rows (`<th>`
/// only) and rows whose cells are all blank are ignored.
pub fn parse_listing(html: &str, page_number_regex: &Regex) -> ParsedListing {
    let document = Html::parse_document(html);

    let table = document
        .select(&TABLE_SELECTOR)
        .find(|t| t.select(&CELL_SELECTOR).next().is_some());

    let rows: Vec<RawRow> = table
        .map(|t| t.select(&ROW_SELECTOR).filter_map(parse_row).collect())
        .unwrap_or_default();

    let page_count = document
        .select(&PAGINATION_LINK_SELECTOR)
        .filter_map(|link| {
            let from_text = link.text().collect::<String>().trim().parse::<u32>().ok();
            let from_href = link
                .value()
                .attr("href")
                .and_then(|href| page_number_regex.captures(href))
                .and_then(|caps| caps[1].parse::<u32>().ok());
            from_text.max(from_href)
        })
        .max();

    ParsedListing {
        rows,
        has_table: table.is_some(),
        page_count,
    }
}

fn parse_row(row: ElementRef) -> Option<RawRow> {
    let cells: Vec<String> = row
        .select(&CELL_SELECTOR)
        .map(|cell| {
            cell.text()
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();

    if cells.iter().all(|c| c.is_empty()) {
        None
    } else {
        Some(RawRow::Positional(cells))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE_ONE: &str = r#"
        <html><body>
          <table class="eventos">
            <tr><th>Evento</th><th>Tipo</th><th>Inicio</th><th>Fin</th><th>Sala</th></tr>
            <tr><td>Álgebra</td><td>Cátedra</td><td>10:00</td><td>11:20</td><td>B201</td></tr>
            <tr><td>  Cálculo
                  II </td><td>Ayudantía</td><td>11:30</td><td>12:50</td><td></td></tr>
            <tr><td></td><td></td><td></td><td></td><td></td></tr>
          </table>
          <ul class="pagination">
            <li><a href="?page=1">1</a></li>
            <li><a href="?page=2">2</a></li>
            <li><a href="?page=2">Siguiente</a></li>
          </ul>
        </body></html>
    "#;

    const PAGE_TWO: &str = r#"
        <html><body>
          <table>
            <tr><td>Física</td><td>Cátedra</td><td>08:30</td><td>09:50</td><td>A101</td></tr>
          </table>
        </body></html>
    "#;

    fn page_regex() -> Regex {
        Regex::new(r"[?&]page=(\d+)").unwrap()
    }

    fn test_config(base_url: &str) -> ListingConfig {
        ListingConfig {
            base_url: base_url.to_string(),
            request_delay_ms: 5,
            retry_base_delay_ms: 1,
            ..ListingConfig::default()
        }
    }

    #[test]
    fn test_parse_listing_rows_and_pages() {
        let listing = parse_listing(PAGE_ONE, &page_regex());

        assert!(listing.has_table);
        assert_eq!(listing.page_count, Some(2));
        assert_eq!(listing.rows.len(), 2);
        assert_eq!(
            listing.rows[1],
            RawRow::positional(["Cálculo II", "Ayudantía", "11:30", "12:50", ""])
        );
    }

    #[test]
    fn test_parse_listing_without_table() {
        let listing = parse_listing("<html><body><p>Sin eventos</p></body></html>", &page_regex());
        assert!(!listing.has_table);
        assert!(listing.rows.is_empty());
        assert_eq!(listing.page_count, None);
    }

    #[test]
    fn test_page_url_replaces_existing_param() {
        let fetcher = ListingFetcher::new(test_config("https://example.com/eventos?sede=1&page=9")).unwrap();
        let url = fetcher.page_url(3);
        assert_eq!(url.as_str(), "https://example.com/eventos?sede=1&page=3");
    }

    #[test]
    fn test_retry_delay_backoff() {
        let fetcher = ListingFetcher::new(ListingConfig::default()).unwrap();

        let d1 = fetcher.retry_delay(1);
        let d2 = fetcher.retry_delay(2);
        let d3 = fetcher.retry_delay(3);

        // Each should be roughly double (with jitter)
        assert!(d2 > d1);
        assert!(d3 > d2);
        assert!(fetcher.retry_delay(30) <= Duration::from_millis(12_000));
    }

    #[tokio::test]
    async fn test_fetches_all_pages_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE_ONE))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE_TWO))
            .expect(1)
            .mount(&server)
            .await;

        let mut fetcher = ListingFetcher::new(test_config(&server.uri())).unwrap();

        let first = fetcher.next_page().await.unwrap();
        assert!(!first.done);
        assert_eq!(first.rows.len(), 2);

        let second = fetcher.next_page().await.unwrap();
        assert!(second.done);
        assert_eq!(second.rows, vec![RawRow::positional(["Física", "Cátedra", "08:30", "09:50", "A101"])]);
    }

    #[tokio::test]
    async fn test_empty_day_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>No hay eventos</body></html>"))
            .mount(&server)
            .await;

        let mut fetcher = ListingFetcher::new(test_config(&server.uri())).unwrap();
        let page = fetcher.next_page().await.unwrap();
        assert_eq!(page, Page::empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE_TWO))
            .mount(&server)
            .await;

        let mut fetcher = ListingFetcher::new(test_config(&server.uri())).unwrap();
        let page = fetcher.next_page().await.unwrap();
        assert!(page.done);
        assert_eq!(page.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_client_error_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let mut fetcher = ListingFetcher::new(test_config(&server.uri())).unwrap();
        let err = fetcher.next_page().await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { page: 1, status: 404 }));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let mut fetcher = ListingFetcher::new(test_config(&server.uri())).unwrap();
        let err = fetcher.next_page().await.unwrap_err();
        assert!(matches!(err, FetchError::RetriesExhausted { page: 1, attempts: 3, .. }));
    }
}
