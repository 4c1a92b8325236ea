//! Page sources yielding raw schedule rows.
//!
//! A source is drained by calling [`PageFetcher::next_page`] until a page
//! comes back with `done` set. Two realizations exist:
//! - [`ListingFetcher`] walks the paginated HTML listing
//! - [`ExportFetcher`] decodes one exported file in a single page

mod error;
mod export;
mod listing;

pub use error::FetchError;
pub use export::{ExportFetcher, JsonRowsDecoder, RowDecoder};
pub use listing::{ListingConfig, ListingFetcher};

use crate::record::RawRow;
use async_trait::async_trait;

/// One batch of raw rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub rows: Vec<RawRow>,
    /// No further pages follow this one
    pub done: bool,
}

impl Page {
    pub fn last(rows: Vec<RawRow>) -> Self {
        Self { rows, done: true }
    }

    pub fn more(rows: Vec<RawRow>) -> Self {
        Self { rows, done: false }
    }

    /// A day with nothing published.
    pub fn empty() -> Self {
        Self::last(Vec::new())
    }
}

/// Abstraction over "give me the next page of raw rows".
#[async_trait]
pub trait PageFetcher: Send {
    /// Fetches the next page.
    ///
    /// Once a page with `done == true` has been returned the fetcher must not
    /// be polled again.
    async fn next_page(&mut self) -> Result<Page, FetchError>;
}

#[async_trait]
impl<F: PageFetcher + ?Sized> PageFetcher for Box<F> {
    async fn next_page(&mut self) -> Result<Page, FetchError> {
        (**self).next_page().await
    }
}
