//! Single-shot source: one exported file decoded into all rows at once.

use super::{FetchError, Page, PageFetcher};
use crate::record::RawRow;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Decodes the bytes of an exported file into header-keyed rows.
pub trait RowDecoder: Send + Sync {
    /// File extension (without the dot) this decoder understands.
    fn extension(&self) -> &str;

    fn decode(&self, bytes: &[u8]) -> Result<Vec<RawRow>, FetchError>;
}

/// Decoder for a JSON array of objects, one object per row keyed by header.
///
/// Numbers and booleans are stringified; `null` cells are dropped so they
/// read as absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRowsDecoder;

impl RowDecoder for JsonRowsDecoder {
    fn extension(&self) -> &str {
        "json"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<RawRow>, FetchError> {
        let objects: Vec<serde_json::Map<String, Value>> = serde_json::from_slice(bytes)?;

        Ok(objects
            .into_iter()
            .map(|object| {
                let cells: BTreeMap<String, String> = object
                    .into_iter()
                    .filter_map(|(key, value)| {
                        let text = match value {
                            Value::Null => return None,
                            Value::String(s) => s,
                            other => other.to_string(),
                        };
                        Some((key, text))
                    })
                    .collect();
                RawRow::Keyed(cells)
            })
            .collect())
    }
}

enum ExportLocation {
    File(PathBuf),
    /// Wait for the first file with the decoder's extension to land here
    DownloadDir {
        dir: PathBuf,
        wait: Duration,
        poll_interval: Duration,
    },
}

/// Fetcher that yields the whole export as a single, final page.
pub struct ExportFetcher {
    location: ExportLocation,
    decoder: Box<dyn RowDecoder>,
    finished: bool,
}

impl ExportFetcher {
    /// Reads the export at a known path.
    pub fn from_file(path: impl Into<PathBuf>, decoder: Box<dyn RowDecoder>) -> Self {
        Self {
            location: ExportLocation::File(path.into()),
            decoder,
            finished: false,
        }
    }

    /// Waits up to `wait` for a download to appear in `dir`, checking once per second.
    pub fn from_download_dir(
        dir: impl Into<PathBuf>,
        decoder: Box<dyn RowDecoder>,
        wait: Duration,
    ) -> Self {
        Self {
            location: ExportLocation::DownloadDir {
                dir: dir.into(),
                wait,
                poll_interval: Duration::from_secs(1),
            },
            decoder,
            finished: false,
        }
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        if let ExportLocation::DownloadDir { poll_interval, .. } = &mut self.location {
            *poll_interval = interval;
        }
        self
    }

    /// Resolves the file to decode, or `None` when nothing was published.
    async fn locate(&self) -> Result<Option<PathBuf>, FetchError> {
        match &self.location {
            ExportLocation::File(path) => {
                if tokio::fs::try_exists(path).await? {
                    Ok(Some(path.clone()))
                } else {
                    warn!(path = %path.display(), "Export file not found, treating as an empty day");
                    Ok(None)
                }
            }
            ExportLocation::DownloadDir {
                dir,
                wait,
                poll_interval,
            } => {
                let start = Instant::now();
                loop {
                    if let Some(path) = find_download(dir, self.decoder.extension()).await? {
                        info!(path = %path.display(), "Export file downloaded");
                        return Ok(Some(path));
                    }
                    if start.elapsed() >= *wait {
                        warn!(
                            dir = %dir.display(),
                            waited_secs = start.elapsed().as_secs_f64(),
                            "No export appeared in download directory, treating as an empty day"
                        );
                        return Ok(None);
                    }
                    debug!(dir = %dir.display(), "Waiting for export download");
                    tokio::time::sleep(*poll_interval).await;
                }
            }
        }
    }
}

/// Most recently modified file in `dir` carrying `extension`.
///
/// Older exports left behind by earlier runs must not be ingested as today's.
async fn find_download(dir: &Path, extension: &str) -> Result<Option<PathBuf>, FetchError> {
    if !tokio::fs::try_exists(dir).await? {
        return Ok(None);
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some(extension) {
            continue;
        }

        let modified = entry.metadata().await?.modified()?;
        let candidate = (modified, path);
        if newest.as_ref().map_or(true, |current| candidate > *current) {
            newest = Some(candidate);
        }
    }

    if let Some((_, path)) = &newest {
        debug!(path = %path.display(), "Picked newest download");
    }
    Ok(newest.map(|(_, path)| path))
}

#[async_trait]
impl PageFetcher for ExportFetcher {
    async fn next_page(&mut self) -> Result<Page, FetchError> {
        if self.finished {
            return Ok(Page::empty());
        }
        self.finished = true;

        let Some(path) = self.locate().await? else {
            return Ok(Page::empty());
        };

        let bytes = tokio::fs::read(&path).await?;
        let rows = self.decoder.decode(&bytes)?;
        info!(path = %path.display(), rows = rows.len(), "Decoded export file");

        Ok(Page::last(rows))
    }
}
