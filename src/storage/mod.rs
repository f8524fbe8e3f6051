//! Durable on-disk capture catalog.
//!
//! Layout: `<storage>/captures/index.json` plus one directory per capture
//! holding `index.html`, `metadata.json`, and the resource buckets. The
//! per-capture metadata is always written before its index entry, so a
//! reader that sees the index entry will find the metadata file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::ResourceDescriptor;

pub mod export;

/// Index format version.
const INDEX_VERSION: &str = "1.0";

/// Default page size for listings.
const DEFAULT_LIMIT: usize = 50;

/// How a capture was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    #[serde(rename = "single-page")]
    SinglePage,
    #[serde(rename = "multi-page")]
    MultiPage,
}

/// Resource counts persisted with a capture.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecordStats {
    pub total_pages: usize,
    pub images: usize,
    pub stylesheets: usize,
    pub scripts: usize,
    pub fonts: usize,
    /// Bytes on disk, computed by walking the capture directory.
    pub total_size: u64,
}

/// Full metadata persisted as `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMetadata {
    pub id: String,
    pub url: String,
    pub title: String,
    pub captured_at: DateTime<Utc>,
    pub capture_mode: CaptureMode,
    pub stats: CaptureRecordStats,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub collections: Vec<String>,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Compact entry mirrored into `index.json` for fast listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSummary {
    pub id: String,
    pub url: String,
    pub title: String,
    pub captured_at: DateTime<Utc>,
    /// Reserved; currently always null.
    pub thumbnail: Option<String>,
    pub size: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub collections: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureIndex {
    version: String,
    captures: Vec<CaptureSummary>,
    collections: Vec<String>,
}

impl Default for CaptureIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION.to_string(),
            captures: Vec::new(),
            collections: Vec::new(),
        }
    }
}

/// Everything needed to persist one capture.
#[derive(Debug)]
pub struct SaveCapture {
    pub url: String,
    pub title: String,
    /// Rewritten HTML for `index.html`.
    pub html: String,
    /// Additional rewritten pages of a multi-page capture: (filename, html).
    pub extra_pages: Vec<(String, String)>,
    pub resources: Vec<ResourceDescriptor>,
    pub capture_mode: CaptureMode,
    /// Resource counts from extraction; `total_size` is computed here.
    pub stats: CaptureRecordStats,
}

/// Listing sort field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    Date,
    Title,
    Size,
}

/// Listing sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filter, sort, and pagination parameters for [`CaptureStore::list_captures`].
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub tag: Option<String>,
    pub collection: Option<String>,
    /// Case-insensitive substring over title, url, and notes.
    pub search: Option<String>,
    pub sort: SortField,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// A page of listing results.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureListing {
    pub total: usize,
    pub captures: Vec<CaptureSummary>,
    pub has_more: bool,
}

/// Fields a caller may change after capture.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataUpdate {
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
    pub notes: Option<String>,
    pub collections: Option<Vec<String>>,
}

/// On-disk capture store with a JSON index.
pub struct CaptureStore {
    captures_dir: PathBuf,
    /// Serializes every read-modify-write of `index.json`.
    index_lock: Mutex<()>,
}

impl CaptureStore {
    #[must_use]
    pub fn new(storage_dir: &Path) -> Self {
        Self {
            captures_dir: storage_dir.join("captures"),
            index_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn captures_dir(&self) -> &Path {
        &self.captures_dir
    }

    fn index_path(&self) -> PathBuf {
        self.captures_dir.join("index.json")
    }

    fn capture_dir(&self, id: &str) -> PathBuf {
        self.captures_dir.join(id)
    }

    /// Create `captures/` and an empty index if missing, and drop index
    /// entries whose directory has disappeared.
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.captures_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create captures directory: {}",
                    self.captures_dir.display()
                )
            })?;

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await;

        let mut kept = Vec::with_capacity(index.captures.len());
        for summary in index.captures {
            if self.capture_dir(&summary.id).is_dir() {
                kept.push(summary);
            } else {
                warn!(id = %summary.id, "Dropping index entry without a directory");
            }
        }
        index.captures = kept;
        index.collections = collection_names(&index.captures);

        self.write_index(&index).await?;
        info!(captures = index.captures.len(), "Capture store initialized");
        Ok(())
    }

    /// Persist a capture. On any failure the half-written directory is
    /// removed and the index left untouched.
    pub async fn save_capture(&self, request: SaveCapture) -> Result<CaptureMetadata> {
        let id = Uuid::new_v4().to_string();
        let dir = self.capture_dir(&id);

        match self.save_capture_inner(&id, &dir, &request).await {
            Ok(metadata) => Ok(metadata),
            Err(e) => {
                if let Err(cleanup_err) = fs::remove_dir_all(&dir).await {
                    if cleanup_err.kind() != std::io::ErrorKind::NotFound {
                        warn!(id = %id, "Failed to remove partial capture: {cleanup_err}");
                    }
                }
                Err(e)
            }
        }
    }

    async fn save_capture_inner(
        &self,
        id: &str,
        dir: &Path,
        request: &SaveCapture,
    ) -> Result<CaptureMetadata> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create capture directory: {}", dir.display()))?;
        for bucket in ["images", "css", "js", "fonts"] {
            fs::create_dir_all(dir.join(bucket))
                .await
                .with_context(|| format!("Failed to create {bucket} bucket"))?;
        }

        fs::write(dir.join("index.html"), &request.html)
            .await
            .context("Failed to write index.html")?;

        for (filename, html) in &request.extra_pages {
            fs::write(dir.join(filename), html)
                .await
                .with_context(|| format!("Failed to write extra page {filename}"))?;
        }

        for resource in &request.resources {
            let target = dir.join(resource.archive_path());
            fs::copy(&resource.local_path, &target)
                .await
                .with_context(|| {
                    format!(
                        "Failed to copy resource {} into archive",
                        resource.local_path.display()
                    )
                })?;
        }

        let mut stats = request.stats;
        stats.total_pages = stats.total_pages.max(1);
        stats.total_size = directory_size(dir).await?;

        let metadata = CaptureMetadata {
            id: id.to_string(),
            url: request.url.clone(),
            title: request.title.clone(),
            captured_at: Utc::now(),
            capture_mode: request.capture_mode,
            stats,
            tags: Vec::new(),
            notes: String::new(),
            collections: Vec::new(),
            status: "completed".to_string(),
            error: None,
        };

        // Metadata first, index last: an index entry implies readable
        // metadata.
        write_json_atomic(&dir.join("metadata.json"), &metadata)
            .await
            .context("Failed to write metadata.json")?;

        {
            let _guard = self.index_lock.lock().await;
            let mut index = self.read_index().await;
            index.captures.push(summary_of(&metadata));
            index.collections = collection_names(&index.captures);
            self.write_index(&index).await?;
        }

        debug!(id = %id, url = %metadata.url, size = metadata.stats.total_size, "Capture saved");
        Ok(metadata)
    }

    /// List captures with filtering, sorting, and pagination.
    pub async fn list_captures(&self, query: &ListQuery) -> Result<CaptureListing> {
        let index = {
            let _guard = self.index_lock.lock().await;
            self.read_index().await
        };

        let mut matches = Vec::new();
        for summary in index.captures {
            if let Some(ref tag) = query.tag {
                if !summary.tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            if let Some(ref collection) = query.collection {
                if !summary.collections.iter().any(|c| c == collection) {
                    continue;
                }
            }
            if let Some(ref search) = query.search {
                if !self.matches_search(&summary, search).await {
                    continue;
                }
            }
            matches.push(summary);
        }

        let total = matches.len();
        sort_summaries(&mut matches, query.sort, query.order);

        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        let page: Vec<CaptureSummary> =
            matches.into_iter().skip(query.offset).take(limit).collect();
        let has_more = query.offset + page.len() < total;

        Ok(CaptureListing {
            total,
            captures: page,
            has_more,
        })
    }

    async fn matches_search(&self, summary: &CaptureSummary, search: &str) -> bool {
        let needle = search.to_lowercase();
        if summary.title.to_lowercase().contains(&needle)
            || summary.url.to_lowercase().contains(&needle)
        {
            return true;
        }
        // Notes live only in metadata.json
        match self.read_metadata(&summary.id).await {
            Ok(metadata) => metadata.notes.to_lowercase().contains(&needle),
            Err(_) => false,
        }
    }

    /// Metadata and directory path of a capture.
    pub async fn get_capture(&self, id: &str) -> Result<(CaptureMetadata, PathBuf)> {
        let metadata = self.read_metadata(id).await?;
        Ok((metadata, self.capture_dir(id)))
    }

    /// Raw bytes of a capture's `index.html`.
    pub async fn get_capture_html(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.capture_dir(id).join("index.html");
        fs::read(&path)
            .await
            .with_context(|| format!("Capture HTML not found: {}", path.display()))
    }

    /// Remove a capture: index entry first, then the directory.
    pub async fn delete_capture(&self, id: &str) -> Result<()> {
        {
            let _guard = self.index_lock.lock().await;
            let mut index = self.read_index().await;
            let before = index.captures.len();
            index.captures.retain(|c| c.id != id);
            if index.captures.len() == before {
                anyhow::bail!("Capture not found: {id}");
            }
            index.collections = collection_names(&index.captures);
            self.write_index(&index).await?;
        }

        let dir = self.capture_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove capture directory: {}", dir.display())
                });
            }
        }

        info!(id, "Capture deleted");
        Ok(())
    }

    /// Apply a partial update to the mutable metadata fields, keeping the
    /// index summary in sync.
    pub async fn update_metadata(
        &self,
        id: &str,
        updates: MetadataUpdate,
    ) -> Result<CaptureMetadata> {
        let mut metadata = self.read_metadata(id).await?;

        if let Some(title) = updates.title {
            metadata.title = title;
        }
        if let Some(tags) = updates.tags {
            metadata.tags = tags;
        }
        if let Some(notes) = updates.notes {
            metadata.notes = notes;
        }
        if let Some(collections) = updates.collections {
            metadata.collections = collections;
        }

        write_json_atomic(&self.capture_dir(id).join("metadata.json"), &metadata)
            .await
            .context("Failed to rewrite metadata.json")?;

        {
            let _guard = self.index_lock.lock().await;
            let mut index = self.read_index().await;
            if let Some(summary) = index.captures.iter_mut().find(|c| c.id == id) {
                summary.title = metadata.title.clone();
                summary.tags = metadata.tags.clone();
                summary.collections = metadata.collections.clone();
            }
            index.collections = collection_names(&index.captures);
            self.write_index(&index).await?;
        }

        Ok(metadata)
    }

    async fn read_metadata(&self, id: &str) -> Result<CaptureMetadata> {
        let path = self.capture_dir(id).join("metadata.json");
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("Capture not found: {id}"))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt metadata: {}", path.display()))
    }

    /// Read the index, recreating an empty shell when absent or corrupt.
    async fn read_index(&self) -> CaptureIndex {
        let path = self.index_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return CaptureIndex::default();
            }
            Err(e) => {
                warn!(path = %path.display(), "Failed to read index, starting empty: {e}");
                return CaptureIndex::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(index) => index,
            Err(e) => {
                warn!(path = %path.display(), "Corrupt index, starting empty: {e}");
                CaptureIndex::default()
            }
        }
    }

    async fn write_index(&self, index: &CaptureIndex) -> Result<()> {
        write_json_atomic(&self.index_path(), index)
            .await
            .context("Failed to write index.json")
    }
}

fn summary_of(metadata: &CaptureMetadata) -> CaptureSummary {
    CaptureSummary {
        id: metadata.id.clone(),
        url: metadata.url.clone(),
        title: metadata.title.clone(),
        captured_at: metadata.captured_at,
        thumbnail: None,
        size: metadata.stats.total_size,
        tags: metadata.tags.clone(),
        collections: metadata.collections.clone(),
    }
}

fn collection_names(captures: &[CaptureSummary]) -> Vec<String> {
    let names: BTreeSet<String> = captures
        .iter()
        .flat_map(|c| c.collections.iter().cloned())
        .collect();
    names.into_iter().collect()
}

fn sort_summaries(summaries: &mut [CaptureSummary], sort: SortField, order: SortOrder) {
    summaries.sort_by(|a, b| {
        let ordering = match sort {
            SortField::Date => a.captured_at.cmp(&b.captured_at),
            SortField::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
            SortField::Size => a.size.cmp(&b.size),
        };
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

/// Total size in bytes of a directory tree.
///
/// Async recursion needs boxing; an explicit stack avoids it.
pub async fn directory_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = fs::read_dir(&current)
            .await
            .with_context(|| format!("Failed to read directory: {}", current.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata().await?.len();
            }
        }
    }

    Ok(total)
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("Failed to create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("Failed to serialize JSON")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to move into place: {}", path.display()))?;
    Ok(())
}
