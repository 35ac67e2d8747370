//! Content-addressed extraction cache.
//!
//! Maps URL → (content hash, extraction payload, page metadata) on
//! disk so unchanged pages never pay for a second LM call, across
//! runs. Layout under the cache root:
//!
//! ```text
//! content_index.json             url -> {content_hash, files, url_hash, last_extracted}
//! extractions/<url_hash>.json    one ExtractionPayload per page
//! metadata/<url_hash>_meta.json  one PageMetadata per page
//! ```
//!
//! The in-memory index is owned by one pipeline instance at a time;
//! there is no cross-process locking. The index file is rewritten
//! atomically (sibling temp file, fsync, rename) and a malformed index
//! is rebuilt from the per-page files.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{CacheError, CacheResult};
use crate::types::page::{hash_content, ExtractionPayload, PageMetadata};

/// Name of the index file inside the cache root.
pub const INDEX_FILE: &str = "content_index.json";

/// Default cache root directory name.
pub const DEFAULT_CACHE_DIR: &str = "extracted-docs";

const URL_HASH_LEN: usize = 12;

/// One index record, keyed by URL in `content_index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    /// SHA-256 of the cleaned content the extraction was made from
    pub content_hash: String,

    /// Extraction file path, relative to the cache root
    pub extraction_file: String,

    /// Metadata file path, relative to the cache root
    pub metadata_file: String,

    /// Filename stem: 12 hex chars of SHA-256(url), plus a `-N`
    /// suffix on collision
    pub url_hash: String,

    /// When the page was last extracted (ISO-8601 UTC)
    pub last_extracted: String,
}

/// Outcome of a cache lookup for a freshly crawled page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    /// URL present and content hash unchanged; serve from cache
    Hit,

    /// Extraction required
    Miss(MissReason),
}

/// Why a page missed the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// URL was never extracted
    NewUrl,

    /// URL known but the cleaned content changed
    ContentChanged,
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// URLs in the index
    pub total_urls: usize,

    /// Extraction files on disk
    pub extraction_files: usize,

    /// Metadata files on disk
    pub metadata_files: usize,

    /// Lookups answered from the cache
    pub cache_hits: u64,

    /// Lookups that required extraction
    pub cache_misses: u64,
}

/// Persistent URL → extraction store.
pub struct ContentCache {
    root: PathBuf,
    index: Mutex<BTreeMap<String, IndexEntry>>,
    // Serializes index rewrites so concurrent puts cannot interleave
    // on the temp file.
    flush_lock: tokio::sync::Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// First 12 hex chars of SHA-256(url); the on-disk filename stem.
pub fn url_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(&hasher.finalize()[..URL_HASH_LEN / 2])
}

/// Pick a filename stem for `url`, suffixing `-1`, `-2`, ... when
/// another URL already claimed the same 12-char prefix.
fn allocate_url_hash(index: &BTreeMap<String, IndexEntry>, url: &str) -> String {
    if let Some(existing) = index.get(url) {
        return existing.url_hash.clone();
    }

    let base = url_hash(url);
    let taken = |candidate: &str| index.values().any(|e| e.url_hash == candidate);

    if !taken(&base) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{base}-{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

impl ContentCache {
    /// Open (or create) a cache rooted at `root` and load its index.
    ///
    /// A missing index file is an empty cache; a malformed one is
    /// rebuilt from the per-page files, or truncated to empty when
    /// that is not feasible.
    pub async fn open(root: impl Into<PathBuf>) -> CacheResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("extractions")).await?;
        tokio::fs::create_dir_all(root.join("metadata")).await?;

        let (index, rebuilt) = match Self::load_index(&root).await {
            Ok(index) => (index, false),
            Err(CacheError::Corrupt(reason)) => {
                warn!(reason = %reason, "cache index corrupt, rebuilding from page files");
                (Self::rebuild_index(&root).await, true)
            }
            Err(e) => return Err(e),
        };
        let cache = Self {
            root,
            index: Mutex::new(index),
            flush_lock: tokio::sync::Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };
        if rebuilt {
            cache.persist_index().await?;
        }
        Ok(cache)
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compare a freshly cleaned page against the index.
    pub fn decide(&self, url: &str, cleaned_html: &str) -> CacheDecision {
        let hash = hash_content(cleaned_html);
        let index = self.index.lock().unwrap();
        let decision = match index.get(url) {
            Some(entry) if entry.content_hash == hash => CacheDecision::Hit,
            Some(_) => CacheDecision::Miss(MissReason::ContentChanged),
            None => CacheDecision::Miss(MissReason::NewUrl),
        };
        drop(index);

        match decision {
            CacheDecision::Hit => {
                self.hits.fetch_add(1, Ordering::Relaxed);
            }
            CacheDecision::Miss(reason) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(url = %url, reason = ?reason, "cache miss");
            }
        }
        decision
    }

    /// Read the stored extraction and metadata for a URL.
    ///
    /// Succeeds whenever the last [`decide`](Self::decide) for the URL
    /// returned [`CacheDecision::Hit`]; fails with
    /// [`CacheError::NotCached`] otherwise.
    pub async fn get_cached(&self, url: &str) -> CacheResult<(ExtractionPayload, PageMetadata)> {
        let entry = self
            .index
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| CacheError::NotCached {
                url: url.to_string(),
            })?;

        let payload = self.read_json(&entry.extraction_file, url).await?;
        let metadata = self.read_json(&entry.metadata_file, url).await?;
        Ok((payload, metadata))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        relative: &str,
        url: &str,
    ) -> CacheResult<T> {
        let bytes = match tokio::fs::read(self.root.join(relative)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CacheError::NotCached {
                    url: url.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Store an extraction: page files first, then the index.
    ///
    /// If the index write fails, the page files remain on disk as
    /// orphans until [`reconcile`](Self::reconcile) or a later `put`
    /// restores consistency. Any error here fails the page, not the
    /// run.
    pub async fn put(
        &self,
        url: &str,
        content_hash: &str,
        payload: &ExtractionPayload,
        metadata: &PageMetadata,
    ) -> CacheResult<()> {
        let stem = allocate_url_hash(&self.index.lock().unwrap(), url);
        let extraction_file = format!("extractions/{stem}.json");
        let metadata_file = format!("metadata/{stem}_meta.json");

        tokio::fs::write(
            self.root.join(&extraction_file),
            serde_json::to_vec_pretty(payload)?,
        )
        .await?;
        tokio::fs::write(
            self.root.join(&metadata_file),
            serde_json::to_vec_pretty(metadata)?,
        )
        .await?;

        let entry = IndexEntry {
            content_hash: content_hash.to_string(),
            extraction_file,
            metadata_file,
            url_hash: stem,
            last_extracted: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        self.index.lock().unwrap().insert(url.to_string(), entry);

        self.persist_index().await
    }

    /// Drop index entries whose page files are missing.
    ///
    /// Returns the number of removed entries. Idempotent.
    pub async fn reconcile(&self) -> CacheResult<usize> {
        let snapshot: Vec<(String, IndexEntry)> = self
            .index
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut stale = Vec::new();
        for (url, entry) in snapshot {
            let extraction_ok = tokio::fs::try_exists(self.root.join(&entry.extraction_file))
                .await
                .unwrap_or(false);
            let metadata_ok = tokio::fs::try_exists(self.root.join(&entry.metadata_file))
                .await
                .unwrap_or(false);
            if !extraction_ok || !metadata_ok {
                stale.push(url);
            }
        }

        if stale.is_empty() {
            return Ok(0);
        }

        {
            let mut index = self.index.lock().unwrap();
            for url in &stale {
                index.remove(url);
            }
        }
        warn!(removed = stale.len(), "reconciled cache index");
        self.persist_index().await?;
        Ok(stale.len())
    }

    /// Index size, on-disk file counts, and hit/miss counters.
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            total_urls: self.index.lock().unwrap().len(),
            extraction_files: count_files(&self.root.join("extractions")).await,
            metadata_files: count_files(&self.root.join("metadata")).await,
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Rewrite `content_index.json` atomically.
    async fn persist_index(&self) -> CacheResult<()> {
        let _guard = self.flush_lock.lock().await;

        let json = {
            let index = self.index.lock().unwrap();
            serde_json::to_vec_pretty(&*index)?
        };

        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, self.root.join(INDEX_FILE)).await?;
        Ok(())
    }

    /// Read and parse the index file. A missing file is an empty
    /// index; malformed JSON is [`CacheError::Corrupt`], which
    /// [`open`](Self::open) recovers from by rebuilding.
    async fn load_index(root: &Path) -> CacheResult<BTreeMap<String, IndexEntry>> {
        let path = root.join(INDEX_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes).map_err(|e| CacheError::Corrupt(e.to_string()))
    }

    /// Reconstruct the index from `metadata/` + `extractions/` pairs.
    ///
    /// Metadata records carry the content hash, so a full rebuild only
    /// loses pages whose files are themselves unreadable.
    async fn rebuild_index(root: &Path) -> BTreeMap<String, IndexEntry> {
        let mut index = BTreeMap::new();

        let mut dir = match tokio::fs::read_dir(root.join("metadata")).await {
            Ok(dir) => dir,
            Err(_) => return index,
        };

        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix("_meta.json") else {
                continue;
            };

            let metadata: PageMetadata = match tokio::fs::read(entry.path())
                .await
                .ok()
                .and_then(|b| serde_json::from_slice(&b).ok())
            {
                Some(m) => m,
                None => continue,
            };

            let extraction_file = format!("extractions/{stem}.json");
            let payload: ExtractionPayload = match tokio::fs::read(root.join(&extraction_file))
                .await
                .ok()
                .and_then(|b| serde_json::from_slice(&b).ok())
            {
                Some(p) => p,
                None => continue,
            };

            index.insert(
                metadata.url.clone(),
                IndexEntry {
                    content_hash: metadata.content_hash.clone(),
                    extraction_file,
                    metadata_file: format!("metadata/{stem}_meta.json"),
                    url_hash: stem.to_string(),
                    last_extracted: payload
                        .extraction_timestamp
                        .to_rfc3339_opts(SecondsFormat::Secs, true),
                },
            );
        }

        info!(entries = index.len(), "rebuilt cache index");
        index
    }
}

async fn count_files(dir: &Path) -> usize {
    let mut count = 0;
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(_)) = entries.next_entry().await {
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn payload_for(url: &str) -> ExtractionPayload {
        ExtractionPayload::new(url, vec!["## Section".to_string()])
    }

    fn metadata_for(url: &str, content: &str) -> PageMetadata {
        PageMetadata {
            url: url.to_string(),
            title: "Title".to_string(),
            depth: 0,
            included: true,
            decision_explanation: String::new(),
            content_hash: hash_content(content),
            crawl_timestamp: Utc::now(),
        }
    }

    async fn put_page(cache: &ContentCache, url: &str, content: &str) {
        cache
            .put(
                url,
                &hash_content(content),
                &payload_for(url),
                &metadata_for(url, content),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_decide_miss_then_hit() {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::open(dir.path()).await.unwrap();

        let url = "https://example.test/docs";
        assert_eq!(
            cache.decide(url, "# Docs"),
            CacheDecision::Miss(MissReason::NewUrl)
        );

        put_page(&cache, url, "# Docs").await;
        assert_eq!(cache.decide(url, "# Docs"), CacheDecision::Hit);
        assert_eq!(
            cache.decide(url, "# Docs changed"),
            CacheDecision::Miss(MissReason::ContentChanged)
        );

        let stats = cache.stats().await;
        assert_eq!(stats.total_urls, 1);
        assert_eq!(stats.extraction_files, 1);
        assert_eq!(stats.metadata_files, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 2);
    }

    #[tokio::test]
    async fn test_get_cached_after_put() {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::open(dir.path()).await.unwrap();
        let url = "https://example.test/docs";

        assert!(matches!(
            cache.get_cached(url).await,
            Err(CacheError::NotCached { .. })
        ));

        put_page(&cache, url, "# Docs").await;
        let (payload, metadata) = cache.get_cached(url).await.unwrap();
        assert_eq!(payload.url, url);
        assert_eq!(metadata.content_hash, hash_content("# Docs"));
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let url = "https://example.test/docs";

        {
            let cache = ContentCache::open(dir.path()).await.unwrap();
            put_page(&cache, url, "# Docs").await;
        }

        let cache = ContentCache::open(dir.path()).await.unwrap();
        assert_eq!(cache.decide(url, "# Docs"), CacheDecision::Hit);
    }

    #[tokio::test]
    async fn test_malformed_index_is_a_corrupt_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), "{not json").unwrap();

        let err = ContentCache::load_index(dir.path()).await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_corrupt_index_rebuilds_from_files() {
        let dir = TempDir::new().unwrap();
        let url = "https://example.test/docs";

        {
            let cache = ContentCache::open(dir.path()).await.unwrap();
            put_page(&cache, url, "# Docs").await;
        }

        std::fs::write(dir.path().join(INDEX_FILE), "{not json").unwrap();

        let cache = ContentCache::open(dir.path()).await.unwrap();
        assert_eq!(cache.decide(url, "# Docs"), CacheDecision::Hit);
        let (payload, _) = cache.get_cached(url).await.unwrap();
        assert_eq!(payload.url, url);
    }

    #[tokio::test]
    async fn test_reconcile_drops_stale_entries_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::open(dir.path()).await.unwrap();
        put_page(&cache, "https://example.test/a", "A").await;
        put_page(&cache, "https://example.test/b", "B").await;

        // Orphan one entry by deleting its extraction file.
        let stem = url_hash("https://example.test/a");
        std::fs::remove_file(dir.path().join(format!("extractions/{stem}.json"))).unwrap();

        assert_eq!(cache.reconcile().await.unwrap(), 1);
        assert_eq!(cache.reconcile().await.unwrap(), 0);
        assert_eq!(
            cache.decide("https://example.test/a", "A"),
            CacheDecision::Miss(MissReason::NewUrl)
        );
        assert_eq!(cache.decide("https://example.test/b", "B"), CacheDecision::Hit);
    }

    #[tokio::test]
    async fn test_put_overwrites_record() {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::open(dir.path()).await.unwrap();
        let url = "https://example.test/docs";

        put_page(&cache, url, "v1").await;
        put_page(&cache, url, "v2").await;

        assert_eq!(cache.decide(url, "v2"), CacheDecision::Hit);
        let stats = cache.stats().await;
        assert_eq!(stats.total_urls, 1);
        // Same url_hash stem is reused, so no orphan files pile up.
        assert_eq!(stats.extraction_files, 1);
    }

    #[test]
    fn test_allocate_url_hash_collision_suffix() {
        let url = "https://example.test/docs";
        let mut index = BTreeMap::new();
        index.insert(
            "https://example.test/other".to_string(),
            IndexEntry {
                content_hash: "x".to_string(),
                extraction_file: "e".to_string(),
                metadata_file: "m".to_string(),
                // Forced collision with `url`'s 12-char prefix.
                url_hash: url_hash(url),
                last_extracted: "2026-01-01T00:00:00Z".to_string(),
            },
        );

        let allocated = allocate_url_hash(&index, url);
        assert_eq!(allocated, format!("{}-1", url_hash(url)));
    }

    #[test]
    fn test_url_hash_shape() {
        let hash = url_hash("https://example.test/docs");
        assert_eq!(hash.len(), 12);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]

        #[test]
        fn prop_url_hash_is_stable_prefix(url in ".*") {
            let a = url_hash(&url);
            let b = url_hash(&url);
            proptest::prop_assert_eq!(&a, &b);
            proptest::prop_assert_eq!(a.len(), URL_HASH_LEN);
        }

        #[test]
        fn prop_put_then_decide_hits(content in ".*") {
            let dir = TempDir::new().unwrap();
            tokio_test::block_on(async {
                let cache = ContentCache::open(dir.path()).await.unwrap();
                let url = "https://example.test/page";
                put_page(&cache, url, &content).await;
                assert_eq!(cache.decide(url, &content), CacheDecision::Hit);
            });
        }
    }
}
