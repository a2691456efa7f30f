//! Block - one bounded time window of feeds
//!
//! A block owns a chunk chain and the three indexes, and moves through a
//! two-state lifecycle:
//!
//! - **Hot**: writable, everything resident in memory, backed incrementally
//!   by the chunk log. A fresh block starts Hot; so does a reopened block
//!   directory without an archive marker.
//! - **Cold**: archived to disk (`archive.json` + encoded indexes), memory
//!   released. Queries transparently reload a cold block and a background
//!   reconciliation tick evicts it again after an inactivity window.
//!
//! Write path: embed → intake queue → writer pool → durable chunk append →
//! index update. Query path: label filters ∩ semantic filter → primary-index
//! resolution → time window → ranked retrieval.

mod query;
mod writer;

pub use query::{FilterResult, QueryOptions, ScoredFeed};

use crate::embedding::Embedder;
use crate::index::{read_guard, IndexSet, InvertedIndex, PrimaryIndex, VectorIndex};
use crate::storage::chunk::ChunkFile;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{now_nanos, FeedRecord, FeedRef, TimeRange};
use futures_util::future::join_all;
use query::TopK;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::time::{interval, Duration};
use writer::writer_loop;

/// Configuration for one block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// Soft size limit per chunk before the head is rotated (default: 16MB)
    pub chunk_size_limit: u64,
    /// Maximum records per committed batch (default: 64)
    pub max_batch_size: usize,
    /// Maximum time a writer waits to fill a batch, in ms (default: 2000)
    pub flush_interval_ms: u64,
    /// Writer task count; 0 derives from available parallelism
    pub writer_count: usize,
    /// Idle time before a cold-loaded block is evicted (default: 30 min)
    pub inactivity_window_secs: u64,
    /// Reconciliation tick interval (default: 60s)
    pub reconcile_interval_secs: u64,
    /// Heartbeat tick interval (default: 30s)
    pub heartbeat_interval_secs: u64,
    /// Timeout for one embedding call (default: 30s)
    pub embed_timeout_ms: u64,
    /// Label keys whose values are embedded when a record carries no vectors
    pub embed_label_keys: Vec<String>,
    /// Commit attempts before a batch is dropped (default: 3)
    pub append_retry_limit: u32,
    /// Base backoff between commit attempts (default: 200ms)
    pub retry_backoff_ms: u64,
    /// Similarity threshold when a query does not set one
    pub default_threshold: f32,
    /// Result limit when a query does not set one
    pub default_limit: usize,
    /// Hard cap on any query's result limit
    pub max_limit: usize,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            chunk_size_limit: 16 * 1024 * 1024,
            max_batch_size: 64,
            flush_interval_ms: 2000,
            writer_count: 0,
            inactivity_window_secs: 30 * 60,
            reconcile_interval_secs: 60,
            heartbeat_interval_secs: 30,
            embed_timeout_ms: 30_000,
            embed_label_keys: vec!["title".to_string(), "content".to_string()],
            append_retry_limit: 3,
            retry_backoff_ms: 200,
            default_threshold: 0.55,
            default_limit: 20,
            max_limit: 200,
        }
    }
}

/// Durable block metadata, written once at creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Window start, Unix nanoseconds
    pub start: i64,
    /// Window duration, nanoseconds
    pub duration: i64,
    /// Name of the embedding model the block's vectors came from
    pub embedding_model: String,
}

/// Archive marker; its presence on disk is what makes a block Cold
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchiveMarker {
    feed_count: u64,
}

/// Externally visible lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Hot,
    Cold,
}

/// Point-in-time block statistics
#[derive(Debug, Clone)]
pub struct BlockStats {
    pub state: BlockState,
    pub loaded: bool,
    pub feed_count: u64,
    pub chunk_count: usize,
    pub disk_bytes: u64,
}

/// Mutable block state behind the block-level lock
///
/// `loaded` is the memory-residency flag layered on Cold; it is all-or-
/// nothing and only ever flips with the write lock held. The index set is
/// swapped as one `Arc` so readers never see a torn mix.
pub(crate) struct BlockInner {
    pub(crate) state: BlockState,
    pub(crate) loaded: bool,
    pub(crate) chunks: Vec<Arc<ChunkFile>>,
    pub(crate) indexes: Option<Arc<IndexSet>>,
}

/// State shared between the block handle and its background tasks
pub(crate) struct BlockShared {
    pub(crate) config: BlockConfig,
    pub(crate) dir: PathBuf,
    pub(crate) meta: BlockMeta,
    pub(crate) embedder: Arc<dyn Embedder>,
    pub(crate) inner: AsyncRwLock<BlockInner>,
    /// Intake sender; taken on close so writers can drain and exit
    pub(crate) intake: Mutex<Option<mpsc::UnboundedSender<FeedRecord>>>,
    /// Single shared receiver the writer pool takes turns draining
    pub(crate) intake_rx: AsyncMutex<mpsc::UnboundedReceiver<FeedRecord>>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) ready: watch::Sender<bool>,
    /// Last read/write touch, Unix milliseconds; drives cold eviction
    pub(crate) last_touch: AtomicI64,
}

impl BlockShared {
    pub(crate) fn chunk_dir(&self) -> PathBuf {
        self.dir.join("chunk")
    }

    pub(crate) fn index_dir(&self) -> PathBuf {
        self.dir.join("index")
    }

    pub(crate) fn touch(&self) {
        self.last_touch.store(now_millis(), Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let idle_ms = now_millis().saturating_sub(self.last_touch.load(Ordering::Relaxed));
        Duration::from_millis(idle_ms.max(0) as u64)
    }
}

fn now_millis() -> i64 {
    now_nanos() / 1_000_000
}

/// One time-windowed feed block
pub struct Block {
    shared: Arc<BlockShared>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("dir", &self.shared.dir)
            .finish_non_exhaustive()
    }
}

impl Block {
    /// Open or create a block directory
    ///
    /// `start` and `duration` (nanoseconds) only matter for a new block;
    /// an existing directory keeps its persisted metadata. A reconstructed
    /// block is Hot unless the archive marker exists, in which case it is
    /// Cold and loads lazily on first access.
    pub fn open(
        dir: impl AsRef<Path>,
        start: i64,
        duration: i64,
        config: BlockConfig,
        embedder: Arc<dyn Embedder>,
    ) -> StorageResult<Self> {
        if duration <= 0 {
            return Err(StorageError::Validation(
                "block duration must be positive".to_string(),
            ));
        }

        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(dir.join("chunk"))?;
        std::fs::create_dir_all(dir.join("index"))?;

        let meta_path = dir.join("metadata.json");
        let meta = if meta_path.exists() {
            let meta: BlockMeta = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
            // A damaged sidecar must fail the open, not panic at first query
            if meta.duration <= 0 {
                return Err(StorageError::Corruption(format!(
                    "block metadata with non-positive duration {}: {}",
                    meta.duration,
                    meta_path.display()
                )));
            }
            if meta.embedding_model != embedder.model_name() {
                tracing::warn!(
                    stored = %meta.embedding_model,
                    current = embedder.model_name(),
                    "embedding model changed since block was written"
                );
            }
            meta
        } else {
            let meta = BlockMeta {
                start,
                duration,
                embedding_model: embedder.model_name().to_string(),
            };
            std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)?;
            meta
        };

        let archived = dir.join("archive.json").exists();
        let inner = if archived {
            BlockInner {
                state: BlockState::Cold,
                loaded: false,
                chunks: Vec::new(),
                indexes: None,
            }
        } else {
            let chunk_dir = dir.join("chunk");
            let mut chunks = load_chain(&chunk_dir, true)?;
            if chunks.is_empty() {
                chunks.push(Arc::new(ChunkFile::open(
                    chunk_dir.join("0"),
                    0,
                    true,
                    false,
                )?));
            }
            let indexes = replay_chunks(&chunks)?;
            tracing::info!(
                dir = %dir.display(),
                chunks = chunks.len(),
                feeds = read_guard(&indexes.primary).count(),
                "opened hot block"
            );
            BlockInner {
                state: BlockState::Hot,
                loaded: true,
                chunks,
                indexes: Some(Arc::new(indexes)),
            }
        };

        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let (ready, _) = watch::channel(false);

        let shared = Arc::new(BlockShared {
            config,
            dir,
            meta,
            embedder,
            inner: AsyncRwLock::new(inner),
            intake: Mutex::new(Some(intake_tx)),
            intake_rx: AsyncMutex::new(intake_rx),
            shutdown,
            ready,
            last_touch: AtomicI64::new(now_millis()),
        });

        Ok(Self {
            shared,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the writer pool and background ticks, then signal readiness
    ///
    /// Must be called from within a tokio runtime. Idempotent.
    pub fn run(&self) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !tasks.is_empty() {
            return;
        }

        let workers = if self.shared.config.writer_count > 0 {
            self.shared.config.writer_count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        };

        for worker in 0..workers {
            tasks.push(tokio::spawn(writer_loop(self.shared.clone(), worker)));
        }
        tasks.push(tokio::spawn(reconcile_loop(self.shared.clone())));
        tasks.push(tokio::spawn(heartbeat_loop(self.shared.clone())));

        self.shared.ready.send_replace(true);
        tracing::info!(workers, "block running");
    }

    /// Wait until `run` has signalled readiness
    pub async fn wait_ready(&self) {
        let mut rx = self.shared.ready.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Close the intake, drain the writers, and join every task
    ///
    /// Accepted records still sitting in the intake queue are committed
    /// before the writers exit.
    pub async fn close(&self) {
        self.shared
            .intake
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.shared.shutdown.send_replace(true);

        let handles: Vec<_> = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("block task panicked: {}", e);
            }
        }
        tracing::info!(dir = %self.shared.dir.display(), "block closed");
    }

    /// Window start, Unix nanoseconds
    pub fn start(&self) -> i64 {
        self.shared.meta.start
    }

    /// Window end (exclusive), Unix nanoseconds
    pub fn end(&self) -> i64 {
        self.shared.meta.start.saturating_add(self.shared.meta.duration)
    }

    /// The block's time window
    pub fn window(&self) -> TimeRange {
        TimeRange::new(self.start(), self.end())
    }

    /// Current lifecycle state
    pub async fn state(&self) -> BlockState {
        self.shared.inner.read().await.state
    }

    /// Accept records for eventual durable storage
    ///
    /// Hot-only. Records without vectors are embedded first (parallel
    /// fan-out; one record's failure is logged and skipped, all failing
    /// fails the call), then handed to the intake queue. A successful
    /// return means accepted, not yet durable: durability lags by at most
    /// one flush interval.
    pub async fn append(&self, records: Vec<FeedRecord>) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        {
            let inner = self.shared.inner.read().await;
            if inner.state != BlockState::Hot {
                return Err(StorageError::NotWritable("block is cold".to_string()));
            }
        }

        let total = records.len();
        let embedded = join_all(records.into_iter().map(|record| async {
            let id = record.id;
            (id, self.embed_record(record).await)
        }))
        .await;

        let mut ready = Vec::with_capacity(total);
        for (id, result) in embedded {
            match result {
                Ok(record) => ready.push(record),
                Err(e) => tracing::warn!(id, "skipping record, embedding failed: {}", e),
            }
        }
        if ready.is_empty() {
            return Err(StorageError::Embedding(format!(
                "embedding failed for all {} records",
                total
            )));
        }

        {
            let intake = self
                .shared
                .intake
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let sender = intake
                .as_ref()
                .ok_or_else(|| StorageError::NotWritable("block is closed".to_string()))?;
            for record in ready {
                sender.send(record).map_err(|_| {
                    StorageError::NotWritable("intake queue closed".to_string())
                })?;
            }
        }

        self.shared.touch();
        Ok(())
    }

    /// Fill in a record's vectors from the configured embeddable labels
    async fn embed_record(&self, mut record: FeedRecord) -> StorageResult<FeedRecord> {
        if !record.vectors.is_empty() {
            return Ok(record);
        }

        let mut vectors = Vec::new();
        for key in &self.shared.config.embed_label_keys {
            let Some(value) = record.get_label(key).map(str::to_owned) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            vectors.extend(self.embed_text(&value).await?);
        }
        record.vectors = vectors;
        Ok(record)
    }

    /// One embedding call under the configured timeout
    async fn embed_text(&self, text: &str) -> StorageResult<Vec<Vec<f32>>> {
        let timeout = Duration::from_millis(self.shared.config.embed_timeout_ms);
        match tokio::time::timeout(timeout, self.shared.embedder.embed(text)).await {
            Ok(Ok(vectors)) => Ok(vectors),
            Ok(Err(e)) => Err(StorageError::Embedding(e.to_string())),
            Err(_) => Err(StorageError::Embedding("embedding call timed out".to_string())),
        }
    }

    /// Run a query against this block
    ///
    /// Transparently loads a cold block. A single unreadable record or a
    /// stale reference is logged and skipped; it never fails the query.
    pub async fn query(&self, options: QueryOptions) -> StorageResult<Vec<ScoredFeed>> {
        let normalized = options.normalize(&self.shared.config, self.window())?;
        self.ensure_loaded().await?;
        self.shared.touch();

        let (chunks, indexes) = {
            let inner = self.shared.inner.read().await;
            let indexes = inner
                .indexes
                .clone()
                .ok_or_else(|| StorageError::Lock("block indexes not resident".to_string()))?;
            (inner.chunks.clone(), indexes)
        };

        // Label pass: AND over every filter, short-circuiting on empty
        let mut label_result = FilterResult::Unrestricted;
        {
            let inverted = read_guard(&indexes.inverted);
            for filter in &normalized.filters {
                let ids = inverted.search(filter);
                if ids.is_empty() {
                    label_result = FilterResult::match_nothing();
                    break;
                }
                label_result = label_result.intersect(FilterResult::from_ids(ids));
                if label_result.is_match_nothing() {
                    break;
                }
            }
        }

        // Semantic pass: skipped entirely without query text
        let vector_result = match &normalized.query {
            Some(text) if !label_result.is_match_nothing() => {
                let query_vectors = self.embed_text(text).await?;
                let vector_index = read_guard(&indexes.vector);
                let mut merged: HashMap<u64, f32> = HashMap::new();
                for query_vector in &query_vectors {
                    let hits =
                        vector_index.search(query_vector, normalized.threshold, normalized.limit);
                    for (id, score) in hits {
                        merged
                            .entry(id)
                            .and_modify(|s| *s = s.max(score))
                            .or_insert(score);
                    }
                }
                FilterResult::Matched(merged)
            }
            _ => FilterResult::Unrestricted,
        };

        let candidates: HashMap<u64, f32> = match label_result.intersect(vector_result) {
            FilterResult::Matched(map) => map,
            FilterResult::Unrestricted => read_guard(&indexes.primary)
                .ids()
                .into_iter()
                .map(|id| (id, 1.0))
                .collect(),
        };

        let mut top = TopK::new(normalized.limit);
        {
            let primary = read_guard(&indexes.primary);
            for (id, score) in candidates {
                let Some(feed_ref) = primary.search(id) else {
                    // A filter index knows an id the primary index lost:
                    // that is a bug signal, not a query failure
                    tracing::warn!(id, "filter hit missing from primary index");
                    continue;
                };
                if !normalized.range.contains(feed_ref.time) {
                    continue;
                }
                let chunk = chunks
                    .get(feed_ref.chunk as usize)
                    .filter(|c| c.id() == feed_ref.chunk);
                let Some(chunk) = chunk else {
                    tracing::warn!(id, chunk = feed_ref.chunk, "stale reference to missing chunk");
                    continue;
                };
                match chunk.read(feed_ref.offset) {
                    Ok(record) => top.push(ScoredFeed { record, score }),
                    Err(e) => {
                        tracing::warn!(
                            id,
                            chunk = feed_ref.chunk,
                            offset = feed_ref.offset,
                            "skipping unreadable record: {}",
                            e
                        );
                    }
                }
            }
        }

        Ok(top.into_ranked())
    }

    /// Check whether an id exists in this block, ignoring the time window
    pub async fn exists(&self, id: u64) -> StorageResult<bool> {
        self.ensure_loaded().await?;
        self.shared.touch();

        let inner = self.shared.inner.read().await;
        let indexes = inner
            .indexes
            .clone()
            .ok_or_else(|| StorageError::Lock("block indexes not resident".to_string()))?;
        let exists = read_guard(&indexes.primary).search(id).is_some();
        Ok(exists)
    }

    /// Archive the block: flush indexes, mark, release memory, go Cold
    ///
    /// Idempotent; archiving a Cold block is a no-op.
    pub async fn transform_to_cold(&self) -> StorageResult<()> {
        let mut inner = self.shared.inner.write().await;
        if inner.state == BlockState::Cold {
            return Ok(());
        }

        for chunk in &inner.chunks {
            chunk.ensure_readonly()?;
        }

        let indexes = inner
            .indexes
            .clone()
            .ok_or_else(|| StorageError::Lock("block indexes not resident".to_string()))?;
        let feed_count = read_guard(&indexes.primary).count() as u64;
        write_index_archives(&self.shared.index_dir(), &indexes)?;

        let marker = ArchiveMarker { feed_count };
        std::fs::write(
            self.shared.dir.join("archive.json"),
            serde_json::to_string_pretty(&marker)?,
        )?;

        inner.chunks = Vec::new();
        inner.indexes = None;
        inner.state = BlockState::Cold;
        inner.loaded = false;

        tracing::info!(
            dir = %self.shared.dir.display(),
            feeds = feed_count,
            "block archived to cold"
        );
        Ok(())
    }

    /// Remove the block's entire on-disk footprint
    pub async fn clear_on_disk(&self) -> StorageResult<()> {
        let mut inner = self.shared.inner.write().await;
        inner.chunks = Vec::new();
        inner.indexes = None;
        inner.loaded = false;
        inner.state = BlockState::Cold;

        if self.shared.dir.exists() {
            std::fs::remove_dir_all(&self.shared.dir)?;
        }
        tracing::info!(dir = %self.shared.dir.display(), "block data removed from disk");
        Ok(())
    }

    /// Point-in-time statistics
    pub async fn stats(&self) -> BlockStats {
        let inner = self.shared.inner.read().await;

        let feed_count = match &inner.indexes {
            Some(indexes) => read_guard(&indexes.primary).count() as u64,
            None => read_archive_marker(&self.shared.dir)
                .map(|marker| marker.feed_count)
                .unwrap_or(0),
        };
        let chunk_count = if inner.loaded {
            inner.chunks.len()
        } else {
            chunk_file_count(&self.shared.chunk_dir())
        };
        let disk_bytes = dir_size(&self.shared.chunk_dir()) + dir_size(&self.shared.index_dir());

        BlockStats {
            state: inner.state,
            loaded: inner.loaded,
            feed_count,
            chunk_count,
            disk_bytes,
        }
    }

    /// Make the block memory-resident, double-checked under the block lock
    ///
    /// Hot blocks are always resident. Cold blocks reconstruct the chain
    /// read-only and either decode the archived indexes or replay chunks.
    async fn ensure_loaded(&self) -> StorageResult<()> {
        {
            let inner = self.shared.inner.read().await;
            if inner.loaded {
                return Ok(());
            }
        }

        let mut inner = self.shared.inner.write().await;
        if inner.loaded {
            return Ok(());
        }

        let chunks = load_chain(&self.shared.chunk_dir(), false)?;
        let indexes = match read_index_archives(&self.shared.index_dir()) {
            Ok(Some(set)) => set,
            Ok(None) => replay_chunks(&chunks)?,
            Err(e) => {
                tracing::warn!("archived indexes unreadable, replaying chunks: {}", e);
                replay_chunks(&chunks)?
            }
        };

        tracing::info!(
            dir = %self.shared.dir.display(),
            chunks = chunks.len(),
            feeds = read_guard(&indexes.primary).count(),
            "cold block loaded into memory"
        );

        inner.chunks = chunks;
        inner.indexes = Some(Arc::new(indexes));
        inner.loaded = true;
        Ok(())
    }
}

/// Open every chunk file in the directory as one contiguous chain
///
/// Ids must run 0..n without gaps; a gap is corruption and aborts recovery.
/// With `writable_head` the last chunk opens read-write, everything else is
/// memory-mapped read-only.
fn load_chain(chunk_dir: &Path, writable_head: bool) -> StorageResult<Vec<Arc<ChunkFile>>> {
    let mut ids = Vec::new();
    if chunk_dir.exists() {
        for entry in std::fs::read_dir(chunk_dir)? {
            let entry = entry?;
            match entry.file_name().to_string_lossy().parse::<u32>() {
                Ok(id) => ids.push(id),
                Err(_) => tracing::warn!(
                    path = %entry.path().display(),
                    "ignoring unexpected file in chunk directory"
                ),
            }
        }
    }
    ids.sort_unstable();

    for (idx, &id) in ids.iter().enumerate() {
        if id != idx as u32 {
            return Err(StorageError::Corruption(format!(
                "gap in chunk chain: expected {}, found {}",
                idx, id
            )));
        }
    }

    let mut chunks = Vec::with_capacity(ids.len());
    let head = ids.len().saturating_sub(1);
    for &id in &ids {
        let readonly = !(writable_head && id as usize == head);
        let chunk = ChunkFile::open(chunk_dir.join(id.to_string()), id, false, readonly)?;
        chunks.push(Arc::new(chunk));
    }
    Ok(chunks)
}

/// Rebuild all three indexes by replaying every chunk's records
fn replay_chunks(chunks: &[Arc<ChunkFile>]) -> StorageResult<IndexSet> {
    let mut primary = PrimaryIndex::new();
    let mut inverted = InvertedIndex::new();
    let mut vector = VectorIndex::new();

    for chunk in chunks {
        let chunk_id = chunk.id();
        chunk.range(|record, offset| {
            primary.add(record.id, FeedRef::new(chunk_id, offset, record.time));
            inverted.add(record.id, &record.labels);
            vector.add(record.id, &record.vectors);
            Ok(())
        })?;
    }

    Ok(IndexSet::with_parts(primary, inverted, vector))
}

fn write_index_archives(index_dir: &Path, indexes: &IndexSet) -> StorageResult<()> {
    std::fs::create_dir_all(index_dir)?;
    write_archive(&index_dir.join("primary"), |w| {
        read_guard(&indexes.primary).encode_to(w)
    })?;
    write_archive(&index_dir.join("inverted"), |w| {
        read_guard(&indexes.inverted).encode_to(w)
    })?;
    write_archive(&index_dir.join("vector"), |w| {
        read_guard(&indexes.vector).encode_to(w)
    })?;
    Ok(())
}

fn write_archive(
    path: &Path,
    encode: impl FnOnce(&mut BufWriter<File>) -> StorageResult<()>,
) -> StorageResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    encode(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Decode the archived index set; `None` when any archive file is missing
fn read_index_archives(index_dir: &Path) -> StorageResult<Option<IndexSet>> {
    let primary_path = index_dir.join("primary");
    let inverted_path = index_dir.join("inverted");
    let vector_path = index_dir.join("vector");
    if !primary_path.exists() || !inverted_path.exists() || !vector_path.exists() {
        return Ok(None);
    }

    let primary = PrimaryIndex::decode_from(&mut BufReader::new(File::open(primary_path)?))?;
    let inverted = InvertedIndex::decode_from(&mut BufReader::new(File::open(inverted_path)?))?;
    let vector = VectorIndex::decode_from(&mut BufReader::new(File::open(vector_path)?))?;
    Ok(Some(IndexSet::with_parts(primary, inverted, vector)))
}

fn read_archive_marker(dir: &Path) -> Option<ArchiveMarker> {
    let content = std::fs::read_to_string(dir.join("archive.json")).ok()?;
    serde_json::from_str(&content).ok()
}

fn chunk_file_count(chunk_dir: &Path) -> usize {
    std::fs::read_dir(chunk_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().parse::<u32>().is_ok())
                .count()
        })
        .unwrap_or(0)
}

fn dir_size(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

/// Evict a cold-loaded block that nothing has touched for the window
async fn maybe_evict(shared: &Arc<BlockShared>) {
    {
        let inner = shared.inner.read().await;
        if inner.state != BlockState::Cold || !inner.loaded {
            return;
        }
    }
    let window = Duration::from_secs(shared.config.inactivity_window_secs);
    if shared.idle_for() < window {
        return;
    }

    let mut inner = shared.inner.write().await;
    if inner.state != BlockState::Cold || !inner.loaded || shared.idle_for() < window {
        return;
    }
    inner.chunks = Vec::new();
    inner.indexes = None;
    inner.loaded = false;
    tracing::info!(dir = %shared.dir.display(), "evicted idle cold block from memory");
}

async fn reconcile_loop(shared: Arc<BlockShared>) {
    let mut ticker = interval(Duration::from_secs(
        shared.config.reconcile_interval_secs.max(1),
    ));
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        // A receiver subscribed after send_replace has the current value
        // marked as seen, so check it directly before waiting
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => maybe_evict(&shared).await,
            _ = shutdown.changed() => break,
        }
    }
}

async fn heartbeat_loop(shared: Arc<BlockShared>) {
    let mut ticker = interval(Duration::from_secs(
        shared.config.heartbeat_interval_secs.max(1),
    ));
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        // Same late-subscribe guard as reconcile_loop
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let inner = shared.inner.read().await;
                let feeds = inner
                    .indexes
                    .as_ref()
                    .map(|set| read_guard(&set.primary).count())
                    .unwrap_or(0);
                tracing::debug!(
                    state = ?inner.state,
                    loaded = inner.loaded,
                    chunks = inner.chunks.len(),
                    feeds,
                    "block heartbeat"
                );
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::{FailingEmbedder, StubEmbedder};
    use crate::index::LabelFilter;
    use tempfile::tempdir;

    const HOUR: i64 = 3600 * 1_000_000_000;

    /// Route block logs through the test harness; `RUST_LOG` filters them
    fn init_logs() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn test_config() -> BlockConfig {
        BlockConfig {
            flush_interval_ms: 20,
            writer_count: 2,
            ..BlockConfig::default()
        }
    }

    fn open_block(dir: &Path) -> Block {
        init_logs();
        let block = Block::open(
            dir,
            0,
            HOUR,
            test_config(),
            Arc::new(StubEmbedder::new(8)),
        )
        .unwrap();
        block.run();
        block
    }

    async fn wait_for_feeds(block: &Block, expected: u64) {
        for _ in 0..200 {
            if block.stats().await.feed_count >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {} feeds, have {}",
            expected,
            block.stats().await.feed_count
        );
    }

    fn sample_records() -> Vec<FeedRecord> {
        vec![
            FeedRecord::with_time(1, 1_000)
                .label("source", "hn")
                .label("title", "rust memory model"),
            FeedRecord::with_time(2, 2_000)
                .label("source", "hn")
                .label("title", "async runtimes compared"),
            FeedRecord::with_time(3, 3_000)
                .label("source", "rss")
                .label("title", "garden watering tips"),
        ]
    }

    #[tokio::test]
    async fn test_fresh_block_is_hot() {
        let dir = tempdir().unwrap();
        let block = open_block(dir.path());

        block.wait_ready().await;
        assert_eq!(block.state().await, BlockState::Hot);
        assert_eq!(block.start(), 0);
        assert_eq!(block.end(), HOUR);

        block.close().await;
    }

    #[tokio::test]
    async fn test_append_and_query_by_label() {
        let dir = tempdir().unwrap();
        let block = open_block(dir.path());

        block.append(sample_records()).await.unwrap();
        wait_for_feeds(&block, 3).await;

        let hits = block
            .query(QueryOptions::new().filter(LabelFilter::equals("source", "hn")))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        // Equal scores rank by recency
        assert_eq!(hits[0].record.id, 2);
        assert_eq!(hits[1].record.id, 1);

        let misses = block
            .query(QueryOptions::new().filter(LabelFilter::equals("source", "atom")))
            .await
            .unwrap();
        assert!(misses.is_empty());

        block.close().await;
    }

    #[tokio::test]
    async fn test_semantic_query() {
        let dir = tempdir().unwrap();
        let block = open_block(dir.path());

        block.append(sample_records()).await.unwrap();
        wait_for_feeds(&block, 3).await;

        // The stub embedder is deterministic, so querying with a stored
        // title scores that record at exactly 1.0
        let hits = block
            .query(
                QueryOptions::new()
                    .semantic("rust memory model")
                    .threshold(0.99),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, 1);
        assert!(hits[0].score > 0.99);

        block.close().await;
    }

    #[tokio::test]
    async fn test_query_time_window() {
        let dir = tempdir().unwrap();
        let block = open_block(dir.path());

        block.append(sample_records()).await.unwrap();
        wait_for_feeds(&block, 3).await;

        let hits = block
            .query(QueryOptions::new().range(TimeRange::new(1_500, 2_500)))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, 2);

        block.close().await;
    }

    #[tokio::test]
    async fn test_exists() {
        let dir = tempdir().unwrap();
        let block = open_block(dir.path());

        block.append(sample_records()).await.unwrap();
        wait_for_feeds(&block, 3).await;

        assert!(block.exists(1).await.unwrap());
        assert!(!block.exists(99).await.unwrap());

        block.close().await;
    }

    #[tokio::test]
    async fn test_archive_and_transparent_reload() {
        let dir = tempdir().unwrap();
        let block = open_block(dir.path());

        block.append(sample_records()).await.unwrap();
        wait_for_feeds(&block, 3).await;
        block.close().await;

        block.transform_to_cold().await.unwrap();
        assert_eq!(block.state().await, BlockState::Cold);
        assert!(dir.path().join("archive.json").exists());
        assert!(dir.path().join("index").join("primary").exists());

        // Query transparently reloads; results match the hot ones
        let hits = block
            .query(QueryOptions::new().filter(LabelFilter::equals("source", "hn")))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.id, 2);
        assert_eq!(block.state().await, BlockState::Cold);
        assert!(block.stats().await.loaded);
    }

    #[tokio::test]
    async fn test_cold_block_rejects_appends() {
        let dir = tempdir().unwrap();
        let block = open_block(dir.path());
        block.close().await;

        block.transform_to_cold().await.unwrap();
        let err = block.append(sample_records()).await.unwrap_err();
        assert!(matches!(err, StorageError::NotWritable(_)));
    }

    #[tokio::test]
    async fn test_reopen_from_archive_is_cold() {
        let dir = tempdir().unwrap();
        {
            let block = open_block(dir.path());
            block.append(sample_records()).await.unwrap();
            wait_for_feeds(&block, 3).await;
            block.close().await;
            block.transform_to_cold().await.unwrap();
        }

        let block = open_block(dir.path());
        assert_eq!(block.state().await, BlockState::Cold);

        let hits = block.query(QueryOptions::new()).await.unwrap();
        assert_eq!(hits.len(), 3);
        block.close().await;
    }

    #[tokio::test]
    async fn test_reopen_without_archive_is_hot_and_replays() {
        let dir = tempdir().unwrap();
        {
            let block = open_block(dir.path());
            block.append(sample_records()).await.unwrap();
            wait_for_feeds(&block, 3).await;
            block.close().await;
        }

        let block = open_block(dir.path());
        assert_eq!(block.state().await, BlockState::Hot);
        assert_eq!(block.stats().await.feed_count, 3);

        // Still writable after the reopen
        block
            .append(vec![FeedRecord::with_time(4, 4_000).label("source", "hn")])
            .await
            .unwrap();
        wait_for_feeds(&block, 4).await;
        block.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_id_last_write_wins() {
        let dir = tempdir().unwrap();
        let block = open_block(dir.path());

        block
            .append(vec![FeedRecord::with_time(7, 1_000).label("v", "old")])
            .await
            .unwrap();
        wait_for_feeds(&block, 1).await;
        block
            .append(vec![FeedRecord::with_time(7, 2_000).label("v", "new")])
            .await
            .unwrap();

        // The index overwrites; old bytes stay orphaned in the log
        for _ in 0..200 {
            let hits = block.query(QueryOptions::new()).await.unwrap();
            if hits.len() == 1 && hits[0].record.has_label("v", "new") {
                block.close().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("duplicate id never superseded the first write");
    }

    #[tokio::test]
    async fn test_embedding_failure_isolation() {
        let dir = tempdir().unwrap();
        let block = Block::open(
            dir.path(),
            0,
            HOUR,
            test_config(),
            Arc::new(FailingEmbedder),
        )
        .unwrap();
        block.run();

        // All records need embedding and all fail: the call fails
        let err = block
            .append(vec![FeedRecord::with_time(1, 1_000).label("title", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Embedding(_)));

        // A record with its own vectors skips embedding and proceeds even
        // when its sibling fails
        let records = vec![
            FeedRecord::with_time(2, 2_000).label("title", "fails"),
            FeedRecord::with_time(3, 3_000)
                .label("title", "carries vectors")
                .vector(vec![1.0, 0.0]),
        ];
        block.append(records).await.unwrap();
        wait_for_feeds(&block, 1).await;

        assert!(block.exists(3).await.unwrap());
        assert!(!block.exists(2).await.unwrap());
        block.close().await;
    }

    #[tokio::test]
    async fn test_chunk_rotation() {
        let dir = tempdir().unwrap();
        let config = BlockConfig {
            chunk_size_limit: 256, // force rotation almost immediately
            max_batch_size: 4,     // rotation only happens between batches
            flush_interval_ms: 20,
            writer_count: 2,
            ..BlockConfig::default()
        };
        let block = Block::open(dir.path(), 0, HOUR, config, Arc::new(StubEmbedder::new(8)))
            .unwrap();
        block.run();

        let records: Vec<FeedRecord> = (0..20)
            .map(|i| {
                FeedRecord::with_time(i, 1_000 + i as i64)
                    .label("source", "hn")
                    .vector(vec![1.0, 0.5, 0.25])
            })
            .collect();
        block.append(records).await.unwrap();
        wait_for_feeds(&block, 20).await;

        let stats = block.stats().await;
        assert!(stats.chunk_count > 1, "expected rotation, got {:?}", stats);

        // Every record is still reachable across the chain
        let hits = block
            .query(QueryOptions::new().limit(50))
            .await
            .unwrap();
        assert_eq!(hits.len(), 20);
        block.close().await;
    }

    #[tokio::test]
    async fn test_idle_cold_block_is_evicted() {
        let dir = tempdir().unwrap();
        let config = BlockConfig {
            flush_interval_ms: 20,
            writer_count: 2,
            inactivity_window_secs: 0,
            ..BlockConfig::default()
        };
        init_logs();
        let block = Block::open(dir.path(), 0, HOUR, config, Arc::new(StubEmbedder::new(8)))
            .unwrap();
        block.run();

        block.append(sample_records()).await.unwrap();
        wait_for_feeds(&block, 3).await;
        block.close().await;
        block.transform_to_cold().await.unwrap();

        // A query loads the cold block into memory
        let before = block.query(QueryOptions::new()).await.unwrap();
        assert_eq!(before.len(), 3);
        assert!(block.stats().await.loaded);

        // Zero inactivity window: the next reconciliation pass evicts
        maybe_evict(&block.shared).await;
        let stats = block.stats().await;
        assert_eq!(stats.state, BlockState::Cold);
        assert!(!stats.loaded);
        // Counts survive eviction via the archive marker and the directory
        assert_eq!(stats.feed_count, 3);
        assert_eq!(stats.chunk_count, 1);

        // A later query transparently reloads with identical results
        let after = block.query(QueryOptions::new()).await.unwrap();
        assert_eq!(after.len(), before.len());
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.record, a.record);
        }
        assert!(block.stats().await.loaded);
    }

    #[tokio::test]
    async fn test_close_drains_pending_appends() {
        let dir = tempdir().unwrap();
        {
            let block = open_block(dir.path());
            block.append(sample_records()).await.unwrap();
            // No wait: close must commit whatever is still queued
            block.close().await;
        }

        let block = open_block(dir.path());
        assert_eq!(block.stats().await.feed_count, 3);
        block.close().await;
    }

    #[test]
    fn test_damaged_metadata_duration_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("metadata.json"),
            r#"{"start":0,"duration":0,"embedding_model":"stub"}"#,
        )
        .unwrap();

        let err = Block::open(
            dir.path(),
            0,
            HOUR,
            test_config(),
            Arc::new(StubEmbedder::new(8)),
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_without_trailing_backoff() {
        let dir = tempdir().unwrap();
        let config = BlockConfig {
            flush_interval_ms: 20,
            writer_count: 1,
            append_retry_limit: 3,
            retry_backoff_ms: 300,
            ..BlockConfig::default()
        };
        init_logs();
        let block = Block::open(dir.path(), 0, HOUR, config, Arc::new(StubEmbedder::new(8)))
            .unwrap();
        block.run();

        // Seal the head underneath the writer so every commit fails
        {
            let inner = block.shared.inner.read().await;
            inner.chunks.last().unwrap().ensure_readonly().unwrap();
        }

        block
            .append(vec![FeedRecord::with_time(1, 1_000).vector(vec![1.0, 0.0])])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Three attempts sleep twice between them (300ms + 600ms), with no
        // backoff trailing the final failure before the batch drops
        let started = std::time::Instant::now();
        block.close().await;
        assert!(
            started.elapsed() < Duration::from_millis(1_500),
            "close blocked {:?} on a trailing backoff",
            started.elapsed()
        );

        assert_eq!(block.stats().await.feed_count, 0);
    }

    #[tokio::test]
    async fn test_end_to_end_archive_matches_hot() {
        let dir = tempdir().unwrap();
        let block = open_block(dir.path());

        block.append(sample_records()).await.unwrap();
        wait_for_feeds(&block, 3).await;

        let options = || {
            QueryOptions::new()
                .range(TimeRange::new(1_000, 4_000))
                .filter(LabelFilter::equals("source", "hn"))
        };
        let hot_hits = block.query(options()).await.unwrap();
        assert_eq!(hot_hits.len(), 2);

        block.close().await;
        block.transform_to_cold().await.unwrap();

        let cold_hits = block.query(options()).await.unwrap();
        assert_eq!(cold_hits.len(), hot_hits.len());
        for (hot, cold) in hot_hits.iter().zip(&cold_hits) {
            assert_eq!(hot.record, cold.record);
        }
    }

    #[tokio::test]
    async fn test_clear_on_disk() {
        let dir = tempdir().unwrap();
        let block_dir = dir.path().join("b0");
        let block = open_block(&block_dir);

        block.append(sample_records()).await.unwrap();
        wait_for_feeds(&block, 3).await;
        block.close().await;

        block.clear_on_disk().await.unwrap();
        assert!(!block_dir.exists());
    }
}
