//! Writer pool - drains the intake queue into the chunk chain
//!
//! A fixed pool of tasks shares one receiver. Each task takes the receiver
//! long enough to collect a batch (up to the size cap or the flush interval,
//! whichever first), then releases it and commits: rotate the head chunk if
//! it passed the soft size limit, append with one durable write, and update
//! the three indexes from the per-record durability callback. Commit failures
//! retry with linear backoff and are then dropped - the write path stays
//! available and upstream collectors re-observe their sources. On close the
//! queue keeps handing out already-accepted entries until it runs dry, so
//! every worker commits its last batch before exiting.

use crate::block::{BlockShared, BlockState};
use crate::index::write_guard;
use crate::storage::chunk::ChunkFile;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{FeedRecord, FeedRef};
use std::sync::Arc;
use tokio::time::{sleep, timeout_at, Duration, Instant};

pub(crate) async fn writer_loop(shared: Arc<BlockShared>, worker: usize) {
    let flush_interval = Duration::from_millis(shared.config.flush_interval_ms);
    let max_batch = shared.config.max_batch_size.max(1);
    let mut batch: Vec<FeedRecord> = Vec::with_capacity(max_batch);

    loop {
        batch.clear();
        {
            let mut rx = shared.intake_rx.lock().await;
            match rx.recv().await {
                Some(record) => batch.push(record),
                // Channel closed and drained: every accepted entry was
                // already handed to a worker and committed
                None => break,
            }

            // Batch by size or timeout, whichever comes first
            let deadline = Instant::now() + flush_interval;
            while batch.len() < max_batch {
                match timeout_at(deadline, rx.recv()).await {
                    Ok(Some(record)) => batch.push(record),
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        }

        commit_batch(&shared, &batch).await;
    }

    tracing::debug!(worker, "writer task exiting");
}

/// Commit one batch with bounded retries; exhausted retries drop the batch
async fn commit_batch(shared: &Arc<BlockShared>, batch: &[FeedRecord]) {
    if batch.is_empty() {
        return;
    }

    let backoff = Duration::from_millis(shared.config.retry_backoff_ms);
    for attempt in 1..=shared.config.append_retry_limit {
        match try_commit(shared, batch).await {
            Ok(()) => {
                tracing::debug!(records = batch.len(), "committed batch");
                shared.touch();
                return;
            }
            Err(e) => {
                tracing::warn!(
                    attempt,
                    records = batch.len(),
                    "batch commit failed: {}",
                    e
                );
                // No backoff after the last attempt; the drop happens now
                if attempt < shared.config.append_retry_limit {
                    sleep(backoff * attempt).await;
                }
            }
        }
    }

    tracing::error!(
        records = batch.len(),
        "dropping batch after {} attempts",
        shared.config.append_retry_limit
    );
}

async fn try_commit(shared: &Arc<BlockShared>, batch: &[FeedRecord]) -> StorageResult<()> {
    rotate_if_needed(shared).await?;

    // Snapshot the head chunk and index set under the shared lock; the
    // chunk's own write lock serializes the byte-level append
    let (head, indexes) = {
        let inner = shared.inner.read().await;
        if inner.state != BlockState::Hot {
            return Err(StorageError::NotWritable(
                "block went cold with writes in flight".to_string(),
            ));
        }
        let head = inner
            .chunks
            .last()
            .cloned()
            .ok_or_else(|| StorageError::NotWritable("no head chunk".to_string()))?;
        let indexes = inner
            .indexes
            .clone()
            .ok_or_else(|| StorageError::NotWritable("indexes not resident".to_string()))?;
        (head, indexes)
    };

    let chunk_id = head.id();
    head.append(batch, |record, offset| {
        let feed_ref = FeedRef::new(chunk_id, offset, record.time);
        write_guard(&indexes.primary).add(record.id, feed_ref);
        write_guard(&indexes.inverted).add(record.id, &record.labels);
        write_guard(&indexes.vector).add(record.id, &record.vectors);
    })
}

/// Seal the head and open a fresh chunk once the soft size limit is passed
async fn rotate_if_needed(shared: &Arc<BlockShared>) -> StorageResult<()> {
    let over_limit = {
        let inner = shared.inner.read().await;
        inner
            .chunks
            .last()
            .map(|head| head.size() >= shared.config.chunk_size_limit)
            .unwrap_or(false)
    };
    if !over_limit {
        return Ok(());
    }

    let mut inner = shared.inner.write().await;
    let head = match inner.chunks.last() {
        Some(head) if head.size() >= shared.config.chunk_size_limit => head.clone(),
        // Another writer rotated while we waited for the lock
        _ => return Ok(()),
    };

    head.ensure_readonly()?;
    let next_id = head.id() + 1;
    let path = shared.chunk_dir().join(next_id.to_string());
    let chunk = ChunkFile::open(path, next_id, true, false)?;
    inner.chunks.push(Arc::new(chunk));

    tracing::info!(
        sealed = head.id(),
        opened = next_id,
        bytes = head.size(),
        "rotated head chunk"
    );
    Ok(())
}
