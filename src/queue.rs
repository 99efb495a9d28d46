use crate::{
    error::Result,
    wal::{TelemetryRecord, TelemetryWal},
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Durable buffer between session finalization and the upload worker.
///
/// Enqueue appends to the write-ahead log before the record is offered to
/// the bounded in-memory queue, so anything acknowledged here survives a
/// crash. The in-memory side drops the oldest record on overflow rather
/// than blocking: under sustained overload freshness wins over
/// completeness. Records leave the WAL only after confirmed delivery.
pub struct TelemetryQueue {
    wal: TelemetryWal,
    records: Mutex<VecDeque<TelemetryRecord>>,
    capacity: usize,
    notify: Notify,
    flush_requested: AtomicBool,
    pending: AtomicUsize,
    collect_enabled: AtomicBool,
}

impl TelemetryQueue {
    pub fn new<P: AsRef<Path>>(wal_path: P, capacity: usize) -> Self {
        Self {
            wal: TelemetryWal::new(wal_path),
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
            flush_requested: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            collect_enabled: AtomicBool::new(true),
        }
    }

    /// Replay unacknowledged records from the WAL into memory.
    ///
    /// Run once at startup, before the upload worker begins draining. Gives
    /// at-least-once delivery across restarts; note that a backlog larger
    /// than the queue capacity still drops the oldest replayed records.
    pub async fn restore(&self) -> Result<usize> {
        let restored = self.wal.replay().await?;
        let count = restored.len();

        {
            let mut records = self.records.lock();
            for record in restored {
                if records.len() == self.capacity {
                    records.pop_front();
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    warn!("Queue overflow during WAL restore, dropped oldest record");
                }
                records.push_back(record);
                self.pending.fetch_add(1, Ordering::SeqCst);
            }
        }

        if count > 0 {
            info!("Restored {} pending records from WAL", count);
            self.notify.notify_one();
        }
        Ok(count)
    }

    /// Durably append the record, then offer it to the in-memory queue.
    ///
    /// Returns whether the in-memory offer succeeded without displacing
    /// anything; the WAL append is attempted regardless. A failed WAL write
    /// is logged and swallowed: losing durability must not stop live
    /// collection.
    pub async fn try_enqueue(&self, record: TelemetryRecord) -> bool {
        if !self.collect_enabled.load(Ordering::SeqCst) {
            return false;
        }

        if let Err(e) = self.wal.append(&record).await {
            warn!("WAL append failed, record is memory-only: {}", e);
        }

        let displaced = {
            let mut records = self.records.lock();
            let displaced = if records.len() == self.capacity {
                records.pop_front();
                self.pending.fetch_sub(1, Ordering::SeqCst);
                true
            } else {
                false
            };
            records.push_back(record);
            displaced
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();

        if displaced {
            warn!("Telemetry queue full, dropped oldest record");
        }
        debug!(
            "Enqueued telemetry record, pending={}",
            self.pending.load(Ordering::SeqCst)
        );
        !displaced
    }

    /// Take the oldest queued record, if any
    pub fn pop(&self) -> Option<TelemetryRecord> {
        self.records.lock().pop_front()
    }

    /// Confirm delivery of the oldest `count` records: trim them from the
    /// WAL head and drop them from the pending counter.
    pub async fn mark_delivered(&self, count: usize) -> Result<()> {
        self.wal.trim(count).await?;

        let mut pending = self.pending.load(Ordering::SeqCst);
        loop {
            let next = pending.saturating_sub(count);
            match self.pending.compare_exchange(
                pending,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => pending = current,
            }
        }

        debug!(
            "Marked {} records delivered, pending={}",
            count,
            self.pending.load(Ordering::SeqCst)
        );
        Ok(())
    }

    /// Ask the worker to upload whatever is buffered without waiting for
    /// the flush interval
    pub fn request_flush(&self) {
        self.flush_requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Consume a pending flush request, if one was made
    pub fn take_flush_request(&self) -> bool {
        self.flush_requested.swap(false, Ordering::SeqCst)
    }

    /// Wait until a record is enqueued or a flush is requested
    pub async fn wait_for_activity(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Records enqueued but not yet confirmed delivered
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn set_collect_enabled(&self, enabled: bool) {
        self.collect_enabled.store(enabled, Ordering::SeqCst);
        info!("Telemetry collection enabled: {}", enabled);
    }

    pub fn is_collecting(&self) -> bool {
        self.collect_enabled.load(Ordering::SeqCst)
    }

    pub fn wal(&self) -> &TelemetryWal {
        &self.wal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(avg_fps: f64) -> TelemetryRecord {
        TelemetryRecord {
            timestamp: Utc::now(),
            game: Some("cs2".to_string()),
            avg_fps,
            avg_frametime: 1000.0 / avg_fps,
            one_percent_low: avg_fps - 5.0,
            sample_count: 60,
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_wal_first() {
        let dir = TempDir::new().unwrap();
        let queue = TelemetryQueue::new(dir.path().join("wal.jsonl"), 100);

        assert!(queue.try_enqueue(record(60.0)).await);

        // The record is on disk by the time try_enqueue returned
        assert_eq!(queue.wal().len().await.unwrap(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_wal_written_even_when_memory_full() {
        let dir = TempDir::new().unwrap();
        let queue = TelemetryQueue::new(dir.path().join("wal.jsonl"), 2);

        assert!(queue.try_enqueue(record(30.0)).await);
        assert!(queue.try_enqueue(record(60.0)).await);
        // Overflow: oldest dropped from memory, WAL keeps all three
        assert!(!queue.try_enqueue(record(90.0)).await);

        assert_eq!(queue.wal().len().await.unwrap(), 3);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().avg_fps, 60.0);
    }

    #[tokio::test]
    async fn test_disabled_collection_skips_everything() {
        let dir = TempDir::new().unwrap();
        let queue = TelemetryQueue::new(dir.path().join("wal.jsonl"), 100);

        queue.set_collect_enabled(false);
        assert!(!queue.try_enqueue(record(60.0)).await);
        assert_eq!(queue.wal().len().await.unwrap(), 0);
        assert!(queue.is_empty());

        queue.set_collect_enabled(true);
        assert!(queue.try_enqueue(record(60.0)).await);
    }

    #[tokio::test]
    async fn test_restore_replays_wal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.jsonl");

        {
            let queue = TelemetryQueue::new(&path, 100);
            queue.try_enqueue(record(30.0)).await;
            queue.try_enqueue(record(60.0)).await;
        }

        // Fresh process: WAL replays into memory before the worker runs
        let queue = TelemetryQueue::new(&path, 100);
        assert_eq!(queue.restore().await.unwrap(), 2);
        assert_eq!(queue.pending_count(), 2);
        assert_eq!(queue.pop().unwrap().avg_fps, 30.0);
        assert_eq!(queue.pop().unwrap().avg_fps, 60.0);
    }

    #[tokio::test]
    async fn test_mark_delivered_trims_and_decrements() {
        let dir = TempDir::new().unwrap();
        let queue = TelemetryQueue::new(dir.path().join("wal.jsonl"), 100);

        for fps in [30.0, 60.0, 90.0] {
            queue.try_enqueue(record(fps)).await;
        }
        queue.pop();
        queue.pop();
        queue.mark_delivered(2).await.unwrap();

        assert_eq!(queue.pending_count(), 1);
        let remaining = queue.wal().replay().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].avg_fps, 90.0);
    }

    #[tokio::test]
    async fn test_flush_request_wakes_waiter() {
        let dir = TempDir::new().unwrap();
        let queue = std::sync::Arc::new(TelemetryQueue::new(dir.path().join("wal.jsonl"), 100));

        let waiter = std::sync::Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            waiter.wait_for_activity().await;
            waiter.take_flush_request()
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.request_flush();

        let flushed = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(flushed);
    }
}
