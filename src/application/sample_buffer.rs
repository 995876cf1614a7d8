// Sample buffer - many producers enqueue, a single task flushes batches to the store
use crate::application::errors::IngestError;
use crate::application::flush_batch::{BatchState, OverflowOutcome, RetryPolicy};
use crate::application::sample_store::SampleStore;
use crate::domain::sample::Sample;
use crate::infrastructure::config::BufferSettings;
use crate::infrastructure::overflow_log::OverflowLog;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Tokio intervals reject a zero period
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct BufferStats {
    /// Enqueued but not yet stored or overflowed
    pending: AtomicUsize,
    flushed_batches: AtomicU64,
    flushed_samples: AtomicU64,
    retried_attempts: AtomicU64,
    overflowed_batches: AtomicU64,
    alert: AtomicBool,
    last_alert: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferSnapshot {
    pub pending: usize,
    pub flushed_batches: u64,
    pub flushed_samples: u64,
    pub retried_attempts: u64,
    pub overflowed_batches: u64,
    pub alert: bool,
    pub last_alert: Option<String>,
}

/// Producer side of the buffer; cheap to clone and share between ingest callers
#[derive(Clone)]
pub struct SampleBuffer {
    tx: mpsc::Sender<Sample>,
    stats: Arc<BufferStats>,
    high_water_mark: usize,
}

/// Owns the flush task; `shutdown` drains and stops it
pub struct FlushHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

struct Flusher {
    rx: mpsc::Receiver<Sample>,
    store: Arc<dyn SampleStore>,
    overflow: Arc<OverflowLog>,
    stats: Arc<BufferStats>,
    batch_size: usize,
    flush_interval: Duration,
    policy: RetryPolicy,
    next_batch_id: u64,
}

impl SampleBuffer {
    /// Spawn the flush task and return the producer handle alongside its owner
    pub fn start(
        store: Arc<dyn SampleStore>,
        overflow: Arc<OverflowLog>,
        settings: &BufferSettings,
    ) -> (SampleBuffer, FlushHandle) {
        let high_water_mark = settings.backpressure_high_water_mark.max(1);
        let (tx, rx) = mpsc::channel(high_water_mark);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stats = Arc::new(BufferStats::default());

        let flusher = Flusher {
            rx,
            store,
            overflow,
            stats: stats.clone(),
            batch_size: settings.flush_batch_size.max(1),
            flush_interval: settings.flush_interval().max(MIN_FLUSH_INTERVAL),
            policy: RetryPolicy::new(settings.retry_max_attempts, settings.retry_backoff_base()),
            next_batch_id: 1,
        };
        let join = tokio::spawn(flusher.run(shutdown_rx));

        let buffer = SampleBuffer {
            tx,
            stats,
            high_water_mark,
        };
        (buffer, FlushHandle { shutdown_tx, join })
    }

    /// Queue a sample without waiting for durability; fails fast when saturated
    pub fn enqueue(&self, sample: Sample) -> Result<(), IngestError> {
        let pending = self.stats.pending.fetch_add(1, Ordering::SeqCst);
        if pending >= self.high_water_mark {
            self.stats.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(IngestError::Backpressure {
                pending,
                high_water_mark: self.high_water_mark,
            });
        }

        match self.tx.try_send(sample) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let pending = self.stats.pending.fetch_sub(1, Ordering::SeqCst) - 1;
                Err(IngestError::Backpressure {
                    pending,
                    high_water_mark: self.high_water_mark,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.pending.fetch_sub(1, Ordering::SeqCst);
                Err(IngestError::Closed)
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.stats.pending.load(Ordering::SeqCst)
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            pending: self.pending(),
            flushed_batches: self.stats.flushed_batches.load(Ordering::Relaxed),
            flushed_samples: self.stats.flushed_samples.load(Ordering::Relaxed),
            retried_attempts: self.stats.retried_attempts.load(Ordering::Relaxed),
            overflowed_batches: self.stats.overflowed_batches.load(Ordering::Relaxed),
            alert: self.stats.alert.load(Ordering::SeqCst),
            last_alert: self.stats.last_alert.lock().ok().and_then(|a| a.clone()),
        }
    }
}

impl FlushHandle {
    /// Stop accepting samples, flush everything still queued and wait for the task
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.join.await {
            tracing::error!("Flush task ended abnormally: {}", e);
        }
    }
}

impl Flusher {
    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut staged: Vec<Sample> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    if !staged.is_empty() {
                        tracing::debug!("Flush interval elapsed with {} staged samples", staged.len());
                        let batch = std::mem::take(&mut staged);
                        self.flush(batch).await;
                    }
                }
                received = self.rx.recv() => match received {
                    Some(sample) => {
                        staged.push(sample);
                        if staged.len() >= self.batch_size {
                            let batch = std::mem::replace(&mut staged, Vec::with_capacity(self.batch_size));
                            self.flush(batch).await;
                            ticker.reset();
                        }
                    }
                    None => break,
                },
            }
        }

        // Drain whatever producers managed to queue before the channel closed
        self.rx.close();
        while let Some(sample) = self.rx.recv().await {
            staged.push(sample);
            if staged.len() >= self.batch_size {
                let batch = std::mem::replace(&mut staged, Vec::with_capacity(self.batch_size));
                self.flush(batch).await;
            }
        }
        if !staged.is_empty() {
            self.flush(staged).await;
        }
        tracing::info!("Sample buffer flush task stopped");
    }

    /// Drive one batch through the state machine until it is stored or overflowed
    async fn flush(&mut self, samples: Vec<Sample>) -> BatchState {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let mut state = BatchState::Pending;
        let mut last_error = String::new();

        while !state.is_terminal() {
            state = match state {
                BatchState::Pending => BatchState::Flushing { attempt: 1 },
                BatchState::Flushing { attempt } => {
                    let result = self.store.append(&samples).await;
                    if let Err(e) = &result {
                        tracing::warn!(
                            "Batch {} ({} samples) attempt {}/{} failed: {}",
                            batch_id,
                            samples.len(),
                            attempt,
                            self.policy.max_attempts,
                            e
                        );
                        last_error = e.to_string();
                    }
                    match BatchState::after_attempt(attempt, &result, &self.policy) {
                        Some(next) => next,
                        None => BatchState::Failed(self.overflow(batch_id, attempt, &last_error, &samples).await),
                    }
                }
                BatchState::RetryScheduled { attempt, delay } => {
                    self.stats.retried_attempts.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    BatchState::Flushing { attempt: attempt + 1 }
                }
                terminal => terminal,
            };
        }

        if state == BatchState::Stored {
            self.stats.flushed_batches.fetch_add(1, Ordering::Relaxed);
            self.stats
                .flushed_samples
                .fetch_add(samples.len() as u64, Ordering::Relaxed);
            tracing::debug!("Batch {} stored ({} samples)", batch_id, samples.len());
        }
        self.stats.pending.fetch_sub(samples.len(), Ordering::SeqCst);
        state
    }

    async fn overflow(
        &self,
        batch_id: u64,
        attempts: u32,
        reason: &str,
        samples: &[Sample],
    ) -> OverflowOutcome {
        self.stats.overflowed_batches.fetch_add(1, Ordering::Relaxed);
        let alert = format!(
            "batch {} with {} samples overflowed after {} attempts: {}",
            batch_id,
            samples.len(),
            attempts,
            reason
        );
        self.stats.alert.store(true, Ordering::SeqCst);
        if let Ok(mut last) = self.stats.last_alert.lock() {
            *last = Some(alert.clone());
        }

        match self.overflow.record(batch_id, attempts, reason, samples).await {
            Ok(()) => {
                tracing::error!(
                    "ALERT: {} (written to {})",
                    alert,
                    self.overflow.path().display()
                );
                OverflowOutcome::OverflowLogged
            }
            Err(e) => {
                tracing::error!(
                    "ALERT: {}; overflow log write failed: {:#}; samples: {:?}",
                    alert,
                    e,
                    samples
                );
                OverflowOutcome::OverflowWriteFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sample::{Metric, Quality};
    use crate::infrastructure::connection_pool::ConnectionPool;
    use crate::infrastructure::memory_store::MemorySampleStore;
    use chrono::{DateTime, TimeZone, Utc};
    use futures::TryStreamExt;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_225_600 + secs, 0).unwrap()
    }

    fn ph(secs: i64, seq: u64) -> Sample {
        Sample::new("sensor-1", Metric::Ph, 6.0, at(secs), Quality::Ok, seq)
    }

    fn settings(batch: usize, hwm: usize, attempts: u32) -> BufferSettings {
        BufferSettings {
            flush_batch_size: batch,
            flush_interval_ms: 2_000,
            backpressure_high_water_mark: hwm,
            retry_max_attempts: attempts,
            retry_backoff_base_ms: 100,
        }
    }

    fn memory_store() -> MemorySampleStore {
        let pool = Arc::new(ConnectionPool::new((), 4, Duration::from_secs(1)));
        MemorySampleStore::new(pool, 1_000)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if cond() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_threshold_flushes_exactly_once() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        let overflow = Arc::new(OverflowLog::new(dir.path().join("overflow.jsonl")));
        let (buffer, handle) = SampleBuffer::start(Arc::new(store.clone()), overflow, &settings(500, 10_000, 3));

        for i in 0..501 {
            buffer.enqueue(ph(i, i as u64)).unwrap();
        }

        wait_until(|| store.sample_count() == 500).await;
        assert_eq!(buffer.snapshot().flushed_batches, 1);
        assert_eq!(buffer.pending(), 1);

        // The 501st sample goes out on the next interval tick
        tokio::time::advance(Duration::from_millis(2_001)).await;
        wait_until(|| store.sample_count() == 501).await;
        assert_eq!(buffer.snapshot().flushed_batches, 2);
        assert_eq!(buffer.pending(), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_backpressure_at_high_water_mark() {
        let store = memory_store();
        store.set_unavailable(true);
        let dir = tempfile::tempdir().unwrap();
        let overflow = Arc::new(OverflowLog::new(dir.path().join("overflow.jsonl")));
        let (buffer, handle) = SampleBuffer::start(Arc::new(store.clone()), overflow, &settings(100, 3, 1));

        for i in 0..3 {
            buffer.enqueue(ph(i, i as u64)).unwrap();
        }
        let err = buffer.enqueue(ph(10, 10)).unwrap_err();
        assert!(matches!(
            err,
            IngestError::Backpressure {
                high_water_mark: 3,
                ..
            }
        ));
        assert_eq!(buffer.pending(), 3);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_is_retried_as_whole_batch() {
        let store = memory_store();
        store.fail_next_appends(2);
        let dir = tempfile::tempdir().unwrap();
        let overflow = Arc::new(OverflowLog::new(dir.path().join("overflow.jsonl")));
        let (buffer, handle) = SampleBuffer::start(Arc::new(store.clone()), overflow.clone(), &settings(4, 100, 5));

        for i in 0..4 {
            buffer.enqueue(ph(i, i as u64)).unwrap();
        }
        handle.shutdown().await;

        // Never a partial batch: all four arrive once retries succeed
        assert_eq!(store.sample_count(), 4);
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.retried_attempts, 2);
        assert!(!snapshot.alert);
        assert!(!overflow.path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_go_to_overflow_and_raise_alert() {
        let store = memory_store();
        store.fail_next_appends(3);
        let dir = tempfile::tempdir().unwrap();
        let overflow = Arc::new(OverflowLog::new(dir.path().join("overflow.jsonl")));
        let (buffer, handle) = SampleBuffer::start(Arc::new(store.clone()), overflow.clone(), &settings(4, 100, 3));

        for i in 0..4 {
            buffer.enqueue(ph(i, i as u64)).unwrap();
        }
        handle.shutdown().await;

        assert_eq!(store.sample_count(), 0);
        let snapshot = buffer.snapshot();
        assert!(snapshot.alert);
        assert_eq!(snapshot.overflowed_batches, 1);
        assert_eq!(snapshot.pending, 0);

        let logged = tokio::fs::read_to_string(overflow.path()).await.unwrap();
        assert_eq!(logged.lines().count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_order_preserved_across_batches() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        let overflow = Arc::new(OverflowLog::new(dir.path().join("overflow.jsonl")));
        let (buffer, handle) = SampleBuffer::start(Arc::new(store.clone()), overflow, &settings(2, 100, 3));

        // Same timestamp submitted three times across two batches: the last submit wins
        let mut first = ph(0, 1);
        first.value = 6.0;
        let mut second = ph(0, 2);
        second.value = 6.5;
        let mut third = ph(0, 3);
        third.value = 7.0;
        buffer.enqueue(first).unwrap();
        buffer.enqueue(second).unwrap();
        buffer.enqueue(third).unwrap();
        handle.shutdown().await;

        let stored: Vec<Sample> = store
            .query_range("sensor-1", Metric::Ph, at(0), at(1))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value, 7.0);
        assert_eq!(stored[0].sequence, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_flush_interval_keeps_flush_task_alive() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        let overflow = Arc::new(OverflowLog::new(dir.path().join("overflow.jsonl")));
        let mut zero_interval = settings(100, 1_000, 3);
        zero_interval.flush_interval_ms = 0;
        let (buffer, handle) = SampleBuffer::start(Arc::new(store.clone()), overflow, &zero_interval);

        buffer.enqueue(ph(0, 1)).unwrap();
        tokio::time::advance(Duration::from_millis(5)).await;
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }

        // The flush task is still running, so the queue stays open
        buffer.enqueue(ph(1, 2)).unwrap();
        handle.shutdown().await;
        assert_eq!(store.sample_count(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_closed() {
        let store = memory_store();
        let dir = tempfile::tempdir().unwrap();
        let overflow = Arc::new(OverflowLog::new(dir.path().join("overflow.jsonl")));
        let (buffer, handle) = SampleBuffer::start(Arc::new(store), overflow, &settings(10, 100, 3));
        handle.shutdown().await;

        assert!(matches!(buffer.enqueue(ph(0, 1)), Err(IngestError::Closed)));
        assert_eq!(buffer.pending(), 0);
    }
}
