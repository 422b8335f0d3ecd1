//! Batch writer
//!
//! Buffers readings and persists them in one transaction when either the
//! buffer reaches `batch.size` or `batch.interval_ms` has elapsed since the
//! first reading of the current buffer.
//!
//! ```text
//!  Idle ──append──> Accumulating ──size reached / timer──> Flushing ──> Idle
//!                   (timer armed)                          (buffer swapped,
//!                                                           timer disarmed)
//! ```
//!
//! `append` must be called from within a tokio runtime: it arms the timer and
//! schedules size-triggered flushes as tasks.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{DimensionResolver, ReadingSink};
use crate::config::BatchSettings;
use crate::error::{ErrorCategory, ErrorClassification};
use crate::schema::{Reading, ReadingRow};

/// Decimal places kept in storage
pub const VALUE_SCALE: u32 = 2;

/// Batch writer errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    #[error("Value {value} on {topic} exceeds storable maximum {max}")]
    ValueOverflow {
        topic: String,
        value: Decimal,
        max: Decimal,
    },
}

impl ErrorClassification for BatchError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Permanent
    }
}

/// What `append` did with a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Buffered; a flush will happen on size or time
    Buffered,
    /// Buffered and the size threshold was reached; a flush is scheduled
    FlushScheduled,
}

/// Result of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Readings taken from the buffer
    pub taken: usize,
    /// Readings committed
    pub persisted: usize,
    /// Readings dropped because their dimension could not be resolved
    pub unresolved: usize,
    /// Readings lost with a failed transaction
    pub lost: usize,
}

/// Batch writer statistics
#[derive(Debug, Default)]
pub struct BatchStats {
    pub appended: AtomicU64,
    pub rejected: AtomicU64,
    pub flushed_batches: AtomicU64,
    pub persisted_rows: AtomicU64,
    pub failed_batches: AtomicU64,
    pub lost_rows: AtomicU64,
    pub unresolved_rows: AtomicU64,
    pub retry_attempts: AtomicU64,
}

/// Round to the storage scale
pub fn round_value(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(VALUE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Largest magnitude a `NUMERIC(precision, 2)` column accepts
pub fn max_storable_value(precision: u32) -> Decimal {
    // precision is validated to 3..=28, so the mantissa fits in 96 bits
    Decimal::from_i128_with_scale(10i128.pow(precision) - 1, VALUE_SCALE)
}

#[derive(Default)]
struct Buffer {
    readings: Vec<Reading>,
    /// Bumped on every swap; a timer only fires for the buffer it was armed for
    generation: u64,
    timer: Option<JoinHandle<()>>,
    flush_pending: bool,
}

struct Inner {
    resolver: Arc<DimensionResolver>,
    sink: Arc<dyn ReadingSink>,
    size: usize,
    interval: Duration,
    max_attempts: u32,
    retry_delay: Duration,
    max_value: Decimal,
    buffer: Mutex<Buffer>,
    /// Serializes flushes
    flush_lock: tokio::sync::Mutex<()>,
    stats: Arc<BatchStats>,
}

/// Dual-trigger batch writer
#[derive(Clone)]
pub struct BatchWriter {
    inner: Arc<Inner>,
}

impl BatchWriter {
    pub fn new(
        resolver: Arc<DimensionResolver>,
        sink: Arc<dyn ReadingSink>,
        settings: &BatchSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                sink,
                size: settings.size.max(1),
                interval: settings.interval(),
                max_attempts: settings.max_retry_attempts.max(1),
                retry_delay: Duration::from_millis(settings.retry_delay_ms),
                max_value: max_storable_value(settings.value_precision),
                buffer: Mutex::new(Buffer::default()),
                flush_lock: tokio::sync::Mutex::new(()),
                stats: Arc::new(BatchStats::default()),
            }),
        }
    }

    /// Get batch writer statistics.
    pub fn stats(&self) -> &Arc<BatchStats> {
        &self.inner.stats
    }

    /// Number of readings waiting for the next flush
    pub fn pending(&self) -> usize {
        self.inner.buffer.lock().readings.len()
    }

    /// Buffer a reading
    ///
    /// The value is rounded to two decimals first; a value that would not fit
    /// the storage precision is rejected and never reaches a transaction.
    pub fn append(&self, mut reading: Reading) -> Result<AppendOutcome, BatchError> {
        let inner = &self.inner;
        let value = round_value(reading.value);
        if value.abs() > inner.max_value {
            inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(BatchError::ValueOverflow {
                topic: reading.topic,
                value,
                max: inner.max_value,
            });
        }
        reading.value = value;

        let mut buffer = inner.buffer.lock();
        if buffer.readings.is_empty() {
            buffer.timer = Some(self.arm_timer(buffer.generation));
        }
        buffer.readings.push(reading);
        inner.stats.appended.fetch_add(1, Ordering::Relaxed);

        if buffer.readings.len() < inner.size || buffer.flush_pending {
            return Ok(AppendOutcome::Buffered);
        }

        buffer.flush_pending = true;
        if let Some(timer) = buffer.timer.take() {
            timer.abort();
        }
        drop(buffer);

        debug!("Batch size {} reached, flushing", inner.size);
        let writer = self.clone();
        tokio::spawn(async move {
            writer.flush().await;
        });

        Ok(AppendOutcome::FlushScheduled)
    }

    fn arm_timer(&self, generation: u64) -> JoinHandle<()> {
        let writer = self.clone();
        let interval = self.inner.interval;

        tokio::spawn(async move {
            tokio::time::sleep(interval).await;

            let due = {
                let mut buffer = writer.inner.buffer.lock();
                let due = buffer.generation == generation
                    && !buffer.flush_pending
                    && !buffer.readings.is_empty();
                if due {
                    buffer.flush_pending = true;
                    // Detach so nothing can abort this task mid-transaction
                    buffer.timer = None;
                }
                due
            };

            if due {
                debug!("Batch interval elapsed, flushing");
                writer.flush().await;
            }
        })
    }

    /// Persist everything buffered so far
    ///
    /// Readings appended while this runs go to the next batch.
    pub async fn flush(&self) -> FlushReport {
        let inner = &self.inner;
        let _guard = inner.flush_lock.lock().await;

        let snapshot = {
            let mut buffer = inner.buffer.lock();
            buffer.flush_pending = false;
            if let Some(timer) = buffer.timer.take() {
                timer.abort();
            }
            if buffer.readings.is_empty() {
                return FlushReport::default();
            }
            buffer.generation += 1;
            std::mem::take(&mut buffer.readings)
        };

        let mut report = FlushReport {
            taken: snapshot.len(),
            ..FlushReport::default()
        };

        let rows = self.resolve_rows(&snapshot).await;
        report.unresolved = snapshot.len() - rows.len();
        if rows.is_empty() {
            return report;
        }

        match self.insert_with_retry(&rows).await {
            Some(_) => {
                report.persisted = rows.len();
                inner.stats.flushed_batches.fetch_add(1, Ordering::Relaxed);
                inner
                    .stats
                    .persisted_rows
                    .fetch_add(rows.len() as u64, Ordering::Relaxed);
                info!(
                    "Flushed batch: {} readings persisted, {} unresolved",
                    report.persisted, report.unresolved
                );
            }
            None => {
                report.lost = rows.len();
                inner.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                inner
                    .stats
                    .lost_rows
                    .fetch_add(rows.len() as u64, Ordering::Relaxed);
            }
        }

        report
    }

    /// Flush whatever is left; called once at shutdown
    pub async fn close(&self) -> FlushReport {
        let pending = self.pending();
        info!("Closing batch writer ({} readings pending)", pending);
        self.flush().await
    }

    /// Resolve every reading concurrently, keeping insertion order
    async fn resolve_rows(&self, snapshot: &[Reading]) -> Vec<ReadingRow> {
        let resolver = &self.inner.resolver;
        let resolved = join_all(snapshot.iter().map(|reading| async move {
            let key = reading.dimension_key();
            (reading, key.clone(), resolver.resolve(&key).await)
        }))
        .await;

        let mut rows = Vec::with_capacity(snapshot.len());
        for (reading, key, result) in resolved {
            match result {
                Ok(dimension_id) => rows.push(ReadingRow {
                    dimension_id,
                    value: reading.value,
                    observed_at: reading.observed_at,
                }),
                Err(e) => {
                    warn!("Dropping reading for {}: dimension unresolved: {}", key, e);
                    self.inner
                        .stats
                        .unresolved_rows
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        rows
    }

    async fn insert_with_retry(&self, rows: &[ReadingRow]) -> Option<u64> {
        let inner = &self.inner;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match inner.sink.insert_readings(rows).await {
                Ok(inserted) => return Some(inserted),
                Err(e) => {
                    error!(
                        "Batch insert failed (attempt {}/{}): {}",
                        attempt, inner.max_attempts, e
                    );

                    if e.is_permanent() || attempt >= inner.max_attempts {
                        error!(
                            "Batch insert failed after {} attempts, discarding {} readings (oldest {})",
                            attempt,
                            rows.len(),
                            oldest(rows).map(|t| t.to_rfc3339()).unwrap_or_default()
                        );
                        return None;
                    }

                    inner.stats.retry_attempts.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(inner.retry_delay).await;
                }
            }
        }
    }
}

fn oldest(rows: &[ReadingRow]) -> Option<DateTime<Utc>> {
    rows.iter().map(|r| r.observed_at).min()
}
