//! Mock sensor and sink implementations for testing.
//!
//! Both mocks are cheap to clone and clones share state, so a test can hand
//! one clone to the collector and keep another to inject failures and inspect
//! what was delivered.
//!
//! # Features
//!
//! - **Failure injection**: fail always, fail the next N calls, or fail
//!   specific read attempts
//! - **Call accounting**: read, write and batch counters
//! - **Delivery log**: every record a [`MockSink`] accepted, in order
//! - **Latency**: a [`MockSink`] can be made slow to answer

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use fieldlog_types::{FieldValue, Reading, Record, SensorKind};

use crate::error::{SensorError, SensorResult, SinkError, SinkResult};
use crate::traits::{SensorSource, Sink};

/// Field carrying the 1-based read attempt number on every mock reading.
pub const SEQ_FIELD: &str = "seq";

#[derive(Debug, Default)]
struct SensorState {
    fields: Mutex<BTreeMap<String, FieldValue>>,
    captured_at: Mutex<Option<OffsetDateTime>>,
    fail_on: Mutex<BTreeSet<u32>>,
    read_count: AtomicU32,
    should_fail: AtomicBool,
    remaining_failures: AtomicU32,
    closed: AtomicBool,
}

/// A mock sensor.
///
/// Every successful reading carries the configured fields plus
/// [`SEQ_FIELD`], the number of the read attempt that produced it.
///
/// # Example
///
/// ```
/// use fieldlog_core::{MockSensor, SensorSource};
/// use fieldlog_types::SensorKind;
///
/// #[tokio::main]
/// async fn main() {
///     let mut sensor = MockSensor::new("mast-1", SensorKind::Wind).with_field("speed", 325u16);
///     sensor.fail_on([2]);
///
///     assert!(sensor.read().await.is_ok());
///     assert!(sensor.read().await.is_err());
///     assert_eq!(sensor.read_count(), 2);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MockSensor {
    id: String,
    kind: SensorKind,
    state: Arc<SensorState>,
}

impl MockSensor {
    /// Create a mock sensor with no fields besides the sequence number.
    pub fn new(id: impl Into<String>, kind: SensorKind) -> Self {
        Self {
            id: id.into(),
            kind,
            state: Arc::new(SensorState::default()),
        }
    }

    /// Add a field reported by every reading.
    #[must_use]
    pub fn with_field(self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set_field(name, value);
        self
    }

    /// Change a reported field.
    pub fn set_field(&self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.state
            .fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into());
    }

    /// Report a fixed capture time on every reading.
    pub fn set_captured_at(&self, at: Option<OffsetDateTime>) {
        *self
            .state
            .captured_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = at;
    }

    /// Make every read fail (or succeed again).
    pub fn set_should_fail(&self, fail: bool) {
        self.state.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Fail the next `count` reads.
    pub fn fail_next(&self, count: u32) {
        self.state.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Fail the given 1-based read attempts.
    pub fn fail_on(&self, attempts: impl IntoIterator<Item = u32>) {
        self.state
            .fail_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(attempts);
    }

    /// Number of read attempts so far, failed ones included.
    pub fn read_count(&self) -> u32 {
        self.state.read_count.load(Ordering::Relaxed)
    }

    /// Whether [`SensorSource::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Relaxed)
    }

    fn check_should_fail(&self, attempt: u32) -> SensorResult<()> {
        let scripted = self
            .state
            .fail_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&attempt);

        let transient = self
            .state
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();

        if scripted || transient || self.state.should_fail.load(Ordering::Relaxed) {
            return Err(SensorError::Unavailable(format!(
                "mock sensor {} failed read {}",
                self.id, attempt
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SensorSource for MockSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SensorKind {
        self.kind
    }

    async fn read(&mut self) -> SensorResult<Reading> {
        let attempt = self.state.read_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.check_should_fail(attempt)?;

        let mut reading = Reading::new(self.id.clone(), self.kind);
        reading.fields = self
            .state
            .fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        reading
            .fields
            .insert(SEQ_FIELD.to_string(), FieldValue::Integer(i64::from(attempt)));
        reading.captured_at = *self
            .state
            .captured_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(reading)
    }

    async fn close(&mut self) -> SensorResult<()> {
        self.state.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug)]
struct SinkState {
    delivered: Vec<Record>,
    batch_sizes: Vec<usize>,
    available: bool,
    remaining_failures: u32,
    write_calls: u32,
    batch_calls: u32,
    latency: Duration,
    closed: bool,
}

/// A mock remote store that records what it accepts.
///
/// # Example
///
/// ```
/// use fieldlog_core::{MockSink, Sink};
///
/// # async fn example(record: fieldlog_types::Record) {
/// let sink = MockSink::new();
/// sink.set_available(false);
/// assert!(sink.write(&record).await.is_err());
///
/// sink.set_available(true);
/// sink.write(&record).await.unwrap();
/// assert_eq!(sink.delivered().len(), 1);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MockSink {
    state: Arc<Mutex<SinkState>>,
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSink {
    /// Create an available sink.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                delivered: Vec::new(),
                batch_sizes: Vec::new(),
                available: true,
                remaining_failures: 0,
                write_calls: 0,
                batch_calls: 0,
                latency: Duration::ZERO,
                closed: false,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the store reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Fail the next `count` write calls, batch or single.
    pub fn fail_next(&self, count: u32) {
        self.lock().remaining_failures = count;
    }

    /// Delay every write call by `latency` before it completes.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Every accepted record, in acceptance order.
    pub fn delivered(&self) -> Vec<Record> {
        self.lock().delivered.clone()
    }

    /// Sizes of the accepted batches.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    /// Number of single-record write attempts.
    pub fn write_calls(&self) -> u32 {
        self.lock().write_calls
    }

    /// Number of batch write attempts.
    pub fn batch_calls(&self) -> u32 {
        self.lock().batch_calls
    }

    /// Whether [`Sink::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl SinkState {
    fn check_should_fail(&mut self) -> SinkResult<()> {
        if self.remaining_failures > 0 {
            self.remaining_failures -= 1;
            return Err(SinkError::Unavailable("mock transient failure".to_string()));
        }
        if !self.available {
            return Err(SinkError::Unavailable("mock store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for MockSink {
    async fn write(&self, record: &Record) -> SinkResult<()> {
        self.delay().await;
        let mut state = self.lock();
        state.write_calls += 1;
        state.check_should_fail()?;
        state.delivered.push(record.clone());
        Ok(())
    }

    async fn write_batch(&self, records: &[Record]) -> SinkResult<()> {
        self.delay().await;
        let mut state = self.lock();
        state.batch_calls += 1;
        state.check_should_fail()?;
        state.delivered.extend_from_slice(records);
        state.batch_sizes.push(records.len());
        Ok(())
    }

    async fn close(&self) {
        self.lock().closed = true;
    }
}
