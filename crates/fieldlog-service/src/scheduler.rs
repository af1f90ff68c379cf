//! Multi-rate sampling loop.
//!
//! Every tick the scheduler first tries to drain the buffer, then reads each
//! sensor whose interval has elapsed, in registration order, and hands the
//! resulting records to the [`FlushCoordinator`].
//!
//! Elapsed time is counted in ticks: a sensor with interval `i` is read every
//! `ceil(i / tick)` ticks, whatever the wall clock does in between. The
//! injected [`Clock`] only stamps records, so tests can pin timestamps.

use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fieldlog_core::{Clock, PointBuilder, Reading, SensorError, SensorSource, Sink};

use crate::flush::{Delivery, FlushCoordinator, FlushOutcome};

/// Default tick period.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Consecutive failures logged as warnings before the scheduler goes quiet.
const WARN_FAILURES: u32 = 3;

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Outcome of the buffer flush at the start of the tick.
    pub flush: FlushOutcome,
    /// Fresh records accepted by the sink.
    pub sent: usize,
    /// Fresh records written to the buffer.
    pub buffered: usize,
    /// Due sensors that produced no record.
    pub failed_reads: usize,
}

/// Number of ticks covering `interval`, at least one.
fn ticks_per_read(interval: Duration, tick: Duration) -> u64 {
    if tick.is_zero() {
        return 1;
    }
    let ticks = interval.as_nanos().div_ceil(tick.as_nanos()).max(1);
    u64::try_from(ticks).unwrap_or(u64::MAX)
}

struct ScheduledSensor {
    source: Box<dyn SensorSource>,
    interval: Duration,
    every: u64,
    ticks_until_due: u64,
    last_reading: Option<Reading>,
    consecutive_failures: u32,
}

impl ScheduledSensor {
    /// Count one tick. Returns whether the sensor is read on it.
    fn advance(&mut self) -> bool {
        if self.ticks_until_due == 0 {
            self.ticks_until_due = self.every - 1;
            true
        } else {
            self.ticks_until_due -= 1;
            false
        }
    }

    fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            info!(
                "Sensor {} recovered after {} failed read(s)",
                self.source.id(),
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self, e: &SensorError) {
        self.consecutive_failures += 1;
        if self.consecutive_failures <= WARN_FAILURES {
            warn!(
                "Failed to read {}: {} (attempt {})",
                self.source.id(),
                e,
                self.consecutive_failures
            );
        } else if self.consecutive_failures == WARN_FAILURES + 1 {
            error!(
                "Failed to read {} after {} attempts, will continue trying silently",
                self.source.id(),
                self.consecutive_failures
            );
        }
    }
}

/// Owns the sensors and the delivery path and drives them tick by tick.
pub struct SampleScheduler<S, C> {
    sensors: Vec<ScheduledSensor>,
    builder: PointBuilder,
    flush: FlushCoordinator<S>,
    clock: C,
    tick: Duration,
}

impl<S: Sink, C: Clock> SampleScheduler<S, C> {
    /// Create a scheduler with no sensors and the default tick.
    pub fn new(flush: FlushCoordinator<S>, builder: PointBuilder, clock: C) -> Self {
        Self {
            sensors: Vec::new(),
            builder,
            flush,
            clock,
            tick: DEFAULT_TICK,
        }
    }

    /// Change the tick period.
    ///
    /// Intervals of sensors already registered are converted to the new
    /// period.
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        for sensor in &mut self.sensors {
            sensor.every = ticks_per_read(sensor.interval, tick);
            sensor.ticks_until_due = sensor.ticks_until_due.min(sensor.every - 1);
        }
        self
    }

    /// Register a sensor. It is due on the first tick.
    pub fn add_sensor(&mut self, source: Box<dyn SensorSource>, interval: Duration) {
        let every = ticks_per_read(interval, self.tick);
        debug!(
            "Scheduling {} every {:?} ({} tick(s))",
            source.id(),
            interval,
            every
        );
        self.sensors.push(ScheduledSensor {
            source,
            interval,
            every,
            ticks_until_due: 0,
            last_reading: None,
            consecutive_failures: 0,
        });
    }

    /// Most recent successful reading of a sensor.
    pub fn last_reading(&self, sensor_id: &str) -> Option<&Reading> {
        self.sensors
            .iter()
            .find(|s| s.source.id() == sensor_id)
            .and_then(|s| s.last_reading.as_ref())
    }

    /// The delivery path.
    pub fn flush_coordinator(&self) -> &FlushCoordinator<S> {
        &self.flush
    }

    /// Run one tick. Records are stamped with the clock's current time.
    ///
    /// # Errors
    ///
    /// Only buffer I/O errors are returned. Sensor and sink failures are
    /// logged and reflected in the report.
    pub async fn tick(&mut self) -> fieldlog_store::Result<TickReport> {
        let mut report = TickReport {
            flush: self.flush.flush().await?,
            sent: 0,
            buffered: 0,
            failed_reads: 0,
        };

        for sensor in &mut self.sensors {
            if !sensor.advance() {
                continue;
            }

            let reading = match sensor.source.read().await {
                Ok(reading) => {
                    sensor.record_success();
                    reading
                }
                Err(e) => {
                    sensor.record_failure(&e);
                    report.failed_reads += 1;
                    continue;
                }
            };

            let record = match self.builder.build(&reading, self.clock.now()) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Discarding reading from {}: {}", sensor.source.id(), e);
                    report.failed_reads += 1;
                    continue;
                }
            };

            info!(
                "{}: {}",
                sensor.source.id(),
                self.builder.describe(reading.kind, &record)
            );
            sensor.last_reading = Some(reading);

            match self.flush.write_or_buffer(&record).await? {
                Delivery::Sent => report.sent += 1,
                Delivery::Buffered => report.buffered += 1,
            }
        }

        Ok(report)
    }

    /// Tick until `cancel` fires, then shut down.
    ///
    /// Cancellation is only observed between ticks.
    ///
    /// # Errors
    ///
    /// Stops at the first buffer I/O error. Sensors and the sink are closed
    /// either way.
    pub async fn run(mut self, cancel: CancellationToken) -> fieldlog_store::Result<()> {
        info!(
            "Sampling {} sensor(s) every {:?}, {} record(s) buffered",
            self.sensors.len(),
            self.tick,
            self.flush.pending()
        );

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Buffer failure, stopping: {}", e);
                        break Err(e);
                    }
                }
            }
        };

        let closed = self.shutdown().await;
        result.and(closed)
    }

    /// Close every sensor, then the sink and the buffer.
    pub async fn shutdown(self) -> fieldlog_store::Result<()> {
        for mut sensor in self.sensors {
            if let Err(e) = sensor.source.close().await {
                warn!("Failed to close sensor {}: {}", sensor.source.id(), e);
            }
        }
        let pending = self.flush.pending();
        self.flush.close().await?;
        info!("Stopped with {} record(s) buffered", pending);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlog_core::{FieldValue, ManualClock, MockSensor, MockSink, SensorKind};
    use fieldlog_store::BufferStore;
    use tempfile::TempDir;
    use time::OffsetDateTime;

    fn start() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn scheduler(dir: &TempDir) -> (SampleScheduler<MockSink, ManualClock>, MockSink, ManualClock) {
        let sink = MockSink::new();
        let clock = ManualClock::new(start());
        let buffer = BufferStore::open(dir.path().join("buffer.lp")).unwrap();
        let scheduler = SampleScheduler::new(
            FlushCoordinator::new(sink.clone(), buffer),
            PointBuilder::new(),
            clock.clone(),
        );
        (scheduler, sink, clock)
    }

    #[tokio::test]
    async fn test_all_sensors_due_on_first_tick() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, sink, _clock) = scheduler(&dir);
        scheduler.add_sensor(
            Box::new(MockSensor::new("a", SensorKind::Simulated)),
            Duration::from_secs(1),
        );
        scheduler.add_sensor(
            Box::new(MockSensor::new("b", SensorKind::Simulated)),
            Duration::from_secs(60),
        );

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.flush, FlushOutcome::Empty);

        let order: Vec<_> = sink
            .delivered()
            .iter()
            .map(|r| r.tags()["sensor"].clone())
            .collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_ticks_per_read() {
        let tick = Duration::from_secs(1);
        assert_eq!(ticks_per_read(Duration::from_secs(1), tick), 1);
        assert_eq!(ticks_per_read(Duration::from_secs(10), tick), 10);
        assert_eq!(ticks_per_read(Duration::from_millis(2500), tick), 3);
        assert_eq!(ticks_per_read(Duration::from_millis(10), tick), 1);
        assert_eq!(
            ticks_per_read(Duration::from_secs(1), Duration::from_millis(200)),
            5
        );
        assert_eq!(ticks_per_read(Duration::from_secs(1), Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_sensor_not_due_until_interval_elapsed() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, _sink, _clock) = scheduler(&dir);
        let sensor = MockSensor::new("a", SensorKind::Simulated);
        scheduler.add_sensor(Box::new(sensor.clone()), Duration::from_secs(5));

        for _ in 0..5 {
            scheduler.tick().await.unwrap();
        }
        assert_eq!(sensor.read_count(), 1);

        scheduler.tick().await.unwrap();
        assert_eq!(sensor.read_count(), 2);
    }

    #[tokio::test]
    async fn test_cadence_ignores_clock_steps() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, _sink, clock) = scheduler(&dir);
        let sensor = MockSensor::new("a", SensorKind::Simulated);
        scheduler.add_sensor(Box::new(sensor.clone()), Duration::from_secs(1));

        scheduler.tick().await.unwrap();
        // A wall clock stepped back, e.g. by NTP.
        clock.set(start() - Duration::from_secs(3600));
        scheduler.tick().await.unwrap();
        scheduler.tick().await.unwrap();
        assert_eq!(sensor.read_count(), 3);
    }

    #[tokio::test]
    async fn test_with_tick_converts_intervals() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, _sink, _clock) = scheduler(&dir);
        let sensor = MockSensor::new("a", SensorKind::Simulated);
        scheduler.add_sensor(Box::new(sensor.clone()), Duration::from_secs(1));
        let mut scheduler = scheduler.with_tick(Duration::from_millis(250));

        for _ in 0..8 {
            scheduler.tick().await.unwrap();
        }
        assert_eq!(sensor.read_count(), 2);
    }

    #[tokio::test]
    async fn test_record_timestamp_from_clock() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, sink, clock) = scheduler(&dir);
        scheduler.add_sensor(
            Box::new(MockSensor::new("a", SensorKind::Simulated)),
            Duration::from_secs(1),
        );

        clock.advance(Duration::from_secs(30));
        scheduler.tick().await.unwrap();
        assert_eq!(
            sink.delivered()[0].timestamp(),
            start() + Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn test_failed_read_is_not_retried_in_same_tick() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, sink, clock) = scheduler(&dir);
        let sensor = MockSensor::new("a", SensorKind::Simulated);
        sensor.fail_on([2]);
        scheduler.add_sensor(Box::new(sensor.clone()), Duration::from_secs(1));

        scheduler.tick().await.unwrap();
        clock.advance(Duration::from_secs(1));
        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.failed_reads, 1);
        assert_eq!(report.sent, 0);
        assert_eq!(sensor.read_count(), 2);
        assert_eq!(sink.delivered().len(), 1);
        assert_eq!(
            scheduler.last_reading("a").and_then(|r| r.field("seq")),
            Some(FieldValue::Integer(1))
        );
    }

    #[tokio::test]
    async fn test_unavailable_sink_buffers() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, sink, _clock) = scheduler(&dir);
        scheduler.add_sensor(
            Box::new(MockSensor::new("a", SensorKind::Simulated)),
            Duration::from_secs(1),
        );
        sink.set_available(false);

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.buffered, 1);
        assert_eq!(scheduler.flush_coordinator().pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel_and_closes() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, sink, _clock) = scheduler(&dir);
        let sensor = MockSensor::new("a", SensorKind::Simulated);
        scheduler.add_sensor(Box::new(sensor.clone()), Duration::from_secs(1));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.with_tick(Duration::from_secs(1)).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert!(sensor.read_count() >= 1);
        assert!(sensor.is_closed());
        assert!(sink.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reads_on_every_tick_despite_slow_sink() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, sink, _clock) = scheduler(&dir);
        let every_tick = MockSensor::new("a", SensorKind::Simulated);
        let every_other = MockSensor::new("b", SensorKind::Simulated);
        scheduler.add_sensor(Box::new(every_tick.clone()), Duration::from_secs(1));
        scheduler.add_sensor(Box::new(every_other.clone()), Duration::from_secs(2));
        sink.set_latency(Duration::from_millis(300));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.with_tick(Duration::from_secs(1)).run(cancel.clone()));

        // Ticks fire at 0, 1, ..., 10 s.
        tokio::time::sleep(Duration::from_millis(10_800)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(every_tick.read_count(), 11);
        assert_eq!(every_other.read_count(), 6);
        assert_eq!(sink.delivered().len(), 17);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sub_second_tick() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, sink, _clock) = scheduler(&dir);
        let sensor = MockSensor::new("a", SensorKind::Simulated);
        scheduler.add_sensor(Box::new(sensor.clone()), Duration::from_millis(200));
        sink.set_latency(Duration::from_millis(50));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            scheduler
                .with_tick(Duration::from_millis(200))
                .run(cancel.clone()),
        );

        // Ticks fire at 0, 0.2, ..., 10 s.
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(sensor.read_count(), 51);
    }
}
