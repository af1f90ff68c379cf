//! Trait abstractions over sensors and the remote store.
//!
//! The collector only ever talks to a sensor through [`SensorSource`] and to
//! the store through [`Sink`], so real hardware, the HTTP client and the mock
//! implementations are interchangeable.

use async_trait::async_trait;

use fieldlog_types::{Reading, Record, SensorKind};

use crate::error::{SensorResult, SinkResult};

/// One physical (or simulated) sensor.
///
/// Implementations must bound every read with a timeout so a silent device
/// cannot stall the collector.
#[async_trait]
pub trait SensorSource: Send {
    /// Identifier of this sensor, unique within a station.
    fn id(&self) -> &str;

    /// Kind of this sensor.
    fn kind(&self) -> SensorKind;

    /// Take one sample.
    async fn read(&mut self) -> SensorResult<Reading>;

    /// Release the sensor transport.
    ///
    /// The default implementation does nothing.
    async fn close(&mut self) -> SensorResult<()> {
        Ok(())
    }
}

/// The remote time-series store.
///
/// Each call is a single attempt. Implementations must not retry or back off
/// internally; undelivered records are buffered and retried by the caller.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Write one record.
    async fn write(&self, record: &Record) -> SinkResult<()>;

    /// Write a batch of records in one request.
    ///
    /// `Ok` means every record was accepted.
    async fn write_batch(&self, records: &[Record]) -> SinkResult<()>;

    /// Release the connection to the store.
    ///
    /// The default implementation does nothing.
    async fn close(&self) {}
}
