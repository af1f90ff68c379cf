//! Sampling scheduler, offline buffering and InfluxDB forwarding.
//!
//! This crate is the station itself:
//! - Samples each configured sensor at its own interval
//! - Writes every record to InfluxDB, or to the local buffer when the store
//!   cannot be reached
//! - Drains the buffer as one batch per tick once the store is back
//!
//! # Configuration
//!
//! The collector reads `~/.config/fieldlog/station.toml`:
//!
//! ```toml
//! [sink]
//! url = "http://influx.local:8086"
//! org = "ops"
//! bucket = "weather"
//! # token usually comes from INFLUX_TOKEN
//!
//! [buffer]
//! path = "/var/lib/fieldlog/buffer.lp"
//!
//! [station]
//! station = "north-ridge"
//!
//! [[sensors]]
//! id = "mast-1"
//! kind = "wind"
//! device = "/dev/ttyUSB0"
//! interval = 1
//! ```
//!
//! # Delivery guarantees
//!
//! A record is either accepted by the store, or in the buffer file waiting
//! for the next flush. Buffered records are delivered in the order they were
//! buffered, and leave the buffer only after the whole batch was accepted.

pub mod config;
pub mod flush;
pub mod influx;
pub mod scheduler;

pub use config::{
    BufferConfig, Config, ConfigError, SchedulerConfig, SensorConfig, SinkConfig, StationConfig,
    ValidationError,
};
pub use flush::{Delivery, FlushCoordinator, FlushOutcome};
pub use influx::InfluxSink;
pub use scheduler::{SampleScheduler, TickReport};
