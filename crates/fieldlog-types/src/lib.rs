//! Shared types for the fieldlog telemetry collector.
//!
//! This crate provides the data model that flows through the collector:
//!
//! - [`Reading`]: raw values sampled from one sensor
//! - [`Record`]: a validated, timestamped measurement ready for the store
//! - [`line`]: InfluxDB line protocol encoding, used both on the wire and in
//!   the local buffer file
//!
//! # Example
//!
//! ```
//! use fieldlog_types::{Record, line};
//! use time::OffsetDateTime;
//!
//! let record = Record::builder("wind_sensor")
//!     .tag("sensor", "mast-1")
//!     .field("speed", 4.5)
//!     .timestamp(OffsetDateTime::UNIX_EPOCH)
//!     .build()?;
//!
//! let encoded = line::encode(&record);
//! assert_eq!(line::decode(&encoded)?, record);
//! # Ok::<(), fieldlog_types::ParseError>(())
//! ```

pub mod error;
pub mod line;
pub mod types;

pub use error::ParseError;
pub use types::{FieldValue, Reading, Record, RecordBuilder, SensorKind, validate_name};
