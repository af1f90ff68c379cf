//! Sensor sources, sinks and record building for fieldlog stations.
//!
//! This crate sits between the hardware and the store: it reads sensors,
//! turns their readings into [`Record`]s and defines the seam to the remote
//! time-series store.
//!
//! # Features
//!
//! - **Modbus RTU**: holding-register reads over any tokio byte stream
//! - **Wind sensor**: speed and direction from a Modbus anemometer
//! - **Point building**: per-kind measurement names, scaling and units
//! - **Injectable clock**: deterministic timestamps and scheduling in tests
//! - **Mocks**: [`MockSensor`] and [`MockSink`] with failure injection
//!
//! # Supported Sensors
//!
//! | Kind | Measurement | Fields |
//! |------|-------------|--------|
//! | Wind | `wind_sensor` | speed (m/s), direction (°) |
//! | Simulated | `simulated` | value, sample |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use fieldlog_core::{PointBuilder, SensorSource, WindSensor};
//! use time::OffsetDateTime;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut sensor = WindSensor::open("mast-1", "/dev/ttyUSB0", 1, 4800, Duration::from_secs(1))?;
//!     let reading = sensor.read().await?;
//!
//!     let builder = PointBuilder::new();
//!     let record = builder.build(&reading, OffsetDateTime::now_utc())?;
//!     println!("{}", builder.describe(reading.kind, &record));
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod error;
pub mod mock;
pub mod modbus;
pub mod point;
pub mod simulated;
pub mod traits;
pub mod wind;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{SensorError, SensorResult, SinkError, SinkResult};
pub use mock::{MockSensor, MockSink};
pub use modbus::ModbusRtu;
pub use point::{MeasurementProfile, PointBuilder, SENSOR_TAG};
pub use simulated::SimulatedSensor;
pub use traits::{SensorSource, Sink};
pub use wind::WindSensor;

// Re-export the shared data model so downstream crates need only one import.
pub use fieldlog_types::{FieldValue, ParseError, Reading, Record, RecordBuilder, SensorKind, line};
