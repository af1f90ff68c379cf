//! Turning raw readings into store records.
//!
//! [`PointBuilder`] is a pure function of its inputs: the same reading and
//! `now` always produce the same record. Measurement names and unit scaling
//! come from a [`MeasurementProfile`] chosen by the reading's sensor kind.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use time::OffsetDateTime;

use fieldlog_types::{FieldValue, ParseError, Reading, Record, SensorKind};

/// Tag key carrying the sensor identifier on every record.
pub const SENSOR_TAG: &str = "sensor";

/// How readings of one sensor kind become records.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementProfile {
    measurement: String,
    scales: BTreeMap<String, f64>,
    units: BTreeMap<String, String>,
}

impl MeasurementProfile {
    /// Profile writing to `measurement` with no scaling.
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            scales: BTreeMap::new(),
            units: BTreeMap::new(),
        }
    }

    /// Multiply `field` by `factor`. Scaled fields are always floats.
    #[must_use]
    pub fn scale(mut self, field: impl Into<String>, factor: f64) -> Self {
        self.scales.insert(field.into(), factor);
        self
    }

    /// Unit suffix used when a record of this profile is shown to an operator.
    #[must_use]
    pub fn unit(mut self, field: impl Into<String>, unit: impl Into<String>) -> Self {
        self.units.insert(field.into(), unit.into());
        self
    }

    /// Built-in profile for a sensor kind.
    ///
    /// The wind sensor reports speed in hundredths of m/s and direction in
    /// whole degrees.
    pub fn for_kind(kind: SensorKind) -> Self {
        match kind {
            SensorKind::Wind => Self::new("wind_sensor")
                .scale("speed", 0.01)
                .unit("speed", " m/s")
                .unit("direction", "°"),
            SensorKind::Simulated => Self::new("simulated"),
            other => Self::new(other.as_str()),
        }
    }

    /// Measurement name.
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    fn apply(&self, field: &str, value: FieldValue) -> FieldValue {
        match self.scales.get(field) {
            Some(factor) => FieldValue::Float(value.as_f64() * factor),
            None => value,
        }
    }
}

/// Builds [`Record`]s from [`Reading`]s.
#[derive(Debug, Clone)]
pub struct PointBuilder {
    profiles: HashMap<SensorKind, MeasurementProfile>,
    measurement_overrides: HashMap<String, String>,
    tags: BTreeMap<String, String>,
}

impl Default for PointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PointBuilder {
    /// Builder with the built-in profile for every sensor kind.
    pub fn new() -> Self {
        let profiles = [SensorKind::Wind, SensorKind::Simulated]
            .into_iter()
            .map(|kind| (kind, MeasurementProfile::for_kind(kind)))
            .collect();
        Self {
            profiles,
            measurement_overrides: HashMap::new(),
            tags: BTreeMap::new(),
        }
    }

    /// Replace the profile for a sensor kind.
    #[must_use]
    pub fn with_profile(mut self, kind: SensorKind, profile: MeasurementProfile) -> Self {
        self.profiles.insert(kind, profile);
        self
    }

    /// Write readings of one sensor to a different measurement than its kind's default.
    #[must_use]
    pub fn with_measurement(
        mut self,
        sensor_id: impl Into<String>,
        measurement: impl Into<String>,
    ) -> Self {
        self.measurement_overrides
            .insert(sensor_id.into(), measurement.into());
        self
    }

    /// Add a tag to every record, e.g. the station name.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    fn profile(&self, kind: SensorKind) -> MeasurementProfile {
        self.profiles
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| MeasurementProfile::for_kind(kind))
    }

    /// Build a record from a reading.
    ///
    /// The timestamp is the reading's capture time when the sensor supplied
    /// one, otherwise `now`.
    ///
    /// # Errors
    ///
    /// Fails if the reading has no fields, a scaled value is not finite, or a
    /// name is not representable in line protocol.
    pub fn build(&self, reading: &Reading, now: OffsetDateTime) -> Result<Record, ParseError> {
        let profile = self.profile(reading.kind);
        let measurement = self
            .measurement_overrides
            .get(&reading.sensor_id)
            .map_or(profile.measurement(), String::as_str);

        let mut builder = Record::builder(measurement);
        for (key, value) in &self.tags {
            builder = builder.tag(key, value);
        }
        builder = builder.tag(SENSOR_TAG, reading.sensor_id.as_str());

        for (name, value) in &reading.fields {
            builder = builder.field(name, profile.apply(name, *value));
        }

        builder.timestamp(reading.captured_at.unwrap_or(now)).build()
    }

    /// Human-readable one-line summary of a record, with units.
    ///
    /// ```text
    /// direction=270°, speed=3.25 m/s
    /// ```
    pub fn describe(&self, kind: SensorKind, record: &Record) -> String {
        let profile = self.profile(kind);
        let mut out = String::new();
        for (i, (name, value)) in record.fields().iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let unit = profile.units.get(name).map_or("", String::as_str);
            match value {
                FieldValue::Float(v) => {
                    let _ = write!(out, "{}={:.2}{}", name, v, unit);
                }
                FieldValue::Integer(v) => {
                    let _ = write!(out, "{}={}{}", name, v, unit);
                }
            }
        }
        out
    }
}
