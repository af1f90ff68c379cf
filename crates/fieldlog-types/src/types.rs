//! Core types for sensor readings and deliverable records.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ParseError;

/// A numeric field value.
///
/// Integers are written with the `i` suffix in line protocol so the store keeps
/// them as integers; everything else is a 64-bit float.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum FieldValue {
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit floating point.
    Float(f64),
}

impl FieldValue {
    /// The value as a float, regardless of representation.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        match *self {
            FieldValue::Integer(v) => v as f64,
            FieldValue::Float(v) => v,
        }
    }

    /// Whether the value can be written to the store.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        match self {
            FieldValue::Integer(_) => true,
            FieldValue::Float(v) => v.is_finite(),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u16> for FieldValue {
    fn from(value: u16) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Kind of sensor attached to the station.
///
/// The kind selects the measurement profile (name and unit scaling) used when
/// a reading is turned into a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[non_exhaustive]
pub enum SensorKind {
    /// Modbus RTU anemometer with speed and direction registers.
    Wind,
    /// Software sensor producing synthetic values, for bench testing a station.
    Simulated,
}

impl SensorKind {
    /// Lowercase name used in configuration files.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Wind => "wind",
            SensorKind::Simulated => "simulated",
        }
    }
}

impl FromStr for SensorKind {
    type Err = ParseError;

    /// Parse a sensor kind from its configuration name.
    ///
    /// ```
    /// use fieldlog_types::SensorKind;
    ///
    /// assert_eq!("wind".parse::<SensorKind>(), Ok(SensorKind::Wind));
    /// assert!("sonar".parse::<SensorKind>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wind" => Ok(SensorKind::Wind),
            "simulated" => Ok(SensorKind::Simulated),
            _ => Err(ParseError::UnknownSensorKind(s.to_string())),
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw sample taken from one sensor.
///
/// Values are as the sensor reports them; unit scaling happens when the
/// reading is turned into a [`Record`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// Identifier of the sensor that produced this reading.
    pub sensor_id: String,
    /// Kind of the sensor.
    pub kind: SensorKind,
    /// Raw field values keyed by field name.
    pub fields: BTreeMap<String, FieldValue>,
    /// When the sensor captured the values, if it reports it.
    #[cfg_attr(feature = "serde", serde(default, with = "time::serde::rfc3339::option"))]
    pub captured_at: Option<OffsetDateTime>,
}

impl Reading {
    /// Create an empty reading for a sensor.
    pub fn new(sensor_id: impl Into<String>, kind: SensorKind) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            kind,
            fields: BTreeMap::new(),
            captured_at: None,
        }
    }

    /// Add a field value.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set the capture time.
    #[must_use]
    pub fn captured_at(mut self, at: OffsetDateTime) -> Self {
        self.captured_at = Some(at);
        self
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        self.fields.get(name).copied()
    }
}

/// A timestamped measurement ready for delivery.
///
/// Records are immutable once built: construct them through [`Record::builder`],
/// which validates names and values so that every record can be encoded as a
/// single line of line protocol.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Record {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    timestamp: OffsetDateTime,
}

impl Record {
    /// Start building a record for a measurement.
    pub fn builder(measurement: impl Into<String>) -> RecordBuilder {
        RecordBuilder {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: None,
        }
    }

    /// Measurement name.
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Tag set, ordered by key.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Field set, ordered by key.
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        self.fields.get(name).copied()
    }

    /// UTC timestamp of the measurement.
    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }
}

/// Builder for [`Record`].
#[derive(Debug, Clone)]
#[must_use = "a builder does nothing until build() is called"]
pub struct RecordBuilder {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Option<OffsetDateTime>,
}

impl RecordBuilder {
    /// Add a tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add a field.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set the timestamp. Converted to UTC.
    pub fn timestamp(mut self, at: OffsetDateTime) -> Self {
        self.timestamp = Some(at.to_offset(time::UtcOffset::UTC));
        self
    }

    /// Validate and build the record.
    ///
    /// # Errors
    ///
    /// - [`ParseError::InvalidName`] if any name or tag value is empty or contains
    ///   a backslash or newline
    /// - [`ParseError::NoFields`] if no field was added
    /// - [`ParseError::NonFiniteField`] if a float field is NaN or infinite
    /// - [`ParseError::InvalidTimestamp`] if no timestamp was set
    pub fn build(self) -> Result<Record, ParseError> {
        validate_name(&self.measurement)?;
        for (key, value) in &self.tags {
            validate_name(key)?;
            validate_name(value)?;
        }
        if self.fields.is_empty() {
            return Err(ParseError::NoFields(self.measurement));
        }
        for (name, value) in &self.fields {
            validate_name(name)?;
            if !value.is_finite() {
                return Err(ParseError::NonFiniteField(name.clone()));
            }
        }
        let timestamp = self
            .timestamp
            .ok_or_else(|| ParseError::InvalidTimestamp("missing timestamp".to_string()))?;

        Ok(Record {
            measurement: self.measurement,
            tags: self.tags,
            fields: self.fields,
            timestamp,
        })
    }
}

/// Check that `name` can be written as a measurement, tag or field name.
///
/// ```
/// use fieldlog_types::validate_name;
///
/// assert!(validate_name("wind_sensor").is_ok());
/// assert!(validate_name("north\\ridge").is_err());
/// assert!(validate_name("").is_err());
/// ```
pub fn validate_name(name: &str) -> Result<(), ParseError> {
    if name.is_empty() || name.contains(['\\', '\n', '\r']) {
        return Err(ParseError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[test]
    fn test_build_record() {
        let record = Record::builder("wind_sensor")
            .tag("sensor", "mast-1")
            .field("speed", 3.25)
            .field("direction", 270i64)
            .timestamp(ts())
            .build()
            .unwrap();

        assert_eq!(record.measurement(), "wind_sensor");
        assert_eq!(record.tags().get("sensor").map(String::as_str), Some("mast-1"));
        assert_eq!(record.field("speed"), Some(FieldValue::Float(3.25)));
        assert_eq!(record.field("direction"), Some(FieldValue::Integer(270)));
        assert_eq!(record.timestamp(), ts());
    }

    #[test]
    fn test_build_requires_fields() {
        let err = Record::builder("empty").timestamp(ts()).build().unwrap_err();
        assert_eq!(err, ParseError::NoFields("empty".to_string()));
    }

    #[test]
    fn test_build_requires_timestamp() {
        let err = Record::builder("m").field("f", 1i64).build().unwrap_err();
        assert!(matches!(err, ParseError::InvalidTimestamp(_)));
    }

    #[test]
    fn test_build_rejects_nan() {
        let err = Record::builder("m")
            .field("f", f64::NAN)
            .timestamp(ts())
            .build()
            .unwrap_err();
        assert_eq!(err, ParseError::NonFiniteField("f".to_string()));
    }

    #[test]
    fn test_build_rejects_bad_names() {
        for bad in ["", "a\\b", "line\nbreak"] {
            let err = Record::builder(bad)
                .field("f", 1i64)
                .timestamp(ts())
                .build()
                .unwrap_err();
            assert!(matches!(err, ParseError::InvalidName(_)), "{bad:?}");
        }
    }

    #[test]
    fn test_timestamp_normalized_to_utc() {
        let local = ts().to_offset(time::UtcOffset::from_hms(2, 0, 0).unwrap());
        let record = Record::builder("m")
            .field("f", 1i64)
            .timestamp(local)
            .build()
            .unwrap();
        assert!(record.timestamp().offset().is_utc());
        assert_eq!(record.timestamp(), ts());
    }

    #[test]
    fn test_sensor_kind_names() {
        assert_eq!(SensorKind::Wind.to_string(), "wind");
        assert_eq!("Simulated".parse::<SensorKind>(), Ok(SensorKind::Simulated));
        assert!(matches!(
            "lidar".parse::<SensorKind>(),
            Err(ParseError::UnknownSensorKind(_))
        ));
    }

    #[test]
    fn test_reading_builder() {
        let reading = Reading::new("mast-1", SensorKind::Wind)
            .with_field("speed", 325u16)
            .with_field("direction", 90u16);
        assert_eq!(reading.field("speed"), Some(FieldValue::Integer(325)));
        assert!(reading.captured_at.is_none());
    }

    #[test]
    fn test_field_value_as_f64() {
        assert_eq!(FieldValue::Integer(7).as_f64(), 7.0);
        assert_eq!(FieldValue::Float(0.5).as_f64(), 0.5);
    }
}
