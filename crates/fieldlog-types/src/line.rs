//! InfluxDB line protocol encoding and decoding for [`Record`]s.
//!
//! Line protocol is both the store's write format and the on-disk format of
//! the local buffer, so a record that cannot be delivered is written to disk
//! exactly as it would have been sent.
//!
//! ```text
//! measurement,tag1=val1 field1=1.5,field2=42i 1700000000000000000
//! ```
//!
//! Only numeric fields are supported. Names never contain backslashes (the
//! record builder rejects them), which keeps unescaping unambiguous.
//!
//! See: <https://docs.influxdata.com/influxdb/v2/reference/syntax/line-protocol/>

use time::OffsetDateTime;

use crate::error::ParseError;
use crate::types::{FieldValue, Record};

/// Encode a record as a single line, without the trailing newline.
///
/// ```
/// use fieldlog_types::{Record, line};
/// use time::OffsetDateTime;
///
/// let record = Record::builder("wind_sensor")
///     .field("speed", 3.25)
///     .field("direction", 270i64)
///     .timestamp(OffsetDateTime::from_unix_timestamp(1).unwrap())
///     .build()
///     .unwrap();
/// assert_eq!(
///     line::encode(&record),
///     "wind_sensor direction=270i,speed=3.25 1000000000"
/// );
/// ```
pub fn encode(record: &Record) -> String {
    let mut line = escape(record.measurement(), &[',', ' ']);

    for (key, value) in record.tags() {
        line.push(',');
        line.push_str(&escape(key, &[',', '=', ' ']));
        line.push('=');
        line.push_str(&escape(value, &[',', '=', ' ']));
    }

    line.push(' ');
    for (i, (key, value)) in record.fields().iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape(key, &[',', '=', ' ']));
        line.push('=');
        match value {
            FieldValue::Integer(v) => {
                line.push_str(&v.to_string());
                line.push('i');
            }
            FieldValue::Float(v) => line.push_str(&v.to_string()),
        }
    }

    line.push(' ');
    line.push_str(&record.timestamp().unix_timestamp_nanos().to_string());
    line
}

/// Decode one line produced by [`encode`].
///
/// # Errors
///
/// Returns [`ParseError::MalformedLine`] for structural problems,
/// [`ParseError::InvalidFieldValue`] for unparseable numbers, and
/// [`ParseError::InvalidTimestamp`] for a bad timestamp.
pub fn decode(line: &str) -> Result<Record, ParseError> {
    let line = line.trim_end_matches(['\n', '\r']);
    let sections = split_unescaped(line, ' ');
    let [series, fields, timestamp] = sections.as_slice() else {
        return Err(ParseError::MalformedLine(format!(
            "expected 3 sections, found {}",
            sections.len()
        )));
    };

    let mut series = split_unescaped(series, ',').into_iter();
    let measurement = series
        .next()
        .map(|m| unescape(&m))
        .ok_or_else(|| ParseError::MalformedLine("missing measurement".to_string()))?;
    let mut builder = Record::builder(measurement);

    for tag in series {
        let (key, value) = split_pair(&tag)?;
        builder = builder.tag(key, value);
    }

    for field in split_unescaped(fields, ',') {
        let (key, raw) = split_pair(&field)?;
        let value = parse_field_value(&raw).ok_or_else(|| ParseError::InvalidFieldValue {
            field: key.clone(),
            value: raw.clone(),
        })?;
        builder = builder.field(key, value);
    }

    let nanos: i128 = timestamp
        .parse()
        .map_err(|_| ParseError::InvalidTimestamp(timestamp.clone()))?;
    let timestamp = OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map_err(|e| ParseError::InvalidTimestamp(e.to_string()))?;

    builder.timestamp(timestamp).build()
}

fn parse_field_value(raw: &str) -> Option<FieldValue> {
    if let Some(int) = raw.strip_suffix('i') {
        return int.parse().ok().map(FieldValue::Integer);
    }
    raw.parse().ok().map(FieldValue::Float)
}

fn split_pair(raw: &str) -> Result<(String, String), ParseError> {
    let parts = split_unescaped(raw, '=');
    match parts.as_slice() {
        [key, value] => Ok((unescape(key), unescape(value))),
        _ => Err(ParseError::MalformedLine(format!("bad key=value pair '{}'", raw))),
    }
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split on `sep` where it is not preceded by a backslash. Escapes are kept.
fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}
