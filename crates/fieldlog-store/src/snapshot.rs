//! Point-in-time views of the buffer.

use time::OffsetDateTime;

use fieldlog_types::{ParseError, Record};

/// A buffered line that could not be decoded back into a record.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedLine {
    /// 1-based position of the line within the snapshot.
    pub line_number: usize,
    /// The line as stored, lossily decoded if it was not valid UTF-8.
    pub raw: String,
    /// Why the line was rejected.
    pub error: ParseError,
}

/// Immutable view of the buffer head at the time it was taken.
///
/// A snapshot covers the first [`line_count`](Self::line_count) lines of the
/// buffer file and remembers their exact bytes, so that committing it removes
/// exactly those lines and nothing appended afterwards.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub(crate) records: Vec<Record>,
    pub(crate) rejected: Vec<RejectedLine>,
    pub(crate) prefix: Vec<u8>,
    pub(crate) line_count: usize,
}

impl Snapshot {
    /// Decoded records, in append order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Lines that failed to decode.
    pub fn rejected(&self) -> &[RejectedLine] {
        &self.rejected
    }

    /// Number of decoded records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the snapshot covers no lines at all.
    pub fn is_empty(&self) -> bool {
        self.line_count == 0
    }

    /// Number of buffer lines the snapshot covers, rejected lines included.
    pub fn line_count(&self) -> usize {
        self.line_count
    }
}

/// Summary of buffer contents for status reporting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferStats {
    /// Records waiting for delivery.
    pub pending: usize,
    /// Lines in the buffer that cannot be decoded.
    pub unreadable: usize,
    /// Timestamp of the oldest pending record.
    pub oldest: Option<OffsetDateTime>,
    /// Timestamp of the newest pending record.
    pub newest: Option<OffsetDateTime>,
    /// Lines previously moved to the rejected sidecar file.
    pub quarantined: usize,
}
