//! Error types for sensor reads and sink writes.
//!
//! Both error types are transient by definition: the collector logs them and
//! carries on. A failed read skips that sensor for the current tick; a failed
//! write sends the record to the local buffer.
//!
//! | Error | Collector reaction |
//! |-------|--------------------|
//! | [`SensorError`] | Log, skip this sample, keep last known value |
//! | [`SinkError`] | Log, buffer the record, retry on a later tick |

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when reading a sensor.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SensorError {
    /// The sensor did not answer in time.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The device answered with a Modbus exception.
    #[error("Device returned exception 0x{code:02X} for function 0x{function:02X}")]
    Exception {
        /// Function code of the request.
        function: u8,
        /// Modbus exception code.
        code: u8,
    },

    /// The response frame was malformed.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The sensor is not responding.
    #[error("Sensor unavailable: {0}")]
    Unavailable(String),

    /// I/O error on the sensor transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SensorError {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create an invalid frame error.
    pub fn invalid_frame(message: impl Into<String>) -> Self {
        Self::InvalidFrame(message.into())
    }
}

/// Errors that can occur when writing to the remote store.
///
/// The collector does not distinguish between variants when deciding what to
/// do; they exist so operators can tell outages from misconfiguration in logs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SinkError {
    /// The store could not be reached.
    #[error("Store unreachable: {0}")]
    Unavailable(String),

    /// The store answered with a non-success status.
    #[error("Store rejected write (HTTP {status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The write did not complete in time.
    #[error("Write timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for sensor reads.
pub type SensorResult<T> = std::result::Result<T, SensorError>;

/// Result type alias for sink writes.
pub type SinkResult<T> = std::result::Result<T, SinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_error_display() {
        let err = SensorError::timeout("read_holding_registers", Duration::from_secs(1));
        assert!(err.to_string().contains("read_holding_registers"));
        assert!(err.to_string().contains("1s"));

        let err = SensorError::Exception {
            function: 0x03,
            code: 0x02,
        };
        assert_eq!(
            err.to_string(),
            "Device returned exception 0x02 for function 0x03"
        );
    }

    #[test]
    fn test_sink_error_display() {
        let err = SinkError::Rejected {
            status: 401,
            message: "unauthorized access".to_string(),
        };
        assert!(err.to_string().contains("401"));
        assert!(err.to_string().contains("unauthorized"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such device");
        let err: SensorError = io_err.into();
        assert!(matches!(err, SensorError::Io(_)));
        assert!(err.to_string().contains("no such device"));
    }
}
