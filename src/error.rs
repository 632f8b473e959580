//! # Modbus Poller Error Handling
//!
//! Error types for the polling core, covering transport failures, frame
//! validation, Modbus exception responses and configuration problems.
//!
//! ## Error Kinds
//!
//! Every error classifies into one of three kinds via [`ModbusError::kind`],
//! and the transaction engine bases its recovery decisions on that kind alone:
//!
//! - **Transient**: timeouts, CRC/frame errors, slave or function code
//!   mismatches, and device-side exceptions 0x04/0x05/0x06/0x08/0x0A/0x0B.
//!   The affected registers are marked errored for this tick and the range is
//!   retried on the next poll.
//! - **Permanent**: exceptions 0x01/0x02/0x03 (illegal function / data address /
//!   data value). These drive the adaptive re-split: disable holes, then fall
//!   back to one-by-one reads, then mark individual registers unavailable.
//! - **Fatal**: configuration errors (unknown register type, range too large,
//!   mixed types in one range). These abort construction and are surfaced to
//!   the caller unchanged.
//!
//! ## Usage Example
//!
//! ```rust
//! use modbus_poller::{ModbusError, ErrorKind};
//!
//! let err = ModbusError::exception(0x03, 0x02);
//! assert_eq!(err.kind(), ErrorKind::Permanent);
//!
//! let err = ModbusError::timeout("read frame", 500);
//! assert_eq!(err.kind(), ErrorKind::Transient);
//! ```

use thiserror::Error;

/// Result type alias for all polling core operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Recovery class of a [`ModbusError`]
///
/// See the module documentation for how the transaction engine reacts to
/// each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry on the next poll tick
    Transient,
    /// Adaptive recovery: hole-disable, one-by-one, per-register disable
    Permanent,
    /// Abort construction; surface to the caller
    Fatal,
}

/// Errors produced by the Modbus polling core
///
/// Variants carry enough context to log a useful message without access to
/// the failed request itself.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// I/O failure on the underlying port (socket, serial line)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or teardown failure
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// No (complete) response within the allotted time
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// CRC16 validation failure on a received ADU
    ///
    /// The line is flushed with `skip_noise` before this is propagated, so
    /// the next transaction starts from a clean buffer.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Structurally invalid response frame
    ///
    /// Raised when the PDU claims more bytes than were actually received.
    /// Triggers the same line flush as a CRC failure.
    #[error("Malformed response: {message}")]
    Malformed { message: String },

    /// Protocol violation that is not a framing problem
    ///
    /// Slave id or function code of the response not matching the request.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Modbus exception response from the device
    ///
    /// `function` is the original request function code, `code` the exception
    /// code from the second PDU byte.
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Invalid register, range or device configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a malformed response error
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a Modbus exception error from a raw exception code
    ///
    /// Maps the standard exception codes to human-readable messages. Codes
    /// 0x07, 0x09 and anything outside the standard table are reported as
    /// invalid but still classify as transient.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "illegal function".to_string(),
            0x02 => "illegal data address".to_string(),
            0x03 => "illegal data value".to_string(),
            0x04 => "server device failure".to_string(),
            0x05 => "long operation (acknowledge)".to_string(),
            0x06 => "server device is busy".to_string(),
            0x08 => "memory parity error".to_string(),
            0x0A => "gateway path is unavailable".to_string(),
            0x0B => "gateway target device failed to respond".to_string(),
            _ => format!("invalid modbus error code ({})", code),
        };

        Self::Exception {
            function,
            code,
            message,
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Classify the error for recovery purposes
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Fatal,
            Self::Exception { code, .. } => match code {
                0x01 | 0x02 | 0x03 => ErrorKind::Permanent,
                _ => ErrorKind::Transient,
            },
            _ => ErrorKind::Transient,
        }
    }

    /// Check if the error is transient (retry next tick)
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if the error is permanent (drives adaptive recovery)
    pub fn is_permanent(&self) -> bool {
        self.kind() == ErrorKind::Permanent
    }

    /// Check if the error is a fatal configuration problem
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Check whether the receive buffer must be drained before retrying
    ///
    /// True for CRC and malformed-frame errors: garbage may still be in
    /// flight and would corrupt the next transaction.
    pub fn needs_line_flush(&self) -> bool {
        matches!(self, Self::CrcMismatch { .. } | Self::Malformed { .. })
    }
}

/// Convert from std::io::Error, preserving the original message
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("operation timeout", 0)
    }
}

/// Convert from serde JSON errors raised while loading device templates
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}
