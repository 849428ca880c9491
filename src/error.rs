use std::fmt;

/// Coarse classification shared by every error type in the crate.
///
/// Each module keeps its own `thiserror` enum with the details a caller needs
/// (operation names, raw codes, paths). `kind()` on those enums maps them onto
/// this taxonomy so a transport layer can pick a status without matching on
/// every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad duration or filename, rejected before anything touches hardware.
    InvalidConfig,
    /// Operation not allowed in the current lifecycle state.
    InvalidState,
    /// File create/read/write failure, or a worker thread could not spawn.
    IoFailure,
    /// The sampling hardware reported a failure.
    CaptureFailure,
    /// Decoded indices are not exactly `0..N-1`, or a record is truncated.
    IntegrityViolation,
    /// The bias hardware rejected or failed a command.
    DeviceFault,
    /// The bias hardware did not answer within the bound.
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::IoFailure => "io_failure",
            ErrorKind::CaptureFailure => "capture_failure",
            ErrorKind::IntegrityViolation => "integrity_violation",
            ErrorKind::DeviceFault => "device_fault",
            ErrorKind::Timeout => "timeout",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ErrorKind::Timeout)
    }

    /// HTTP-style status a request layer should answer with.
    ///
    /// Timeouts become 504 so clients can retry with a longer bound; every
    /// other kind is a generic 500.
    pub fn status_code(&self) -> u16 {
        if self.is_timeout() {
            504
        } else {
            500
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
