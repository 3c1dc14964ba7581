//! Error codes and the error type shared by every fallible operation.
//!
//! Backends speak integer codes; they are translated into [`ErrorCode`] once,
//! at the backend boundary, and never travel further as raw integers.

use std::fmt;

/// Closed set of failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    OutOfMemory,
    BackendInitFailed,
    SystemResourceExhausted,
    DeviceOpenFailed,
    DeviceNotFound,
    InvalidArgument,
    BackendUnavailable,
    StreamingError,
    IncompatibleDevice,
    ClientNotFound,
    IncompatibleBackend,
    BackendDisconnected,
    Interrupted,
    Underflow,
    EncodingError,
}

impl ErrorCode {
    /// Every code, in native order.
    pub const ALL: [ErrorCode; 15] = [
        Self::OutOfMemory,
        Self::BackendInitFailed,
        Self::SystemResourceExhausted,
        Self::DeviceOpenFailed,
        Self::DeviceNotFound,
        Self::InvalidArgument,
        Self::BackendUnavailable,
        Self::StreamingError,
        Self::IncompatibleDevice,
        Self::ClientNotFound,
        Self::IncompatibleBackend,
        Self::BackendDisconnected,
        Self::Interrupted,
        Self::Underflow,
        Self::EncodingError,
    ];

    /// Fixed human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            Self::OutOfMemory => "out of memory",
            Self::BackendInitFailed => "unable to initialize audio backend",
            Self::SystemResourceExhausted => "system resource not available",
            Self::DeviceOpenFailed => "unable to open device",
            Self::DeviceNotFound => "no such device",
            Self::InvalidArgument => "invalid value",
            Self::BackendUnavailable => "backend unavailable",
            Self::StreamingError => "unrecoverable streaming failure",
            Self::IncompatibleDevice => "incompatible device",
            Self::ClientNotFound => "no such client",
            Self::IncompatibleBackend => "incompatible backend",
            Self::BackendDisconnected => "backend disconnected",
            Self::Interrupted => "interrupted; try again",
            Self::Underflow => "buffer underflow",
            Self::EncodingError => "failed to encode string",
        }
    }

    /// Translates a native status code. `0` means success and has no code.
    pub fn from_native(code: i32) -> Option<Self> {
        if code <= 0 {
            return None;
        }
        Self::ALL.get(code as usize - 1).copied()
    }

    /// The native integer value of this code.
    pub fn native(self) -> i32 {
        // ALL is in native order starting at 1
        Self::ALL
            .iter()
            .position(|&c| c == self)
            .map_or(0, |i| i as i32 + 1)
    }

    /// Codes after which the whole context has to be reconnected.
    pub fn is_fatal_to_context(self) -> bool {
        matches!(self, Self::BackendDisconnected)
    }

    /// Codes that are reported but may go away on their own.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Underflow | Self::Interrupted)
    }

    pub(crate) fn to_u8(self) -> u8 {
        self.native() as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        Self::from_native(i32::from(raw))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl std::error::Error for ErrorCode {}

/// An [`ErrorCode`] paired with a message describing what failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Error {
    code: ErrorCode,
    message: String,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Builds an error from a native status code, `None` for success.
    pub fn from_native(code: i32, message: impl Into<String>) -> Option<Self> {
        ErrorCode::from_native(code).map(|code| Self::new(code, message))
    }

    #[inline]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub(crate) fn disconnected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BackendDisconnected, message)
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Self::new(code, code.description())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
