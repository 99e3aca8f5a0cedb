//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Error type shared by every component in this crate.
//!
//! Mirrors the three error classes from the error-handling design: guest
//! protocol violations (sticky, fatal), host-side resource exhaustion
//! (reported back through a reply record, not fatal), and internal
//! invariant violations (a renderer bug).

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// The guest violated the command-stream protocol (unknown opcode,
    /// truncated frame, duplicate/zero object id, reference to a missing
    /// resource, double export, concurrent waits, ...). Sticky: the caller
    /// is expected to mark the context fatal after observing this.
    GuestProtocolViolation,

    /// Ran out of device memory while servicing an allocation.
    OutOfDeviceMemory,

    /// Ran out of file descriptors or another per-process resource limit
    /// (`EMFILE` and friends).
    TooManyObjects,

    /// The host driver reported a failure unrelated to the above.
    DriverError,

    /// An invariant internal to this crate was violated (duplicate insert
    /// into a registry, free of an unknown id, ...). Indicates a bug in
    /// this crate rather than guest misbehavior.
    Internal,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::GuestProtocolViolation => "guest protocol violation",
            ErrorKind::OutOfDeviceMemory => "out of device memory",
            ErrorKind::TooManyObjects => "too many objects",
            ErrorKind::DriverError => "host driver error",
            ErrorKind::Internal => "internal invariant violation",
        }
    }
}

/// The error type returned by fallible operations in this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    detail: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, detail: None }
    }

    pub fn with_detail<E>(kind: ErrorKind, detail: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn get_ref(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.detail.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.kind.as_str(), detail),
            None => write!(f, "{}", self.kind.as_str()),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.detail.as_deref().map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maps a raw `errno` from a driver/syscall failure to an [`ErrorKind`],
/// per the `EMFILE` → "too many objects" rule in the error-handling design.
pub fn kind_from_errno(errno: i32) -> ErrorKind {
    if errno == libc::EMFILE || errno == libc::ENFILE {
        ErrorKind::TooManyObjects
    } else if errno == libc::ENOMEM {
        ErrorKind::OutOfDeviceMemory
    } else {
        ErrorKind::DriverError
    }
}
