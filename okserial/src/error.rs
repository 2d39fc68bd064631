// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use thiserror::Error as ThisError;

/// Everything that can go wrong between a match expression and a closed
/// connection.
///
/// The enum is `Clone` because one terminal error is replayed to every
/// waiter on a connection; I/O causes are held behind `Arc` to keep that
/// cheap.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// Malformed match expression.
    #[error("bad match expression: {0}")]
    Parse(String),

    /// An expression matched no present port.
    #[error("no serial port matches {0:?}")]
    NoMatch(String),

    /// An expression matched several ports where exactly one was required.
    #[error("{count} serial ports match {expr:?}, need exactly one")]
    AmbiguousMatch { expr: String, count: usize },

    /// Locking refused the open under the current sharing mode.
    #[error("{device} is in use by another connection")]
    SharingConflict { device: String },

    /// A locking operation failed for an OS reason unrelated to sharing.
    #[error("locking {path}: {source}")]
    Locking {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Invalid line parameters or an unknown sharing mode.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A read or write on the device failed after open.
    #[error("serial I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// The device vanished (EOF or an ENODEV-equivalent).
    #[error("serial device disconnected")]
    Disconnected,

    /// A blocking drain or open exceeded its timeout.
    #[error("operation timed out")]
    Timeout,

    /// The engine was terminated via `interrupt`.
    #[error("connection interrupted")]
    Interrupted,

    /// The connection was closed while the operation was pending, or used
    /// after close.
    #[error("connection closed")]
    Closed,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    pub(crate) fn io(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }

    pub(crate) fn locking(path: &std::path::Path, err: std::io::Error) -> Self {
        Error::Locking {
            path: path.display().to_string(),
            source: Arc::new(err),
        }
    }

    /// Maps an I/O failure on an open device, folding the errno values a
    /// disappearing USB adapter produces into [`Error::Disconnected`].
    pub(crate) fn from_device_io(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code)
                if code == libc::EIO || code == libc::ENXIO || code == libc::ENODEV =>
            {
                Error::Disconnected
            }
            _ => Error::io(err),
        }
    }

    /// Whether a tracker should retry after this error rather than surface
    /// it to its awaiters.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Disconnected | Error::SharingConflict { .. } | Error::NoMatch(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Disconnected.is_transient());
        assert!(Error::SharingConflict {
            device: "/dev/ttyUSB0".into()
        }
        .is_transient());
        assert!(Error::NoMatch("x".into()).is_transient());
        assert!(!Error::Parse("x".into()).is_transient());
        assert!(!Error::Config("x".into()).is_transient());
        assert!(!Error::Timeout.is_transient());
    }

    #[test]
    fn disconnect_errno_folding() {
        let eio = std::io::Error::from_raw_os_error(libc::EIO);
        assert!(matches!(Error::from_device_io(eio), Error::Disconnected));
        let enodev = std::io::Error::from_raw_os_error(libc::ENODEV);
        assert!(matches!(Error::from_device_io(enodev), Error::Disconnected));
        let eperm = std::io::Error::from_raw_os_error(libc::EPERM);
        assert!(matches!(Error::from_device_io(eperm), Error::Io(_)));
    }
}
