//! Shared plumbing for reading payload and overlay archives.
//!
//! Archive reads get exactly one retry when the failure is a transient
//! I/O condition; everything else surfaces as [`Error::PackageFormat`].

use std::io;
use std::path::Path;
use tracing::warn;

use crate::error::{Error, Result};

/// Failure while reading an archive, before it is tied to a path.
#[derive(Debug)]
pub(crate) enum ArchiveError {
    Io(io::Error),
    Format(String),
}

impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => Self::Io(e),
            other => Self::Format(other.to_string()),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Run `op` against the archive at `path`, re-running it once after a
/// transient I/O error.
pub(crate) fn read_with_retry<T>(
    path: &Path,
    mut op: impl FnMut() -> std::result::Result<T, ArchiveError>,
) -> Result<T> {
    let mut retried = false;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(ArchiveError::Io(e)) if is_transient(&e) && !retried => {
                warn!("transient read error on {}: {}; retrying once", path.display(), e);
                retried = true;
            }
            Err(ArchiveError::Io(e)) => return Err(Error::package_format(path, e)),
            Err(ArchiveError::Format(reason)) => return Err(Error::package_format(path, reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn transient_error_is_retried_once() {
        let calls = Cell::new(0);
        let value = read_with_retry(Path::new("p.zip"), || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(io::Error::from(io::ErrorKind::Interrupted).into())
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn second_transient_error_is_fatal() {
        let calls = Cell::new(0);
        let err = read_with_retry::<()>(Path::new("p.zip"), || {
            calls.set(calls.get() + 1);
            Err(io::Error::from(io::ErrorKind::TimedOut).into())
        })
        .unwrap_err();
        assert_eq!(calls.get(), 2);
        assert!(matches!(err, Error::PackageFormat { .. }));
    }

    #[test]
    fn permanent_error_is_not_retried() {
        let calls = Cell::new(0);
        let err = read_with_retry::<()>(Path::new("p.zip"), || {
            calls.set(calls.get() + 1);
            Err(io::Error::from(io::ErrorKind::NotFound).into())
        })
        .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert_eq!(err.kind(), "PackageFormat");
    }
}
