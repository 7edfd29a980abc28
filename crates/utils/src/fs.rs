//! Filesystem helpers.

use std::io;
use std::path::Path;

/// Removes `path` if it exists. Returns whether a file was removed.
pub fn remove_file_if_exists(path: impl AsRef<Path>) -> io::Result<bool> {
    match std::fs::remove_file(path.as_ref()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Removes `path` and everything below it if it exists.
pub fn remove_dir_if_exists(path: impl AsRef<Path>) -> io::Result<bool> {
    match std::fs::remove_dir_all(path.as_ref()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
