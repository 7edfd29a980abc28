//! Host capability probing.
//!
//! [`HostHandler`] is the seam to the running kernel and the installed
//! libraries; [`check_host`] turns its answers into a single verdict.

mod checker;
mod kernel;

use std::ffi::CStr;
use std::io;
use std::path::PathBuf;

pub use checker::check_host;
pub use checker::check_host_with_minimum;
pub use checker::HostCheckError;
pub use kernel::kernel_version_ordinal;
pub use kernel::KernelVersionError;

/// Glob patterns searched for the libbpf shared object.
pub const LIBBPF_PATTERNS: &[&str] = &[
    "/usr/lib/libbpf.so*",
    "/usr/lib64/libbpf.so*",
    "/usr/lib/*-linux-gnu/libbpf.so*",
    "/lib/libbpf.so*",
    "/lib64/libbpf.so*",
    "/lib/*-linux-gnu/libbpf.so*",
    "/usr/local/lib/libbpf.so*",
    "/usr/local/lib64/libbpf.so*",
];

/// Queries about the host the plugin runs on.
pub trait HostHandler: Send + Sync {
    /// Release string of the running kernel, e.g. `5.15.0-91-generic`.
    fn kernel_version(&self) -> io::Result<String>;

    /// Whether libbpf is installed, with the matching library paths.
    fn libbpf(&self) -> io::Result<Vec<PathBuf>>;
}

/// [`HostHandler`] backed by `uname(2)` and the filesystem.
#[derive(Debug, Clone)]
pub struct LinuxHost {
    libbpf_patterns: Vec<String>,
}

impl Default for LinuxHost {
    fn default() -> Self {
        Self {
            libbpf_patterns: LIBBPF_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl LinuxHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_libbpf_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            libbpf_patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }
}

impl HostHandler for LinuxHost {
    fn kernel_version(&self) -> io::Result<String> {
        // SAFETY: utsname is plain old data and uname only writes into it.
        let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
        if unsafe { libc::uname(&mut uts) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: uname NUL-terminates every field.
        let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
        Ok(release.to_string_lossy().into_owned())
    }

    fn libbpf(&self) -> io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for pattern in &self.libbpf_patterns {
            let paths = glob::glob(pattern)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            for path in paths {
                match path {
                    Ok(path) => found.push(path),
                    Err(e) => tracing::debug!("skipping unreadable library path: {e}"),
                }
            }
        }
        found.sort();
        found.dedup();
        Ok(found)
    }
}
