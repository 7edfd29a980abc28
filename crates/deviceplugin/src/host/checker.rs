use core::error::Error;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::warn;

use super::kernel::kernel_version_ordinal;
use super::HostHandler;
use crate::constants;

/// Errors that stop the host check from reaching a verdict.
#[derive(Debug, Display)]
pub enum HostCheckError {
    #[display("error checking kernel version")]
    KernelVersion,
    #[display("error converting actual kernel version {version:?} to an ordinal")]
    ActualKernelOrdinal { version: String },
    #[display("error converting minimum kernel version {version:?} to an ordinal")]
    MinimumKernelOrdinal { version: String },
    #[display("error checking host for libbpf")]
    Libbpf,
}

impl Error for HostCheckError {}

/// Checks the host against [`constants::MINIMUM_KERNEL`] and for libbpf.
pub fn check_host(host: &dyn HostHandler) -> Result<bool, Report<HostCheckError>> {
    check_host_with_minimum(host, constants::MINIMUM_KERNEL)
}

/// `Ok(false)` means the host is fine to inspect but cannot run the plugin.
pub fn check_host_with_minimum(
    host: &dyn HostHandler,
    minimum: &str,
) -> Result<bool, Report<HostCheckError>> {
    debug!("Checking kernel version");
    let version = host
        .kernel_version()
        .change_context(HostCheckError::KernelVersion)?;

    let actual = kernel_version_ordinal(&version).change_context_lazy(|| {
        HostCheckError::ActualKernelOrdinal {
            version: version.clone(),
        }
    })?;
    let required = kernel_version_ordinal(minimum).change_context_lazy(|| {
        HostCheckError::MinimumKernelOrdinal {
            version: minimum.to_string(),
        }
    })?;

    if actual < required {
        warn!("Kernel version {version} is below minimum requirement {minimum}");
        return Ok(false);
    }
    debug!("Kernel version {version} meets minimum requirement {minimum}");

    debug!("Checking host for libbpf");
    let libs = host.libbpf().change_context(HostCheckError::Libbpf)?;
    if libs.is_empty() {
        warn!("Libbpf not found on host");
        return Ok(false);
    }

    debug!("Libbpf found on host:");
    for lib in &libs {
        debug!("\t{}", lib.display());
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::PathBuf;

    use test_log::test;

    use super::*;
    use crate::mock::MockHost;

    fn libbpf() -> Vec<PathBuf> {
        vec![PathBuf::from("/usr/lib64/libbpf.so.1")]
    }

    #[test]
    fn kernel_below_minimum_is_a_false_verdict() {
        let host = MockHost::new("4.15.0-20-generic", libbpf());
        assert!(!check_host(&host).unwrap());
        assert_eq!(host.libbpf_calls(), 0, "libbpf must not be looked up");
    }

    #[test]
    fn verdict_table() {
        let cases = [
            ("4.18.0", "4.18.0", true, true),
            ("4.18.1", "4.18.0", true, true),
            ("5.10.1", "5.9", true, true),
            ("5.9", "5.10.1", true, false),
            ("5.15.0", "4.18.0", false, false),
            ("6.1", "6.1.0", false, false),
        ];

        for (actual, minimum, has_lib, expected) in cases {
            let libs = if has_lib { libbpf() } else { Vec::new() };
            let host = MockHost::new(actual, libs);
            assert_eq!(
                check_host_with_minimum(&host, minimum).unwrap(),
                expected,
                "actual {actual} minimum {minimum} libbpf {has_lib}"
            );
        }
    }

    #[test]
    fn unparseable_actual_version_is_an_error() {
        let host = MockHost::new("garbage", libbpf());
        let err = check_host(&host).unwrap_err();
        assert!(matches!(
            err.current_context(),
            HostCheckError::ActualKernelOrdinal { .. }
        ));
    }

    #[test]
    fn unparseable_minimum_version_is_an_error() {
        let host = MockHost::new("5.15.0", libbpf());
        let err = check_host_with_minimum(&host, "x.y").unwrap_err();
        assert!(matches!(
            err.current_context(),
            HostCheckError::MinimumKernelOrdinal { .. }
        ));
    }

    #[test]
    fn host_query_failures_are_errors() {
        let host = MockHost::new("5.15.0", libbpf())
            .with_kernel_error(io::Error::new(io::ErrorKind::PermissionDenied, "uname"));
        let err = check_host(&host).unwrap_err();
        assert!(matches!(err.current_context(), HostCheckError::KernelVersion));

        let host = MockHost::new("5.15.0", libbpf())
            .with_libbpf_error(io::Error::new(io::ErrorKind::Other, "glob"));
        let err = check_host(&host).unwrap_err();
        assert!(matches!(err.current_context(), HostCheckError::Libbpf));
    }
}
