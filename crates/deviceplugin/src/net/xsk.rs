use std::ffi::CString;
use std::io;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

/// Creates the kernel-bypass socket handed to a workload for one device.
pub trait SocketFactory: Send + Sync {
    fn create(&self, device: &str) -> io::Result<OwnedFd>;
}

/// Creates `AF_XDP` sockets in the plugin's network namespace, which is the
/// namespace the physical device lives in. UMEM registration and bind are
/// left to the receiving side.
#[derive(Debug, Clone, Copy, Default)]
pub struct AfXdpSocketFactory;

impl SocketFactory for AfXdpSocketFactory {
    fn create(&self, device: &str) -> io::Result<OwnedFd> {
        let name = CString::new(device)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: name is a valid NUL-terminated string.
        if unsafe { libc::if_nametoindex(name.as_ptr()) } == 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("interface {device} not found"),
            ));
        }

        // SAFETY: plain socket(2) call, the result is checked before use.
        let fd = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by socket(2) and is owned by nobody else.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}
