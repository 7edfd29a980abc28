//! Test doubles for the host, network and socket seams.

use std::collections::HashSet;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::host::HostHandler;
use crate::net::LinkState;
use crate::net::NetHandler;
use crate::net::NetInterface;
use crate::net::SocketFactory;

/// Fixed kernel release and library list.
#[derive(Debug)]
pub struct MockHost {
    kernel: Result<String, (io::ErrorKind, String)>,
    libbpf: Result<Vec<PathBuf>, (io::ErrorKind, String)>,
    libbpf_calls: AtomicUsize,
}

impl MockHost {
    pub fn new(kernel: impl Into<String>, libbpf: Vec<PathBuf>) -> Self {
        Self {
            kernel: Ok(kernel.into()),
            libbpf: Ok(libbpf),
            libbpf_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_kernel_error(mut self, err: io::Error) -> Self {
        self.kernel = Err((err.kind(), err.to_string()));
        self
    }

    pub fn with_libbpf_error(mut self, err: io::Error) -> Self {
        self.libbpf = Err((err.kind(), err.to_string()));
        self
    }

    pub fn libbpf_calls(&self) -> usize {
        self.libbpf_calls.load(Ordering::SeqCst)
    }
}

impl HostHandler for MockHost {
    fn kernel_version(&self) -> io::Result<String> {
        self.kernel
            .clone()
            .map_err(|(kind, msg)| io::Error::new(kind, msg))
    }

    fn libbpf(&self) -> io::Result<Vec<PathBuf>> {
        self.libbpf_calls.fetch_add(1, Ordering::SeqCst);
        self.libbpf
            .clone()
            .map_err(|(kind, msg)| io::Error::new(kind, msg))
    }
}

/// A mutable list of interfaces.
#[derive(Debug, Default)]
pub struct MockNet {
    interfaces: Mutex<Vec<NetInterface>>,
    failing: Mutex<bool>,
}

impl MockNet {
    pub fn new(interfaces: Vec<NetInterface>) -> Self {
        Self {
            interfaces: Mutex::new(interfaces),
            failing: Mutex::new(false),
        }
    }

    pub fn set_interfaces(&self, interfaces: Vec<NetInterface>) {
        *self.interfaces.lock().unwrap() = interfaces;
    }

    pub fn set_link(&self, name: &str, link: LinkState) {
        for interface in self.interfaces.lock().unwrap().iter_mut() {
            if interface.name == name {
                interface.link = link;
            }
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

impl NetHandler for MockNet {
    fn interfaces(&self) -> io::Result<Vec<NetInterface>> {
        if *self.failing.lock().unwrap() {
            return Err(io::Error::other("interface listing failed"));
        }
        Ok(self.interfaces.lock().unwrap().clone())
    }
}

/// Hands out one end of a datagram pair per device. The first datagram
/// queued on it is the device name, so a test holding a transferred
/// descriptor can tell which device it belongs to. See [`read_identity`].
#[derive(Debug, Default)]
pub struct MockSocketFactory {
    failing: HashSet<String>,
    created: Mutex<Vec<String>>,
}

impl MockSocketFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creating a socket for `device` fails.
    pub fn with_failure(mut self, device: impl Into<String>) -> Self {
        self.failing.insert(device.into());
        self
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl SocketFactory for MockSocketFactory {
    fn create(&self, device: &str) -> io::Result<OwnedFd> {
        if self.failing.contains(device) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("interface {device} not found"),
            ));
        }
        let (writer, socket) = UnixDatagram::pair()?;
        writer.send(device.as_bytes())?;
        self.created.lock().unwrap().push(device.to_string());
        Ok(OwnedFd::from(socket))
    }
}

/// Device name carried by a socket from [`MockSocketFactory`].
pub fn read_identity(socket: OwnedFd) -> io::Result<String> {
    let socket = UnixDatagram::from(socket);
    let mut buf = [0u8; 64];
    let n = socket.recv(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}
