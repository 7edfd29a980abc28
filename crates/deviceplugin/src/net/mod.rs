//! Network interface enumeration and AF_XDP socket creation.

mod sysfs;
mod xsk;

use std::io;

pub use sysfs::SysfsNet;
pub use xsk::AfXdpSocketFactory;
pub use xsk::SocketFactory;

/// Operational state of a link as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum LinkState {
    #[display("up")]
    Up,
    #[display("down")]
    Down,
    #[display("unknown")]
    Unknown,
}

impl LinkState {
    /// Parses the content of `/sys/class/net/<if>/operstate`.
    pub fn from_operstate(raw: &str) -> Self {
        match raw.trim() {
            "up" => Self::Up,
            "down" | "lowerlayerdown" | "notpresent" => Self::Down,
            _ => Self::Unknown,
        }
    }
}

/// A physical network interface present on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    /// Kernel driver bound to the backing device.
    pub driver: Option<String>,
    pub mac: Option<String>,
    /// PCI address of the backing device, e.g. `0000:18:00.0`.
    pub pci: Option<String>,
    pub link: LinkState,
}

impl NetInterface {
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: Some(driver.into()),
            mac: None,
            pci: None,
            link: LinkState::Up,
        }
    }

    pub fn with_link(mut self, link: LinkState) -> Self {
        self.link = link;
        self
    }
}

/// Enumerates host interfaces.
pub trait NetHandler: Send + Sync {
    /// Every physical interface currently present on the host.
    fn interfaces(&self) -> io::Result<Vec<NetInterface>>;
}
