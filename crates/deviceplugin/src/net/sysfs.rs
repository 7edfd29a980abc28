use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

use super::LinkState;
use super::NetHandler;
use super::NetInterface;

/// [`NetHandler`] reading `/sys/class/net`.
///
/// Only interfaces backed by a device (`<if>/device`) are reported, which
/// leaves out loopback, bridges, veths and other virtual links.
#[derive(Debug, Clone)]
pub struct SysfsNet {
    root: PathBuf,
}

impl Default for SysfsNet {
    fn default() -> Self {
        Self::new("/sys/class/net")
    }
}

impl SysfsNet {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_interface(&self, dir: &Path, name: String) -> Option<NetInterface> {
        let device = dir.join("device");
        if !device.exists() {
            return None;
        }

        let link_name = |path: PathBuf| {
            fs::read_link(path)
                .ok()
                .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
        };
        let read_trimmed = |file: &str| {
            fs::read_to_string(dir.join(file))
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        Some(NetInterface {
            driver: link_name(device.join("driver")),
            pci: link_name(device),
            mac: read_trimmed("address"),
            link: read_trimmed("operstate")
                .map(|s| LinkState::from_operstate(&s))
                .unwrap_or(LinkState::Unknown),
            name,
        })
    }
}

impl NetHandler for SysfsNet {
    fn interfaces(&self) -> io::Result<Vec<NetInterface>> {
        let mut interfaces = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.read_interface(&entry.path(), name.clone()) {
                Some(interface) => interfaces.push(interface),
                None => debug!("skipping virtual interface {name}"),
            }
        }
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(interfaces)
    }
}
