//! Helpers shared by the device plugin crates.

pub mod fs;
pub mod logging;
pub mod version;
