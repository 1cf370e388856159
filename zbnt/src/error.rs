//! The error type shared by the device, its backends and the run protocol

use kstring::KString;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Fdt(#[from] zbnt_utils::fdt::Error),
    #[error(transparent)]
    Firmware(#[from] zbnt_utils::firmware::Error),
    #[error(transparent)]
    Settings(#[from] toml::de::Error),
    #[error("Invalid profile name `{0}`")]
    Profile(String),
    #[error("Bitstream `{0}` is not in the catalog")]
    UnknownBitstream(KString),
    #[error("Can't read the device tree of bitstream `{name}`")]
    DeviceTree {
        name: KString,
        #[source]
        source: std::io::Error,
    },
    #[error("The device tree overlay was rejected")]
    Overlay(#[source] std::io::Error),
    #[error("Node `{node}` lacks a valid value for `{property}`")]
    Property { node: KString, property: &'static str },
    #[error("Found more than one {0}")]
    Duplicate(&'static str),
    #[error("The bitstream doesn't provide a {0}")]
    Missing(&'static str),
    #[error("Failed to create core `{name}`")]
    Core {
        name: KString,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Too many cores, index {0} collides with a reserved index")]
    TooManyCores(u32),
    #[error("Register window needs {needed} bytes but only {available} are mapped")]
    WindowTooSmall { needed: usize, available: usize },
    #[error("No register window named `{0}`")]
    NoWindow(KString),
    #[error("{what} did not respond within {timeout:?}")]
    Unresponsive {
        what: &'static str,
        timeout: Duration,
    },
    #[error("Partial reconfiguration failed with status {0:#010x}")]
    Reconfiguration(u32),
    #[error("Invalid PCI device: {0}")]
    PciDevice(String),
    #[error("Invalid region header in map `{0}`")]
    RegionHeader(&'static str),
    #[error("Message payload of {0} bytes doesn't fit in a frame")]
    PayloadTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
