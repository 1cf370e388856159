//! Daemon settings, loaded from a TOML file. Every field has a default, so an empty file is a
//! valid configuration for an AXI board with the standard system paths.
//!
//! ```toml
//! [device]
//! backend = "pci"
//! pci_device = "uio0"
//!
//! [timing]
//! watchdog_interval_ms = 500
//! ```

use crate::error::{
    Error,
    Result,
};
use serde::Deserialize;
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Zynq SoC, cores exposed through UIO and loaded as device tree overlays
    #[default]
    Axi,
    /// PCIe board with a partial reconfiguration controller
    Pci,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub backend: BackendKind,
    /// UIO device of the PCIe board
    pub pci_device: String,
    /// Root of the firmware directory, holding one directory per profile
    pub firmware_dir: PathBuf,
    /// Name of the configfs overlay directory
    pub overlay_name: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Axi,
            pci_device: "uio0".to_owned(),
            firmware_dir: PathBuf::from("/usr/lib/firmware/zbnt"),
            overlay_name: "zbnt_pl".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub sysfs: PathBuf,
    pub configfs: PathBuf,
    pub dev: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            sysfs: PathBuf::from("/sys"),
            configfs: PathBuf::from("/sys/kernel/config"),
            dev: PathBuf::from("/dev"),
        }
    }
}

/// Delays and timeouts of the run protocol
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Longest the interrupt worker blocks before checking the watchdog
    pub interrupt_wait_ms: u64,
    /// Period of the run time limit check
    pub watchdog_interval_ms: u64,
    /// How long the timer is held in reset when a run stops
    pub timer_settle_ms: u64,
    pub flush_poll_us: u64,
    /// Longest a stopping run waits for the DMA FIFO to drain
    pub flush_timeout_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            interrupt_wait_ms: 1000,
            watchdog_interval_ms: 2000,
            timer_settle_ms: 100,
            flush_poll_us: 100,
            flush_timeout_ms: 1000,
        }
    }
}

impl Timing {
    #[must_use]
    pub fn interrupt_wait(&self) -> Duration {
        Duration::from_millis(self.interrupt_wait_ms)
    }

    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    #[must_use]
    pub fn timer_settle(&self) -> Duration {
        Duration::from_millis(self.timer_settle_ms)
    }

    #[must_use]
    pub fn flush_poll(&self) -> Duration {
        Duration::from_micros(self.flush_poll_us)
    }

    #[must_use]
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device: DeviceSettings,
    pub paths: PathSettings,
    pub timing: Timing,
    pub logging: LoggingSettings,
}

impl Settings {
    /// # Errors
    /// Returns an error if `text` isn't valid TOML or has fields of the wrong type
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// # Errors
    /// Returns an error if the file can't be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    /// Firmware directory of the profile `name`
    /// # Errors
    /// Returns an error if `name` is empty or would leave the firmware directory
    pub fn profile_dir(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == ".." {
            return Err(Error::Profile(name.to_owned()));
        }
        Ok(self.device.firmware_dir.join(name))
    }
}
