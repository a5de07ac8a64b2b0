//! Connection options shared by every target family.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FwupError, Result};
use crate::transport::DeviceSelector;

/// Options used to find and connect to a bootloader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetOptions {
    /// Which device to use; unset IDs fall back to the family's defaults.
    pub selector: DeviceSelector,
    /// Keep polling until a device shows up instead of failing at once.
    pub wait: bool,
    /// Give up waiting after this long. Waits forever when unset.
    pub wait_timeout_ms: Option<u64>,
    /// Skip the extra per-page write delay (Micronucleus).
    pub fast_mode: bool,
    /// Ask run-time DFU devices to switch to DFU mode.
    pub detach: bool,
    /// How long a detached DFU device gets to re-enumerate.
    pub detach_timeout_ms: u64,
    /// How long a device that dropped off the bus while erasing gets to return.
    pub reconnect_timeout_ms: u64,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            selector: DeviceSelector::default(),
            wait: true,
            wait_timeout_ms: None,
            fast_mode: false,
            detach: true,
            detach_timeout_ms: 5000,
            reconnect_timeout_ms: 5000,
        }
    }
}

impl TargetOptions {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| FwupError::Config(format!("{}: {e}", path.as_ref().display())))?;
        toml::from_str(&content).map_err(|e| FwupError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| FwupError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| FwupError::Config(format!("{}: {e}", path.as_ref().display())))
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn detach_timeout(&self) -> Duration {
        Duration::from_millis(self.detach_timeout_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }
}
