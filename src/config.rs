//! Monitor configuration.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::device::{Console, DeviceClass, VideoDevice};
use crate::error::{Error, Result};
use crate::memory::layout::KERNEL_OFFSET;
use crate::message::MAX_SNAPSHOT_SIZE;

/// Default guest memory size in megabytes.
pub const DEFAULT_MEMORY_MB: u32 = 32;

/// Default per-endpoint queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A file-backed block unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceConfig {
    pub unit: u32,
    pub path: PathBuf,
    pub alias: Option<String>,
    pub readonly: bool,
}

/// A network unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDeviceConfig {
    pub unit: u32,
    /// `None` leaves the unit disabled
    pub mac: Option<[u8; 6]>,
}

/// Console geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleConfig {
    pub cols: u16,
    pub rows: u16,
    /// Screen plus scrollback rows
    pub max_rows: u16,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 25,
            max_rows: 25,
        }
    }
}

/// A framebuffer unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoDeviceConfig {
    pub unit: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

/// Everything needed to create a monitor instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub memory_mb: u32,
    pub window_base: u64,
    pub queue_capacity: usize,
    pub block_devices: Vec<BlockDeviceConfig>,
    pub network_devices: Vec<NetworkDeviceConfig>,
    pub console: ConsoleConfig,
    pub video_devices: Vec<VideoDeviceConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            memory_mb: DEFAULT_MEMORY_MB,
            window_base: KERNEL_OFFSET,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            block_devices: Vec::new(),
            network_devices: Vec::new(),
            console: ConsoleConfig::default(),
            video_devices: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Guest memory size in bytes.
    pub fn memory_size(&self) -> u64 {
        self.memory_mb as u64 * 1024 * 1024
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.memory_mb == 0 {
            return Err(Error::InvalidMemorySize(self.memory_mb));
        }
        if self.window_base.checked_add(self.memory_size()).is_none() {
            return Err(Error::InvalidConfig(format!(
                "{} MB at 0x{:x} overflows the address space",
                self.memory_mb, self.window_base
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue capacity must be > 0".to_string()));
        }

        let console = &self.console;
        if !(2..=500).contains(&console.rows) || console.cols < 16 {
            return Err(Error::InvalidConfig(format!(
                "console {}x{} out of range",
                console.cols, console.rows
            )));
        }
        if console.max_rows < console.rows {
            return Err(Error::InvalidConfig(format!(
                "console max_rows {} below rows {}",
                console.max_rows, console.rows
            )));
        }
        let console_snapshot = Console::max_snapshot_size(console.cols, console.rows, console.max_rows);
        if console_snapshot > MAX_SNAPSHOT_SIZE {
            return Err(Error::InvalidConfig(format!(
                "console {}x{} with {} rows kept needs a {} byte snapshot ({} max)",
                console.cols, console.rows, console.max_rows, console_snapshot, MAX_SNAPSHOT_SIZE
            )));
        }
        for video in &self.video_devices {
            let size = VideoDevice::snapshot_size(video.width, video.height);
            if size > MAX_SNAPSHOT_SIZE as u64 {
                return Err(Error::InvalidConfig(format!(
                    "video{} {}x{} needs a {} byte snapshot ({} max)",
                    video.unit, video.width, video.height, size, MAX_SNAPSHOT_SIZE
                )));
            }
        }

        check_units(DeviceClass::Block, self.block_devices.iter().map(|d| d.unit))?;
        check_units(DeviceClass::Network, self.network_devices.iter().map(|d| d.unit))?;
        check_units(DeviceClass::Video, self.video_devices.iter().map(|d| d.unit))?;
        Ok(())
    }
}

fn check_units(class: DeviceClass, units: impl Iterator<Item = u32>) -> Result<()> {
    let mut seen = HashSet::new();
    for unit in units {
        if unit >= class.max_units() {
            return Err(Error::InvalidConfig(format!(
                "{} unit {} out of range (max {})",
                class,
                unit,
                class.max_units() - 1
            )));
        }
        if !seen.insert(unit) {
            return Err(Error::InvalidConfig(format!("{} unit {} configured twice", class, unit)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = MonitorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.memory_size(), 32 * 1024 * 1024);
        assert_eq!(config.window_base, 0xC000_0000);
    }

    #[test]
    fn test_console_bounds() {
        let mut config = MonitorConfig::default();
        config.console.rows = 1;
        assert!(config.validate().is_err());

        config.console = ConsoleConfig { cols: 15, rows: 25, max_rows: 25 };
        assert!(config.validate().is_err());

        config.console = ConsoleConfig { cols: 80, rows: 501, max_rows: 600 };
        assert!(config.validate().is_err());

        config.console = ConsoleConfig { cols: 80, rows: 50, max_rows: 40 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unit_checks() {
        let mut config = MonitorConfig::default();
        config.network_devices = vec![
            NetworkDeviceConfig { unit: 0, mac: None },
            NetworkDeviceConfig { unit: 0, mac: None },
        ];
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.network_devices.clear();
        config.video_devices = vec![VideoDeviceConfig { unit: 2, width: 640, height: 480, bpp: 32 }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_attach_snapshots_must_fit_one_message() {
        let mut config = MonitorConfig::default();
        config.console = ConsoleConfig { cols: 80, rows: 25, max_rows: 1000 };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        // 80 columns of two-byte cells: 819 rows fit, 820 do not.
        config.console.max_rows = 819;
        config.validate().unwrap();
        config.console.max_rows = 820;
        assert!(config.validate().is_err());

        config.console = ConsoleConfig::default();
        config.video_devices = vec![VideoDeviceConfig { unit: 0, width: 640, height: 480, bpp: 32 }];
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        config.video_devices[0] = VideoDeviceConfig { unit: 0, width: 160, height: 120, bpp: 16 };
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_memory() {
        let config = MonitorConfig {
            memory_mb: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidMemorySize(0))));
    }
}
