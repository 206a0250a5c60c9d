//! Builder for monitor configurations.

use std::path::PathBuf;

use crate::config::{
    BlockDeviceConfig, ConsoleConfig, MonitorConfig, NetworkDeviceConfig, VideoDeviceConfig,
};
use crate::device::network::parse_mac;
use crate::error::Result;

/// Builder for creating a [`MonitorConfig`].
///
/// # Example
///
/// ```rust,no_run
/// use colinux::{Manager, MonitorBuilder};
/// use colinux::manager::ControlChannel;
///
/// let config = MonitorBuilder::new()
///     .memory_mb(64)
///     .block_device(0, "/path/to/root.img")
///     .network_device(0, Some("00:ff:12:34:56:78"))
///     .console(80, 25, 200)
///     .build()?;
///
/// let mut manager = Manager::new(64 * 1024 * 1024 / 4096);
/// let id = manager.create_monitor(config)?;
/// # Ok::<(), colinux::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct MonitorBuilder {
    memory_mb: Option<u32>,
    window_base: Option<u64>,
    queue_capacity: Option<usize>,
    block_devices: Vec<BlockDeviceConfig>,
    network_devices: Vec<(u32, Option<String>)>,
    console: Option<ConsoleConfig>,
    video_devices: Vec<VideoDeviceConfig>,
}

impl MonitorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the amount of guest memory in megabytes.
    ///
    /// Default: 32 MB
    pub fn memory_mb(mut self, mb: u32) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    /// Set the first guest pseudo-physical address.
    ///
    /// Default: `0xC000_0000`
    pub fn window_base(mut self, base: u64) -> Self {
        self.window_base = Some(base);
        self
    }

    /// Set the depth of per-endpoint message queues.
    ///
    /// Default: 1024
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Add a read-write block unit backed by `path`.
    pub fn block_device(mut self, unit: u32, path: impl Into<PathBuf>) -> Self {
        self.block_devices.push(BlockDeviceConfig {
            unit,
            path: path.into(),
            alias: None,
            readonly: false,
        });
        self
    }

    /// Add a block unit with every option spelled out.
    pub fn block_device_config(mut self, config: BlockDeviceConfig) -> Self {
        self.block_devices.push(config);
        self
    }

    /// Add a network unit. `None` leaves it disabled.
    pub fn network_device(mut self, unit: u32, mac: Option<&str>) -> Self {
        self.network_devices.push((unit, mac.map(str::to_string)));
        self
    }

    /// Set the console geometry.
    ///
    /// Default: 80x25 without scrollback
    pub fn console(mut self, cols: u16, rows: u16, max_rows: u16) -> Self {
        self.console = Some(ConsoleConfig { cols, rows, max_rows });
        self
    }

    /// Add a framebuffer unit.
    pub fn video_device(mut self, unit: u32, width: u32, height: u32, bpp: u32) -> Self {
        self.video_devices.push(VideoDeviceConfig {
            unit,
            width,
            height,
            bpp,
        });
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<MonitorConfig> {
        let defaults = MonitorConfig::default();

        let network_devices = self
            .network_devices
            .into_iter()
            .map(|(unit, mac)| {
                Ok(NetworkDeviceConfig {
                    unit,
                    mac: mac.as_deref().map(parse_mac).transpose()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let config = MonitorConfig {
            memory_mb: self.memory_mb.unwrap_or(defaults.memory_mb),
            window_base: self.window_base.unwrap_or(defaults.window_base),
            queue_capacity: self.queue_capacity.unwrap_or(defaults.queue_capacity),
            block_devices: self.block_devices,
            network_devices,
            console: self.console.unwrap_or(defaults.console),
            video_devices: self.video_devices,
        };
        config.validate()?;
        Ok(config)
    }
}
