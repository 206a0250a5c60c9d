//! # colinux
//!
//! Monitor data plane for a guest kernel that runs cooperatively beside
//! the host kernel.
//!
//! The crate covers the parts of a monitor that move bytes:
//!
//! - [`memory`]: guest pseudo-physical memory, one host page per frame
//! - [`transfer`]: chunked copies between guest ranges and host buffers
//! - [`message`]: the framed envelope format and the message switch
//! - [`device`]: block, console, network and video device backends
//! - [`reactor`]: the readiness loop host daemons run (unix only)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use colinux::manager::ControlChannel;
//! use colinux::message::EndpointId;
//! use colinux::{Manager, MonitorBuilder, Result};
//!
//! fn main() -> Result<()> {
//!     let config = MonitorBuilder::new()
//!         .memory_mb(64)
//!         .block_device(0, "/path/to/root.img")
//!         .build()?;
//!
//!     let mut manager = Manager::new(64 * 256);
//!     let id = manager.create_monitor(config)?;
//!
//!     let monitor = manager.monitor_mut(id)?;
//!     let _daemon = monitor.connect(EndpointId::DAEMON..=EndpointId::DAEMON, 64);
//!     monitor.start()?;
//!     Ok(())
//! }
//! ```

mod builder;
pub mod config;
pub mod debug;
mod error;
pub mod manager;
pub mod monitor;

pub mod device;
pub mod memory;
pub mod message;
#[cfg(unix)]
pub mod reactor;
pub mod transfer;

// Re-exports
pub use builder::MonitorBuilder;
pub use config::MonitorConfig;
pub use error::{Error, Result};
pub use manager::{ControlChannel, Manager};
pub use memory::{GuestMemory, PageAllocator};
pub use message::{Delivery, EndpointId, Message, MessageKind, Priority};
pub use monitor::{Monitor, MonitorId, MonitorState, MonitorStatus};
#[cfg(unix)]
pub use reactor::Reactor;
pub use transfer::Direction;
