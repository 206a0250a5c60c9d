//! Monitor manager: the control channel daemons use to create, query and
//! tear down monitor instances.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::memory::PageAllocator;
use crate::monitor::{Monitor, MonitorId, MonitorStatus};

/// Requests a daemon can make of the privileged side.
pub trait ControlChannel {
    /// Create a monitor and return its id.
    fn create_monitor(&mut self, config: MonitorConfig) -> Result<MonitorId>;

    /// Tear down a monitor, releasing its memory.
    fn destroy_monitor(&mut self, id: MonitorId) -> Result<()>;

    /// Query a monitor's condition.
    fn status(&self, id: MonitorId) -> Result<MonitorStatus>;
}

/// Owns every monitor and the page allocator they share.
#[derive(Debug)]
pub struct Manager {
    allocator: Arc<PageAllocator>,
    monitors: BTreeMap<MonitorId, Monitor>,
    next_id: MonitorId,
}

impl Manager {
    /// Create a manager that may hand out at most `page_limit` guest pages
    /// across all monitors.
    pub fn new(page_limit: usize) -> Self {
        Self {
            allocator: PageAllocator::new(page_limit),
            monitors: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn allocator(&self) -> &Arc<PageAllocator> {
        &self.allocator
    }

    pub fn monitor(&self, id: MonitorId) -> Result<&Monitor> {
        self.monitors.get(&id).ok_or_else(|| not_found(id))
    }

    pub fn monitor_mut(&mut self, id: MonitorId) -> Result<&mut Monitor> {
        self.monitors.get_mut(&id).ok_or_else(|| not_found(id))
    }

    /// Ids of live monitors.
    pub fn ids(&self) -> impl Iterator<Item = MonitorId> + '_ {
        self.monitors.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }
}

fn not_found(id: MonitorId) -> Error {
    Error::DeviceNotFound(format!("monitor {}", id))
}

impl ControlChannel for Manager {
    fn create_monitor(&mut self, config: MonitorConfig) -> Result<MonitorId> {
        let id = self.next_id;
        let monitor = Monitor::new(id, config, &self.allocator)?;
        self.monitors.insert(id, monitor);
        self.next_id += 1;
        Ok(id)
    }

    fn destroy_monitor(&mut self, id: MonitorId) -> Result<()> {
        let monitor = self.monitors.remove(&id).ok_or_else(|| not_found(id))?;
        tracing::info!(id, pages = monitor.status().pages_mapped, "destroying monitor");
        drop(monitor);
        Ok(())
    }

    fn status(&self, id: MonitorId) -> Result<MonitorStatus> {
        self.monitor(id).map(Monitor::status)
    }
}
