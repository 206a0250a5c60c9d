//! Monitor: one guest instance's data plane.
//!
//! A monitor owns the guest's pseudo-physical memory, the message switch
//! and the peripheral device tables. Envelopes for endpoints served inside
//! the monitor (console, framebuffers) go through a static table of local
//! handlers; everything else goes through the switch.

use std::collections::HashSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::MonitorConfig;
use crate::device::{
    BlockDevice, Completion, Console, ConsoleOp, DeviceClass, DeviceRequest, DeviceTables,
    NetworkDevice, RequestStatus, VideoDevice,
};
use crate::error::{Error, Result};
use crate::memory::layout::PASSAGE_MESSAGE_MAX;
use crate::memory::{GuestMemory, GuestWindow, PageAllocator};
use crate::message::wire::decode_all;
use crate::message::{
    limits, DaemonMessage, Delivery, EndpointId, LifecycleMessage, LinuxMessage, Message,
    MessageKind, MessageQueue, PowerMessage, Priority, Router, Target, TerminationReason,
    MAX_SNAPSHOT_SIZE,
};

/// Identifier of a monitor within its manager.
pub type MonitorId = u32;

/// The state of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Memory populated and devices initialized.
    Initialized,
    /// Guest is running.
    Running,
    /// Guest stopped; only teardown remains.
    Terminated,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorState::Initialized => write!(f, "initialized"),
            MonitorState::Running => write!(f, "running"),
            MonitorState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Snapshot of a monitor's condition, as reported over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub pages_mapped: usize,
    pub pending_messages: usize,
    pub termination: Option<TerminationReason>,
}

type LocalHandler = fn(&mut Monitor, Message) -> Result<Delivery>;

struct LocalRoute {
    first: EndpointId,
    last: EndpointId,
    handler: LocalHandler,
}

/// Endpoints served inside the monitor.
const LOCAL_ROUTES: &[LocalRoute] = &[
    LocalRoute {
        first: EndpointId::CONSOLE,
        last: EndpointId::CONSOLE,
        handler: Monitor::console_message,
    },
    LocalRoute {
        first: EndpointId::COVIDEO0,
        last: EndpointId(EndpointId::COVIDEO0.0 + limits::MAX_COVIDEO - 1),
        handler: Monitor::video_message,
    },
];

/// One guest instance.
pub struct Monitor {
    id: MonitorId,
    state: MonitorState,
    config: MonitorConfig,
    memory: GuestMemory,
    router: Router,
    devices: DeviceTables,
    /// Device endpoints with an attached consumer
    attached: HashSet<EndpointId>,
    termination: Option<TerminationReason>,
}

impl Monitor {
    /// Create a monitor: populate guest memory from `allocator`, install
    /// the guest kernel's queue and register the configured devices.
    pub fn new(id: MonitorId, config: MonitorConfig, allocator: &Arc<PageAllocator>) -> Result<Self> {
        config.validate()?;

        let window = GuestWindow::new(config.window_base, config.memory_size())?;
        let mut memory = GuestMemory::new(window);
        memory.populate(allocator)?;

        let mut router = Router::new(EndpointId::KERNEL_SWITCH);
        router.set_rule(EndpointId::LINUX, Target::Queue(MessageQueue::new(config.queue_capacity)));

        let mut devices = DeviceTables::new();
        for block in &config.block_devices {
            let mut device = BlockDevice::new(block.unit, &block.path)?.readonly(block.readonly);
            if let Some(alias) = &block.alias {
                device = device.with_alias(alias.clone());
            }
            devices.block.register(block.unit, Box::new(device))?;
        }
        for net in &config.network_devices {
            devices
                .network
                .register(net.unit, Box::new(NetworkDevice::new(net.unit, net.mac)))?;
        }
        for video in &config.video_devices {
            let device = VideoDevice::new(video.unit, video.width, video.height, video.bpp)?;
            devices.video.register(video.unit, Box::new(device))?;
        }
        let console = &config.console;
        devices.console.register(
            0,
            Box::new(Console::new(console.cols, console.rows, console.max_rows)),
        )?;
        devices.init_all(&mut memory)?;

        tracing::info!(
            id,
            memory_mb = config.memory_mb,
            base = format_args!("0x{:x}", config.window_base),
            block = devices.block.len(),
            network = devices.network.len(),
            "monitor created"
        );

        Ok(Self {
            id,
            state: MonitorState::Initialized,
            config,
            memory,
            router,
            devices,
            attached: HashSet::new(),
            termination: None,
        })
    }

    pub fn id(&self) -> MonitorId {
        self.id
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.memory
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn devices_mut(&mut self) -> &mut DeviceTables {
        &mut self.devices
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            state: self.state,
            pages_mapped: self.memory.frames().mapped_count(),
            pending_messages: self.pending_linux_messages(),
            termination: self.termination,
        }
    }

    /// Start running the guest.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            MonitorState::Initialized => {
                self.state = MonitorState::Running;
                tracing::info!(id = self.id, "monitor running");
                Ok(())
            }
            _ => Err(Error::InvalidState {
                expected: MonitorState::Initialized.to_string(),
                actual: self.state.to_string(),
            }),
        }
    }

    /// Connect a host daemon to `endpoints`.
    ///
    /// Envelopes for those endpoints are serialized onto the returned
    /// channel, which holds at most `capacity` of them.
    pub fn connect(
        &mut self,
        endpoints: RangeInclusive<EndpointId>,
        capacity: usize,
    ) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tracing::debug!(first = %endpoints.start(), last = %endpoints.end(), "daemon connected");
        self.router.set_rule_range(endpoints, Target::Channel(tx));
        rx
    }

    /// Disconnect the daemon serving `endpoint`.
    pub fn disconnect(&mut self, endpoint: EndpointId) -> bool {
        self.attached.remove(&endpoint);
        self.router.free_rule(endpoint)
    }

    /// Check if a consumer is attached to a device endpoint.
    pub fn is_attached(&self, endpoint: EndpointId) -> bool {
        self.attached.contains(&endpoint)
    }

    /// Deliver one envelope.
    pub fn route(&mut self, message: Message) -> Result<Delivery> {
        let to = message.to();
        if let Some(route) = LOCAL_ROUTES.iter().find(|r| to >= r.first && to <= r.last) {
            return (route.handler)(self, message);
        }

        if message.from() == EndpointId::LINUX && to.is_unit() && !self.router.has_rule(to) {
            crate::debug_router!(%to, "unit not attached");
            return Ok(Delivery::NotPresent);
        }

        self.router.route(message)
    }

    /// Route every envelope in a buffer written by a host daemon.
    ///
    /// All envelopes are attempted; the first error is returned.
    pub fn message_from_user(&mut self, data: &[u8]) -> Result<usize> {
        let messages = decode_all(data)?;
        let count = messages.len();
        let mut first_error = None;
        for message in messages {
            if let Err(e) = self.route(message) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Envelopes waiting for the guest kernel.
    pub fn pending_linux_messages(&self) -> usize {
        self.router.queue(EndpointId::LINUX).map_or(0, MessageQueue::len)
    }

    /// Move at most one queued envelope for the guest kernel into the
    /// passage buffer. Returns how many envelopes are still queued.
    ///
    /// An envelope that does not fit the passage stays queued.
    pub fn send_messages_to_linux(&mut self, passage: &mut Vec<u8>) -> Result<usize> {
        passage.clear();
        let queue = self
            .router
            .queue_mut(EndpointId::LINUX)
            .ok_or(Error::RoutingFailed(EndpointId::LINUX))?;

        match queue.peek().map(Message::wire_size) {
            None => return Ok(0),
            Some(size) if size > PASSAGE_MESSAGE_MAX => {
                tracing::warn!(size, max = PASSAGE_MESSAGE_MAX, "message too large for passage");
            }
            Some(_) => {
                if let Some(message) = queue.pop() {
                    message.encode_into(passage)?;
                }
            }
        }
        Ok(queue.len())
    }

    /// Serve a synchronous guest device request.
    ///
    /// Errors never escape: they become the guest-visible status.
    pub fn device_request(&mut self, class: DeviceClass, unit: u32, request: &DeviceRequest) -> Completion {
        let device = match self.devices.table_mut(class).and_then(|t| t.get_mut(unit)) {
            Some(device) => device,
            None => {
                crate::debug_device!(%class, unit, "request for missing unit");
                return Completion::failed(RequestStatus::NotPresent);
            }
        };

        match device.request(&mut self.memory, request) {
            Ok(reply) => Completion::ok(reply),
            Err(e) => {
                tracing::warn!(%class, unit, error = %e, "device request failed");
                Completion::failed(RequestStatus::Error)
            }
        }
    }

    /// Guest kernel debug output for the daemon.
    pub fn debug_line(&mut self, text: &str) -> Result<Delivery> {
        let message = DaemonMessage::DebugLine(text.to_string()).to_message(EndpointId::MONITOR);
        self.router.route(message)
    }

    /// Guest kernel log line.
    pub fn printk(&mut self, text: &str) -> Result<Delivery> {
        self.route(Message::new(
            EndpointId::LINUX,
            EndpointId::PRINTK,
            Priority::Discardable,
            MessageKind::String,
            text.as_bytes(),
        ))
    }

    /// Tell the daemon the guest is idle.
    pub fn idle(&mut self) -> Result<Delivery> {
        self.route(Message::discardable(EndpointId::LINUX, EndpointId::IDLE, Vec::new()))
    }

    /// Queue a power request for the guest kernel.
    pub fn send_power(&mut self, kind: PowerMessage) -> Result<Delivery> {
        let payload = LinuxMessage::power(kind).encode();
        self.route(Message::important(EndpointId::DAEMON, EndpointId::LINUX, payload))
    }

    /// Stop the guest and notify the daemon.
    ///
    /// The state changes even if the notification cannot be delivered.
    pub fn terminate(&mut self, reason: TerminationReason) -> Result<()> {
        self.state = MonitorState::Terminated;
        self.termination = Some(reason);
        tracing::info!(id = self.id, ?reason, "monitor terminated");

        let message = DaemonMessage::Terminated { reason }.to_message(EndpointId::MONITOR);
        self.router.route(message).map(|_| ())
    }

    fn console_message(&mut self, message: Message) -> Result<Delivery> {
        if message.from() == EndpointId::LINUX {
            let op = match ConsoleOp::decode(message.payload()) {
                Ok(op) => op,
                Err(e) if message.is_discardable() => {
                    tracing::debug!(error = %e, "dropping bad console op");
                    return Ok(Delivery::Dropped);
                }
                Err(e) => return Err(e),
            };
            self.device_request(DeviceClass::Console, 0, &DeviceRequest::Console(op));

            if self.is_attached(EndpointId::CONSOLE) {
                return self.router.route(message);
            }
            return Ok(Delivery::Delivered);
        }

        self.lifecycle(DeviceClass::Console, 0, message)
    }

    fn video_message(&mut self, message: Message) -> Result<Delivery> {
        let unit = message.to().0 - EndpointId::COVIDEO0.0;
        if message.from() == EndpointId::LINUX {
            if !self.is_attached(message.to()) {
                return Ok(Delivery::NotPresent);
            }
            return self.router.route(message);
        }

        self.lifecycle(DeviceClass::Video, unit, message)
    }

    /// Handle an attach or detach request from a host consumer.
    fn lifecycle(&mut self, class: DeviceClass, unit: u32, message: Message) -> Result<Delivery> {
        let endpoint = message.to();
        let Some(request) = LifecycleMessage::decode(message.payload()) else {
            return Err(Error::InvalidMessage(format!(
                "unexpected message from {} to {}",
                message.from(),
                endpoint
            )));
        };

        let device = self
            .devices
            .table_mut(class)
            .and_then(|t| t.get_mut(unit))
            .ok_or_else(|| Error::DeviceNotFound(endpoint.to_string()))?;

        match request {
            LifecycleMessage::Attach(_) => {
                let snapshot = device.attach(&mut self.memory)?;
                if snapshot.len() > MAX_SNAPSHOT_SIZE {
                    tracing::warn!(%endpoint, bytes = snapshot.len(), "attach snapshot too large");
                    return Err(Error::InvalidMessage(format!(
                        "{} snapshot of {} bytes exceeds {}",
                        endpoint,
                        snapshot.len(),
                        MAX_SNAPSHOT_SIZE
                    )));
                }
                tracing::debug!(%endpoint, bytes = snapshot.len(), "consumer attached");
                let reply = Message::important(
                    EndpointId::MONITOR,
                    endpoint,
                    LifecycleMessage::Attach(snapshot).encode(),
                );
                let delivery = self.router.route(reply)?;
                self.attached.insert(endpoint);
                Ok(delivery)
            }
            LifecycleMessage::Detach(snapshot) => {
                device.detach(&snapshot)?;
                self.attached.remove(&endpoint);
                tracing::debug!(%endpoint, "consumer detached");
                Ok(Delivery::Delivered)
            }
        }
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("window", &self.memory.window())
            .field("devices", &self.devices)
            .finish()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.memory.release();
        tracing::debug!(id = self.id, "monitor released");
    }
}
