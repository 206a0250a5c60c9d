//! Message switch: delivers each envelope to exactly one consumer.
//!
//! Destinations are matched against a table of endpoint-range rules, newest
//! first. A rule either hands the envelope to a callback, appends it to a
//! queue, forwards it serialized over the outbound daemon channel, or
//! reroutes it through another destination's rule.

use std::fmt;
use std::ops::RangeInclusive;

use tokio::sync::mpsc::{self, error::TrySendError};

use super::{Delivery, EndpointId, Message, MessageQueue};
use crate::error::{Error, Result};

/// Consumer invoked synchronously for each envelope.
pub trait MessageSink: Send {
    fn deliver(&mut self, message: Message) -> Result<()>;
}

impl<F> MessageSink for F
where
    F: FnMut(Message) -> Result<()> + Send,
{
    fn deliver(&mut self, message: Message) -> Result<()> {
        self(message)
    }
}

/// Where a rule sends matching envelopes.
pub enum Target {
    Callback(Box<dyn MessageSink>),
    Queue(MessageQueue),
    /// Deliver through the rule of another endpoint.
    Reroute(EndpointId),
    /// Serialize and forward to a host daemon.
    Channel(mpsc::Sender<Vec<u8>>),
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Callback(_) => f.write_str("Callback"),
            Target::Queue(q) => f.debug_tuple("Queue").field(&q.len()).finish(),
            Target::Reroute(to) => f.debug_tuple("Reroute").field(to).finish(),
            Target::Channel(_) => f.write_str("Channel"),
        }
    }
}

#[derive(Debug)]
struct Rule {
    first: EndpointId,
    last: EndpointId,
    target: Target,
}

impl Rule {
    fn covers(&self, id: EndpointId) -> bool {
        id >= self.first && id <= self.last
    }
}

/// Control requests addressed to the switch itself.
///
/// Layout: `type: u8, destination: u32, reroute: u32` (9 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchControl {
    SetReroute {
        destination: EndpointId,
        reroute: EndpointId,
    },
    FreeRule {
        destination: EndpointId,
    },
}

impl SwitchControl {
    pub const SIZE: usize = 9;

    const SET_REROUTE: u8 = 0;
    const FREE_RULE: u8 = 1;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let (kind, destination, reroute) = match *self {
            SwitchControl::SetReroute {
                destination,
                reroute,
            } => (Self::SET_REROUTE, destination, reroute),
            SwitchControl::FreeRule { destination } => (Self::FREE_RULE, destination, EndpointId(0)),
        };
        let mut buf = [0u8; Self::SIZE];
        buf[0] = kind;
        buf[1..5].copy_from_slice(&destination.0.to_le_bytes());
        buf[5..9].copy_from_slice(&reroute.0.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SIZE {
            return Err(Error::InvalidMessage(format!(
                "switch control payload is {} bytes, expected {}",
                data.len(),
                Self::SIZE
            )));
        }
        let destination = EndpointId(u32::from_le_bytes([data[1], data[2], data[3], data[4]]));
        let reroute = EndpointId(u32::from_le_bytes([data[5], data[6], data[7], data[8]]));
        match data[0] {
            Self::SET_REROUTE => Ok(SwitchControl::SetReroute {
                destination,
                reroute,
            }),
            Self::FREE_RULE => Ok(SwitchControl::FreeRule { destination }),
            other => Err(Error::InvalidMessage(format!(
                "unknown switch control type {}",
                other
            ))),
        }
    }
}

/// Rule table plus the dispatch loop.
#[derive(Debug)]
pub struct Router {
    id: EndpointId,
    rules: Vec<Rule>,
    dropped: u64,
}

impl Router {
    /// Create a switch whose control messages are addressed to `id`.
    pub fn new(id: EndpointId) -> Self {
        Self {
            id,
            rules: Vec::new(),
            dropped: 0,
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Install a rule for a single destination.
    pub fn set_rule(&mut self, destination: EndpointId, target: Target) {
        self.set_rule_range(destination..=destination, target);
    }

    /// Install a rule for every destination in `range`.
    ///
    /// A rule for exactly the same range is replaced; otherwise the new rule
    /// shadows older overlapping ones until it is freed.
    pub fn set_rule_range(&mut self, range: RangeInclusive<EndpointId>, target: Target) {
        let (first, last) = range.into_inner();
        self.rules.retain(|rule| !(rule.first == first && rule.last == last));
        crate::debug_router!(%first, %last, ?target, "set rule");
        self.rules.insert(0, Rule { first, last, target });
    }

    /// Remove the newest rule covering `destination`.
    pub fn free_rule(&mut self, destination: EndpointId) -> bool {
        match self.rules.iter().position(|rule| rule.covers(destination)) {
            Some(index) => {
                let rule = self.rules.remove(index);
                crate::debug_router!(first = %rule.first, last = %rule.last, "free rule");
                true
            }
            None => false,
        }
    }

    pub fn has_rule(&self, destination: EndpointId) -> bool {
        self.find(destination).is_some()
    }

    /// Queue behind `destination`'s rule, if it is a queue rule.
    pub fn queue(&self, destination: EndpointId) -> Option<&MessageQueue> {
        match &self.rules[self.find(destination)?].target {
            Target::Queue(queue) => Some(queue),
            _ => None,
        }
    }

    pub fn queue_mut(&mut self, destination: EndpointId) -> Option<&mut MessageQueue> {
        let index = self.find(destination)?;
        match &mut self.rules[index].target {
            Target::Queue(queue) => Some(queue),
            _ => None,
        }
    }

    /// Discardable envelopes absorbed by this switch.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Deliver one envelope.
    ///
    /// Failures on discardable envelopes are logged and reported as
    /// [`Delivery::Dropped`]; on important envelopes they are returned.
    pub fn route(&mut self, message: Message) -> Result<Delivery> {
        if message.to() == self.id {
            return Ok(self.control(&message));
        }

        let discardable = message.is_discardable();
        let to = message.to();
        match self.dispatch(message) {
            Err(e) if discardable => {
                self.dropped += 1;
                tracing::debug!(%to, error = %e, "dropping discardable message");
                Ok(Delivery::Dropped)
            }
            Err(e) => {
                tracing::warn!(%to, error = %e, "failed to route important message");
                Err(e)
            }
            Ok(delivery) => Ok(delivery),
        }
    }

    fn dispatch(&mut self, message: Message) -> Result<Delivery> {
        let to = message.to();
        let mut index = self.find(to).ok_or(Error::RoutingFailed(to))?;
        if let Target::Reroute(via) = self.rules[index].target {
            index = self.find(via).ok_or(Error::RoutingFailed(via))?;
            crate::debug_router!(%to, %via, "reroute");
        }

        match &mut self.rules[index].target {
            Target::Callback(sink) => sink.deliver(message).map(|()| Delivery::Delivered),
            Target::Queue(queue) => queue.push(message),
            Target::Channel(sender) => match sender.try_send(message.encode()?) {
                Ok(()) => Ok(Delivery::Delivered),
                Err(TrySendError::Full(_)) => Err(Error::QueueFull(to)),
                Err(TrySendError::Closed(_)) => Err(Error::RoutingFailed(to)),
            },
            // Reroute chains are not followed past one hop.
            Target::Reroute(_) => Err(Error::RoutingFailed(to)),
        }
    }

    fn control(&mut self, message: &Message) -> Delivery {
        let request = match SwitchControl::decode(message.payload()) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(from = %message.from(), error = %e, "bad switch control message");
                return Delivery::Dropped;
            }
        };

        match request {
            SwitchControl::SetReroute {
                destination,
                reroute,
            } => self.set_rule(destination, Target::Reroute(reroute)),
            SwitchControl::FreeRule { destination } => {
                self.free_rule(destination);
            }
        }
        Delivery::Delivered
    }

    fn find(&self, destination: EndpointId) -> Option<usize> {
        self.rules.iter().position(|rule| rule.covers(destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MAX_MESSAGE_SIZE;
    use std::sync::{Arc, Mutex};

    fn important(to: EndpointId) -> Message {
        Message::important(EndpointId::DAEMON, to, vec![1, 2, 3])
    }

    fn discardable(to: EndpointId) -> Message {
        Message::discardable(EndpointId::LINUX, to, vec![4, 5])
    }

    #[test]
    fn test_discardable_dropped_important_surfaced_when_full() {
        let mut router = Router::new(EndpointId::KERNEL_SWITCH);
        router.set_rule(EndpointId::LINUX, Target::Queue(MessageQueue::new(1)));
        router.route(important(EndpointId::LINUX)).unwrap();

        let delivery = router.route(discardable(EndpointId::LINUX)).unwrap();
        assert_eq!(delivery, Delivery::Dropped);

        let err = router.route(important(EndpointId::LINUX)).unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)));
        assert_eq!(router.queue(EndpointId::LINUX).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_destination() {
        let mut router = Router::new(EndpointId::KERNEL_SWITCH);
        assert_eq!(router.route(discardable(EndpointId::PRINTK)).unwrap(), Delivery::Dropped);
        assert_eq!(router.dropped(), 1);

        let err = router.route(important(EndpointId::PRINTK)).unwrap_err();
        assert!(matches!(err, Error::RoutingFailed(to) if to == EndpointId::PRINTK));
    }

    #[test]
    fn test_range_rule_and_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let mut router = Router::new(EndpointId::KERNEL_SWITCH);
        router.set_rule_range(
            EndpointId::conet(0)..=EndpointId::conet(31),
            Target::Callback(Box::new(move |msg: Message| -> Result<()> {
                sink_seen.lock().unwrap().push(msg.to());
                Ok(())
            })),
        );

        router.route(discardable(EndpointId::conet(5))).unwrap();
        router.route(discardable(EndpointId::conet(31))).unwrap();
        assert_eq!(router.route(discardable(EndpointId::cobd(0))).unwrap(), Delivery::Dropped);
        assert_eq!(*seen.lock().unwrap(), vec![EndpointId::conet(5), EndpointId::conet(31)]);
    }

    #[test]
    fn test_switch_control_reroute_and_free() {
        let mut router = Router::new(EndpointId::KERNEL_SWITCH);
        router.set_rule(EndpointId::DAEMON, Target::Queue(MessageQueue::new(8)));

        let set = SwitchControl::SetReroute {
            destination: EndpointId::PRINTK,
            reroute: EndpointId::DAEMON,
        };
        let control = Message::important(EndpointId::MONITOR, EndpointId::KERNEL_SWITCH, set.encode().to_vec());
        assert_eq!(router.route(control).unwrap(), Delivery::Delivered);

        router.route(important(EndpointId::PRINTK)).unwrap();
        let queued = router.queue_mut(EndpointId::DAEMON).unwrap().pop().unwrap();
        assert_eq!(queued.to(), EndpointId::PRINTK);

        let free = SwitchControl::FreeRule {
            destination: EndpointId::PRINTK,
        };
        router
            .route(Message::important(EndpointId::MONITOR, EndpointId::KERNEL_SWITCH, free.encode().to_vec()))
            .unwrap();
        assert!(!router.has_rule(EndpointId::PRINTK));
        assert!(router.has_rule(EndpointId::DAEMON));
    }

    #[test]
    fn test_malformed_control_dropped() {
        let mut router = Router::new(EndpointId::KERNEL_SWITCH);
        let bad = Message::important(EndpointId::MONITOR, EndpointId::KERNEL_SWITCH, vec![0; 4]);
        assert_eq!(router.route(bad).unwrap(), Delivery::Dropped);
    }

    #[test]
    fn test_channel_target_backpressure() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut router = Router::new(EndpointId::KERNEL_SWITCH);
        router.set_rule(EndpointId::DAEMON, Target::Channel(tx));

        router.route(important(EndpointId::DAEMON)).unwrap();
        assert_eq!(router.route(discardable(EndpointId::DAEMON)).unwrap(), Delivery::Dropped);
        assert!(matches!(
            router.route(important(EndpointId::DAEMON)),
            Err(Error::QueueFull(_))
        ));

        let bytes = rx.try_recv().unwrap();
        let (msg, used) = Message::decode(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(msg.payload(), &[1, 2, 3]);

        drop(rx);
        assert!(matches!(
            router.route(important(EndpointId::DAEMON)),
            Err(Error::RoutingFailed(_))
        ));
    }

    #[test]
    fn test_reroute_chain_fails() {
        let mut router = Router::new(EndpointId::KERNEL_SWITCH);
        router.set_rule(EndpointId::PRINTK, Target::Reroute(EndpointId::DAEMON));
        router.set_rule(EndpointId::DAEMON, Target::Reroute(EndpointId::IDLE));
        assert!(matches!(
            router.route(important(EndpointId::PRINTK)),
            Err(Error::RoutingFailed(_))
        ));
    }

    #[test]
    fn test_sink_failure_absorbed_for_discardable_only() {
        let mut router = Router::new(EndpointId::KERNEL_SWITCH);
        router.set_rule(
            EndpointId::conet(0),
            Target::Callback(Box::new(|_: Message| -> Result<()> {
                Err(Error::DeviceError("tap device gone".into()))
            })),
        );

        assert_eq!(router.route(discardable(EndpointId::conet(0))).unwrap(), Delivery::Dropped);
        assert_eq!(router.dropped(), 1);
        assert!(matches!(
            router.route(important(EndpointId::conet(0))),
            Err(Error::DeviceError(_))
        ));
    }

    #[test]
    fn test_channel_refuses_unreadable_envelope() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut router = Router::new(EndpointId::KERNEL_SWITCH);
        router.set_rule(EndpointId::DAEMON, Target::Channel(tx));

        let huge = vec![0; MAX_MESSAGE_SIZE + 1];
        let err = router
            .route(Message::important(EndpointId::MONITOR, EndpointId::DAEMON, huge.clone()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
        assert_eq!(
            router.route(Message::discardable(EndpointId::MONITOR, EndpointId::DAEMON, huge)).unwrap(),
            Delivery::Dropped
        );
        assert!(rx.try_recv().is_err());
    }
}
