//! Error types for the monitor data plane.

use std::path::PathBuf;
use thiserror::Error;

use crate::message::EndpointId;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the transfer engine, message bus and reactor.
#[derive(Error, Debug)]
pub enum Error {
    // Transfer engine errors
    #[error("guest range off bounds: 0x{addr:x} (+0x{size:x})")]
    OffBounds { addr: u64, size: u64 },

    #[error("guest frame not mapped: 0x{0:x}")]
    FrameNotMapped(u64),

    // Allocation errors
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    // Routing errors
    #[error("queue full for endpoint {0}")]
    QueueFull(EndpointId),

    #[error("routing failed for endpoint {0}")]
    RoutingFailed(EndpointId),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    // Reactor errors
    #[error("broken connection on reactor user {user}")]
    BrokenConnection { user: usize },

    #[error("send buffer full: {pending} bytes waiting for the peer")]
    SendBufferFull { pending: usize },

    #[error("operation timed out")]
    Timeout,

    // Monitor and device errors
    #[error("monitor not in expected state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("invalid memory size: {0} MB (must be > 0)")]
    InvalidMemorySize(u32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("backing file not found: {0}")]
    BackingFileNotFound(PathBuf),

    #[error("device error: {0}")]
    DeviceError(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for both ways a guest range can be unusable: outside the window,
    /// or inside it but without a host page behind a frame.
    pub fn is_off_bounds(&self) -> bool {
        matches!(self, Error::OffBounds { .. } | Error::FrameNotMapped(_))
    }

    /// True for errors that terminate a single envelope's delivery.
    ///
    /// Allocation failures during routing count as routing failures.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            Error::RoutingFailed(_) | Error::QueueFull(_) | Error::AllocationFailed(_)
        )
    }

    pub(crate) fn off_bounds(addr: u64, size: u64) -> Self {
        Error::OffBounds { addr, size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::off_bounds(0, 1).is_off_bounds());
        assert!(Error::FrameNotMapped(3).is_off_bounds());
        assert!(!Error::Timeout.is_off_bounds());

        assert!(Error::QueueFull(EndpointId::DAEMON).is_routing());
        assert!(Error::AllocationFailed("no pages".into()).is_routing());
        assert!(!Error::BrokenConnection { user: 1 }.is_routing());
    }

    #[test]
    fn test_error_display() {
        let err = Error::RoutingFailed(EndpointId::cobd(2));
        assert_eq!(err.to_string(), "routing failed for endpoint cobd2");

        let err = Error::off_bounds(0x1000, 0x20);
        assert_eq!(err.to_string(), "guest range off bounds: 0x1000 (+0x20)");
    }
}
