//! Debug logging utilities.
//!
//! Set the `COLINUX_DEBUG` environment variable to enable verbose logging:
//! - `COLINUX_DEBUG=1` - Enable all debug output
//! - `COLINUX_DEBUG=transfer` - Enable only guest memory transfer logs
//! - `COLINUX_DEBUG=router` - Enable only message switch logs
//! - `COLINUX_DEBUG=reactor,device` - Enable multiple categories
//!
//! Output goes through `tracing` at trace level, so a subscriber must be
//! installed by the embedding daemon to see it.

use std::sync::OnceLock;

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Transfer,
    Router,
    Reactor,
    Device,
    All,
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

#[derive(Debug, Default, PartialEq, Eq)]
struct DebugConfig {
    enabled: bool,
    transfer: bool,
    router: bool,
    reactor: bool,
    device: bool,
}

impl DebugConfig {
    fn from_env() -> Self {
        Self::parse(std::env::var("COLINUX_DEBUG").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(val) if val == "1" || val.eq_ignore_ascii_case("all") => Self {
                enabled: true,
                transfer: true,
                router: true,
                reactor: true,
                device: true,
            },
            Some(val) => {
                let val_lower = val.to_lowercase();
                Self {
                    enabled: true,
                    transfer: val_lower.contains("transfer"),
                    router: val_lower.contains("router"),
                    reactor: val_lower.contains("reactor"),
                    device: val_lower.contains("device"),
                }
            }
            None => Self::default(),
        }
    }

    fn allows(&self, category: DebugCategory) -> bool {
        if !self.enabled {
            return false;
        }
        match category {
            DebugCategory::All => self.transfer || self.router || self.reactor || self.device,
            DebugCategory::Transfer => self.transfer,
            DebugCategory::Router => self.router,
            DebugCategory::Reactor => self.reactor,
            DebugCategory::Device => self.device,
        }
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    get_config().allows(category)
}

/// Debug trace macro for guest memory transfer logs
#[macro_export]
macro_rules! debug_transfer {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Transfer) {
            tracing::trace!(target: "colinux::transfer", $($arg)*);
        }
    };
}

/// Debug trace macro for message switch logs
#[macro_export]
macro_rules! debug_router {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Router) {
            tracing::trace!(target: "colinux::router", $($arg)*);
        }
    };
}

/// Debug trace macro for reactor logs
#[macro_export]
macro_rules! debug_reactor {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Reactor) {
            tracing::trace!(target: "colinux::reactor", $($arg)*);
        }
    };
}

/// Debug trace macro for device logs
#[macro_export]
macro_rules! debug_device {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Device) {
            tracing::trace!(target: "colinux::device", $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_categories() {
        assert_eq!(DebugConfig::parse(None), DebugConfig::default());

        let all = DebugConfig::parse(Some("ALL"));
        assert!(all.allows(DebugCategory::Transfer));
        assert!(all.allows(DebugCategory::Device));

        let some = DebugConfig::parse(Some("router,Reactor"));
        assert!(some.allows(DebugCategory::Router));
        assert!(some.allows(DebugCategory::Reactor));
        assert!(!some.allows(DebugCategory::Transfer));
        assert!(some.allows(DebugCategory::All));
    }

    #[test]
    fn test_disabled_by_default() {
        let config = DebugConfig::default();
        assert!(!config.allows(DebugCategory::All));
    }
}
