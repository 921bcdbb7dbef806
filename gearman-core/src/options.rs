//! Context configuration options
//!
//! Boolean mode flags live in [`OptionFlags`]; everything that is set once at
//! construction time goes through the [`ContextConfig`] builder.

use crate::error::GearmanError;
use crate::log::Verbose;
use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

bitflags! {
    /// Mode bits carried by a [`Context`](crate::context::Context).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OptionFlags: u8 {
        /// Storage was allocated by the constructor.
        const ALLOCATED = 0b0001;
        /// Packets bypass the packet registry.
        const DONT_TRACK_PACKETS = 0b0010;
        /// I/O returns `WouldBlock` instead of waiting.
        const NON_BLOCKING = 0b0100;
        /// Saved `NON_BLOCKING` bit for the one-level push/pop stack.
        const STORED_NON_BLOCKING = 0b1000;
    }
}

/// A single named option, as accepted by
/// [`Context::set_option`](crate::context::Context::set_option).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextOption {
    Allocated,
    DontTrackPackets,
    NonBlocking,
    StoredNonBlocking,
}

impl ContextOption {
    /// Flag bit backing this option.
    #[must_use]
    pub const fn flag(self) -> OptionFlags {
        match self {
            Self::Allocated => OptionFlags::ALLOCATED,
            Self::DontTrackPackets => OptionFlags::DONT_TRACK_PACKETS,
            Self::NonBlocking => OptionFlags::NON_BLOCKING,
            Self::StoredNonBlocking => OptionFlags::STORED_NON_BLOCKING,
        }
    }

    /// Whether callers may toggle this option directly.
    ///
    /// `Allocated` is owned by the constructor and `StoredNonBlocking` by the
    /// push/pop pair.
    #[must_use]
    pub const fn is_settable(self) -> bool {
        matches!(self, Self::DontTrackPackets | Self::NonBlocking)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Allocated => "allocated",
            Self::DontTrackPackets => "dont_track_packets",
            Self::NonBlocking => "non_blocking",
            Self::StoredNonBlocking => "stored_non_blocking",
        }
    }
}

impl fmt::Display for ContextOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ContextOption {
    type Err = GearmanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocated" => Ok(Self::Allocated),
            "dont_track_packets" => Ok(Self::DontTrackPackets),
            "non_blocking" => Ok(Self::NonBlocking),
            "stored_non_blocking" => Ok(Self::StoredNonBlocking),
            other => Err(GearmanError::invalid_argument(format!(
                "unknown option: {other}"
            ))),
        }
    }
}

/// Initial poll descriptor slots reserved by a fresh context.
pub const DEFAULT_POLL_CAPACITY: usize = 32;

/// Construction-time configuration for a context.
///
/// # Examples
///
/// ```
/// use gearman_core::options::ContextConfig;
/// use gearman_core::log::Verbose;
///
/// let config = ContextConfig::default()
///     .with_timeout(250)
///     .with_non_blocking(true)
///     .with_verbose(Verbose::Info);
/// assert_eq!(config.timeout, 250);
/// ```
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Poll timeout in milliseconds.
    ///
    /// - Negative: wait indefinitely (default)
    /// - `0`: return immediately
    /// - Positive: wait up to this many milliseconds
    pub timeout: i32,

    /// Start in non-blocking mode.
    pub non_blocking: bool,

    /// Start with packet tracking suppressed.
    pub dont_track_packets: bool,

    /// Log hook threshold. Messages more verbose than this are not delivered.
    pub verbose: Verbose,

    /// Poll descriptor slots to reserve up front.
    pub poll_capacity: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            timeout: -1, // Block indefinitely
            non_blocking: false,
            dont_track_packets: false,
            verbose: Verbose::Never,
            poll_capacity: DEFAULT_POLL_CAPACITY,
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set poll timeout in milliseconds, negative for infinite.
    pub fn with_timeout(mut self, timeout: i32) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_non_blocking(mut self, enabled: bool) -> Self {
        self.non_blocking = enabled;
        self
    }

    pub fn with_dont_track_packets(mut self, enabled: bool) -> Self {
        self.dont_track_packets = enabled;
        self
    }

    pub fn with_verbose(mut self, verbose: Verbose) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_poll_capacity(mut self, capacity: usize) -> Self {
        self.poll_capacity = capacity;
        self
    }

    /// Flags a context built from this config starts with.
    pub(crate) fn flags(&self) -> OptionFlags {
        let mut flags = OptionFlags::empty();
        flags.set(OptionFlags::NON_BLOCKING, self.non_blocking);
        flags.set(OptionFlags::DONT_TRACK_PACKETS, self.dont_track_packets);
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ContextConfig::default();
        assert_eq!(config.timeout, -1);
        assert!(!config.non_blocking);
        assert!(!config.dont_track_packets);
        assert_eq!(config.verbose, Verbose::Never);
        assert_eq!(config.poll_capacity, DEFAULT_POLL_CAPACITY);
        assert!(config.flags().is_empty());
    }

    #[test]
    fn test_builder_flags() {
        let config = ContextConfig::new()
            .with_non_blocking(true)
            .with_dont_track_packets(true);
        assert_eq!(
            config.flags(),
            OptionFlags::NON_BLOCKING | OptionFlags::DONT_TRACK_PACKETS
        );
    }

    #[test]
    fn test_option_names_round_trip() {
        for option in [
            ContextOption::Allocated,
            ContextOption::DontTrackPackets,
            ContextOption::NonBlocking,
            ContextOption::StoredNonBlocking,
        ] {
            assert_eq!(option.name().parse::<ContextOption>().unwrap(), option);
        }
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = "turbo".parse::<ContextOption>().unwrap_err();
        assert!(matches!(err, GearmanError::InvalidArgument(_)));
    }

    #[test]
    fn test_settable_options() {
        assert!(ContextOption::NonBlocking.is_settable());
        assert!(ContextOption::DontTrackPackets.is_settable());
        assert!(!ContextOption::Allocated.is_settable());
        assert!(!ContextOption::StoredNonBlocking.is_settable());
    }
}
