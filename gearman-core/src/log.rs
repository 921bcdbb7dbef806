//! Error and log sink.
//!
//! Holds the per-context last-error slot and the types of the user hooks that
//! observe the context: the log hook and the event-watch hook.

use crate::connection::Interest;
use crate::error::{GearmanError, Result};
use crate::registry::ConnectionId;
use std::fmt::{self, Write as _};
use std::os::unix::io::RawFd;
use std::str::FromStr;
use std::sync::Arc;

/// Upper bound on the rendered last-error message, in bytes.
pub const MAX_ERROR_SIZE: usize = 1024;

/// Log verbosity, ordered from quietest to loudest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Verbose {
    #[default]
    Never,
    Fatal,
    Error,
    Info,
    Debug,
    Crazy,
}

impl Verbose {
    pub const ALL: [Verbose; 6] = [
        Verbose::Never,
        Verbose::Fatal,
        Verbose::Error,
        Verbose::Info,
        Verbose::Debug,
        Verbose::Crazy,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Never => "NEVER",
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Crazy => "CRAZY",
        }
    }
}

impl fmt::Display for Verbose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Verbose {
    type Err = GearmanError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| GearmanError::invalid_argument(format!("unknown verbose level: {s}")))
    }
}

/// Log hook: receives every rendered message at or below the configured
/// verbosity.
pub type LogFn = dyn Fn(&str, Verbose) + Send + Sync;

/// Event-watch hook: told whenever the poll interest of a connection changes,
/// so an external event loop can mirror it. Returning an error aborts the
/// operation that caused the change.
pub type EventWatchFn = dyn Fn(ConnectionId, RawFd, Interest) -> Result<()> + Send + Sync;

/// Installed log hook with its threshold.
#[derive(Clone)]
pub(crate) struct LogHook {
    pub(crate) function: Arc<LogFn>,
    pub(crate) verbose: Verbose,
}

impl LogHook {
    pub(crate) fn wants(&self, level: Verbose) -> bool {
        level != Verbose::Never && level <= self.verbose
    }
}

/// Bounded last-error message plus the last captured OS error code.
///
/// The message is empty exactly when no error is pending. Errno is tracked
/// independently and survives [`ErrorSlot::clear`].
#[derive(Debug, Clone, Default)]
pub struct ErrorSlot {
    message: String,
    errno: i32,
}

impl ErrorSlot {
    pub const fn new() -> Self {
        Self {
            message: String::new(),
            errno: 0,
        }
    }

    /// Render `origin: error` into the slot, truncating to
    /// [`MAX_ERROR_SIZE`] bytes on a character boundary.
    pub fn set(&mut self, origin: &str, error: &GearmanError) -> &str {
        self.message.clear();
        let _ = write!(self.message, "{origin}: {error}");
        truncate_on_char_boundary(&mut self.message, MAX_ERROR_SIZE);
        &self.message
    }

    pub fn set_errno(&mut self, errno: i32) {
        self.errno = errno;
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        if self.message.is_empty() {
            None
        } else {
            Some(&self.message)
        }
    }

    #[must_use]
    pub const fn errno(&self) -> i32 {
        self.errno
    }

    pub fn clear(&mut self) {
        self.message.clear();
    }
}

fn truncate_on_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_ordering() {
        assert!(Verbose::Never < Verbose::Fatal);
        assert!(Verbose::Error < Verbose::Info);
        assert!(Verbose::Debug < Verbose::Crazy);
        assert_eq!(Verbose::Info.to_string(), "INFO");
        assert_eq!("debug".parse::<Verbose>().unwrap(), Verbose::Debug);
        assert!("loud".parse::<Verbose>().is_err());
    }

    #[test]
    fn test_empty_slot_reports_none() {
        let slot = ErrorSlot::new();
        assert_eq!(slot.message(), None);
        assert_eq!(slot.errno(), 0);
    }

    #[test]
    fn test_set_renders_origin() {
        let mut slot = ErrorSlot::new();
        slot.set("wait", &GearmanError::NoActiveFds);
        assert_eq!(slot.message(), Some("wait: no active file descriptors"));
    }

    #[test]
    fn test_long_message_truncated() {
        let mut slot = ErrorSlot::new();
        let long = "é".repeat(MAX_ERROR_SIZE);
        slot.set("echo", &GearmanError::invalid_argument(long));
        let msg = slot.message().unwrap();
        assert!(msg.len() <= MAX_ERROR_SIZE);
        assert!(msg.starts_with("echo: invalid argument: "));
    }

    #[test]
    fn test_clear_keeps_errno() {
        let mut slot = ErrorSlot::new();
        slot.set("wait", &GearmanError::NoActiveFds);
        slot.set_errno(libc::EINVAL);
        slot.clear();
        assert_eq!(slot.message(), None);
        assert_eq!(slot.errno(), libc::EINVAL);
    }

    #[test]
    fn test_log_hook_threshold() {
        let hook = LogHook {
            function: Arc::new(|_: &str, _: Verbose| {}),
            verbose: Verbose::Info,
        };
        assert!(hook.wants(Verbose::Error));
        assert!(hook.wants(Verbose::Info));
        assert!(!hook.wants(Verbose::Debug));
        assert!(!hook.wants(Verbose::Never));
    }
}
