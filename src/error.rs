//! # Errors
//!
//! One error type for the whole harness. Variants follow the failure
//! classes of a periodic real-time application:
//!
//! - **Resource errors** (`DuplicateName`, `ResourceExhausted`, `Start`):
//!   task or queue creation failed. Fatal at startup.
//! - **Overrun errors** (`Overrun`): a periodic task in overrun-counting
//!   mode missed at least one activation. Terminal for that task.
//! - **Task errors** (`Panicked`): a task body unwound instead of
//!   returning.
//! - **Queue errors** (`QueueNotFound`, `QueueFull`, `QueueClosed`).
//!   End of stream is not an error: `receive` returns `None`.
//! - **Environment errors** (`Config`, `Io`, `Os`), carrying the
//!   underlying OS error text.

use std::io;

/// What kind of object a name collision refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Task,
    Queue,
}

impl std::fmt::Display for NameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => f.write_str("task"),
            Self::Queue => f.write_str("queue"),
        }
    }
}

/// Errors produced by the harness.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("{kind} name already registered: {name}")]
    DuplicateName { kind: NameKind, name: String },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("cannot start task {task}: {reason}")]
    Start { task: String, reason: String },

    #[error("task {task} overrun: {overruns} activation(s) missed")]
    Overrun { task: String, overruns: u64 },

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("queue {0} is full")]
    QueueFull(String),

    #[error("queue {0} is closed")]
    QueueClosed(String),

    #[error("task {0} panicked")]
    Panicked(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        #[source]
        source: io::Error,
    },
}

impl HarnessError {
    /// Wrap the current `errno` of a failed libc call.
    pub fn last_os_error(call: &'static str) -> Self {
        Self::Os {
            call,
            source: io::Error::last_os_error(),
        }
    }

    /// Wrap an error number returned directly by a pthread-style call.
    pub fn from_errno(call: &'static str, errno: i32) -> Self {
        Self::Os {
            call,
            source: io::Error::from_raw_os_error(errno),
        }
    }

    /// Returns true for failures that make the harness unable to start.
    pub fn is_resource_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateName { .. } | Self::ResourceExhausted(_) | Self::Start { .. }
        )
    }
}

/// Harness result alias.
pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_include_os_text() {
        let err = HarnessError::from_errno("sched_setaffinity", libc::EINVAL);
        let text = err.to_string();
        assert!(text.starts_with("sched_setaffinity failed: "));
        assert!(text.len() > "sched_setaffinity failed: ".len());
    }

    #[test]
    fn test_resource_classification() {
        let dup = HarnessError::DuplicateName {
            kind: NameKind::Queue,
            name: "q".into(),
        };
        assert!(dup.is_resource_error());
        assert_eq!(dup.to_string(), "queue name already registered: q");
        assert!(!HarnessError::QueueClosed("q".into()).is_resource_error());
    }
}
