use std::io;

use thiserror::Error;

/// Unified error kind for every operation in the crate.
///
/// Lower layers surface raw syscall failures; higher layers map well-known
/// errnos onto the more specific kinds (`EAGAIN` on a timed acquire becomes
/// [`Error::Timeout`], `EIDRM` becomes [`Error::SemaphoreMissing`]).
#[derive(Debug, Error)]
pub enum Error {
    /// A syscall failed with an errno nothing above knows how to interpret.
    #[error("{op} failed, errno: {errno} ({})", io::Error::from_raw_os_error(*.errno))]
    Syscall { op: &'static str, errno: i32 },

    /// A timed wait expired before the operation could complete.
    #[error("timed out waiting for resource '{name}'")]
    Timeout { name: String },

    /// The semaphore set was removed out from under a live handle.
    ///
    /// Fatal for this handle; a higher layer may recover by re-registering.
    #[error("semaphore set for resource '{name}' no longer exists")]
    SemaphoreMissing { name: String },

    /// Invalid tickets/quota/timeout combination. Never retried.
    #[error("invalid configuration: {0}")]
    BadConfig(String),

    /// Unexpected invariant violation, mutex setup failure, or init timeout.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Capture the calling thread's errno for a failed syscall.
    pub(crate) fn syscall(op: &'static str) -> Self {
        Error::Syscall {
            op,
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub(crate) fn bad_config(msg: impl Into<String>) -> Self {
        Error::BadConfig(msg.into())
    }

    /// The raw errno, when this error wraps a syscall failure.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Syscall { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    pub(crate) fn is_errno(&self, expected: i32) -> bool {
        self.errno() == Some(expected)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_display_includes_op_and_errno() {
        let err = Error::Syscall {
            op: "semop()",
            errno: libc::EAGAIN,
        };
        let msg = err.to_string();
        assert!(msg.contains("semop()"), "{msg}");
        assert!(msg.contains(&libc::EAGAIN.to_string()), "{msg}");
    }

    #[test]
    fn errno_only_on_syscall_kind() {
        assert_eq!(
            Error::Syscall { op: "semget()", errno: 22 }.errno(),
            Some(22)
        );
        assert_eq!(Error::BadConfig("nope".into()).errno(), None);
        assert!(Error::Syscall { op: "x", errno: libc::EIDRM }.is_errno(libc::EIDRM));
    }
}
