//! Kernel-wide error types.
//!
//! Every fallible kernel API returns [`KernelResult`]; there is no hidden
//! unwinding. Errors propagate up to the syscall layer, which maps them to
//! a negative status word copied back to the user return register.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// An argument was outside its documented domain.
    InvalidArgument,
    /// The caller's IRQL is too high (or too low) for this operation.
    InvalidIrql {
        current: u8,
    },
    /// A subsystem was used before its init phase completed.
    InvalidInitPhase {
        subsystem: &'static str,
    },
    /// A thread's affinity mask excludes every online CPU.
    InvalidAffinity,
    /// Not enough physical or virtual memory to satisfy the request.
    NotEnoughMemory {
        requested: usize,
    },
    /// Internal inconsistency; callers cannot recover.
    InternalError {
        reason: &'static str,
    },
    /// The operation should be retried (futex value mismatch, transient
    /// resource contention).
    Retry,
    /// The object was already initialized.
    AlreadyInitialized,
    /// A required resource was not found.
    NotFound,
    /// The resource is in use by someone else.
    InUse,
    /// The requested operation is not implemented by this object.
    Unimplemented,
    /// A user buffer was absent or not mapped with the required access.
    PageFault {
        addr: usize,
    },
    /// Credentials do not permit the operation.
    AccessDenied,
    /// A blocking wait was interrupted by a signal or an explicit abort.
    Aborted,
    /// The calling thread already owns this lock.
    RecursiveLock,
    /// The file or descriptor is not usable for this operation.
    InvalidFile,
    /// The ioctl code is not recognized by the driver.
    InvalidIoctl,
    /// The operation is meaningless for this object (e.g. seek on a FIFO).
    InvalidOperation,
    /// The DPC is already linked into a CPU's queue.
    DpcAlreadyEnqueued,
    /// The target thread cannot be woken (dead, or not blocked).
    WakeIncapable,
    /// A non-blocking operation would have to block.
    WouldBlock,
    /// End of file.
    Eof,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Status word delivered to user mode: zero is success, errors are
    /// small negative integers with a stable assignment.
    pub fn as_status(&self) -> isize {
        match self {
            Self::InvalidArgument => -1,
            Self::InvalidIrql { .. } => -2,
            Self::InvalidInitPhase { .. } => -3,
            Self::InvalidAffinity => -4,
            Self::NotEnoughMemory { .. } => -5,
            Self::InternalError { .. } => -6,
            Self::Retry => -7,
            Self::AlreadyInitialized => -8,
            Self::NotFound => -9,
            Self::InUse => -10,
            Self::Unimplemented => -11,
            Self::PageFault { .. } => -12,
            Self::AccessDenied => -13,
            Self::Aborted => -14,
            Self::RecursiveLock => -15,
            Self::InvalidFile => -16,
            Self::InvalidIoctl => -17,
            Self::InvalidOperation => -18,
            Self::DpcAlreadyEnqueued => -19,
            Self::WakeIncapable => -20,
            Self::WouldBlock => -21,
            Self::Eof => -22,
        }
    }

    /// Inverse of [`as_status`](Self::as_status), used at the driver ABI
    /// boundary where loaded images report plain status words.
    /// Payload-carrying kinds come back with empty payloads.
    pub fn from_status(status: isize) -> Self {
        match status {
            -1 => Self::InvalidArgument,
            -2 => Self::InvalidIrql { current: 0 },
            -3 => Self::InvalidInitPhase { subsystem: "driver" },
            -4 => Self::InvalidAffinity,
            -5 => Self::NotEnoughMemory { requested: 0 },
            -6 => Self::InternalError {
                reason: "driver internal error",
            },
            -7 => Self::Retry,
            -8 => Self::AlreadyInitialized,
            -9 => Self::NotFound,
            -10 => Self::InUse,
            -11 => Self::Unimplemented,
            -12 => Self::PageFault { addr: 0 },
            -13 => Self::AccessDenied,
            -14 => Self::Aborted,
            -15 => Self::RecursiveLock,
            -16 => Self::InvalidFile,
            -17 => Self::InvalidIoctl,
            -18 => Self::InvalidOperation,
            -19 => Self::DpcAlreadyEnqueued,
            -20 => Self::WakeIncapable,
            -21 => Self::WouldBlock,
            -22 => Self::Eof,
            _ => Self::InternalError {
                reason: "unknown driver status",
            },
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidIrql { current } => {
                write!(f, "operation invalid at IRQL {}", current)
            }
            Self::InvalidInitPhase { subsystem } => {
                write!(f, "{} used before initialization", subsystem)
            }
            Self::InvalidAffinity => write!(f, "affinity mask excludes all CPUs"),
            Self::NotEnoughMemory { requested } => {
                write!(f, "out of memory: requested {} bytes", requested)
            }
            Self::InternalError { reason } => write!(f, "internal error: {}", reason),
            Self::Retry => write!(f, "retry the operation"),
            Self::AlreadyInitialized => write!(f, "already initialized"),
            Self::NotFound => write!(f, "not found"),
            Self::InUse => write!(f, "resource in use"),
            Self::Unimplemented => write!(f, "not implemented"),
            Self::PageFault { addr } => write!(f, "page fault on user buffer 0x{:x}", addr),
            Self::AccessDenied => write!(f, "access denied"),
            Self::Aborted => write!(f, "wait aborted"),
            Self::RecursiveLock => write!(f, "recursive lock acquisition"),
            Self::InvalidFile => write!(f, "invalid file"),
            Self::InvalidIoctl => write!(f, "invalid ioctl"),
            Self::InvalidOperation => write!(f, "invalid operation"),
            Self::DpcAlreadyEnqueued => write!(f, "DPC already enqueued"),
            Self::WakeIncapable => write!(f, "thread cannot be woken"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::Eof => write!(f, "end of file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable_and_negative() {
        assert_eq!(KernelError::InvalidArgument.as_status(), -1);
        assert_eq!(KernelError::Eof.as_status(), -22);
        assert!(KernelError::Aborted.as_status() < 0);
    }

    #[test]
    fn from_status_round_trips_payload_free_kinds() {
        for status in -22..=-1isize {
            let err = KernelError::from_status(status);
            assert_eq!(err.as_status(), status);
        }
        assert!(matches!(
            KernelError::from_status(-999),
            KernelError::InternalError { .. }
        ));
    }

    #[test]
    fn display_is_human_readable() {
        use alloc::string::ToString;
        assert_eq!(
            KernelError::NotEnoughMemory { requested: 4096 }.to_string(),
            "out of memory: requested 4096 bytes"
        );
        assert_eq!(KernelError::Retry.to_string(), "retry the operation");
    }
}
