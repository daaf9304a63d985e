//! Error kinds observed at the traversal boundary.
//!
//! Every per-node failure (`openat`, `statx`, `getdents64`) is folded into a
//! [`TreeErrorKind`] and parked in the node's packed state word, so the
//! propagation cascade stays live under partial failure. Infrastructure
//! failures (ring creation, thread spawn) are ordinary `io::Error`s and
//! propagate out of the traversal as fatal.

use thiserror::Error;

/// Per-node error kind, encodable as a 16-bit payload of the packed state
/// word (see [`crate::record`]).
///
/// The `Display` form is the stable name printed on stderr for errored
/// entries (`"<path>: <name>"`).
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TreeErrorKind {
    #[error("AccessDenied")]
    AccessDenied,
    #[error("FileNotFound")]
    FileNotFound,
    #[error("NotDir")]
    NotDir,
    #[error("NameTooLong")]
    NameTooLong,
    #[error("SymLinkLoop")]
    SymLinkLoop,
    #[error("DeviceBusy")]
    DeviceBusy,
    #[error("NoDevice")]
    NoDevice,
    #[error("ProcessFdQuotaExceeded")]
    ProcessFdQuotaExceeded,
    #[error("SystemFdQuotaExceeded")]
    SystemFdQuotaExceeded,
    #[error("SystemResources")]
    SystemResources,
    #[error("BadPathName")]
    BadPathName,
    /// A single directory listed at least 2^31 - 1 entries, which would
    /// overflow the remaining-children counter.
    #[error("TooManyResults")]
    TooManyResults,
    #[error("Unexpected")]
    Unexpected,
}

impl TreeErrorKind {
    /// Maps a raw errno (positive) from the traversal syscalls.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EACCES | libc::EPERM => Self::AccessDenied,
            libc::ENOENT => Self::FileNotFound,
            libc::ENOTDIR => Self::NotDir,
            libc::ENAMETOOLONG => Self::NameTooLong,
            libc::ELOOP => Self::SymLinkLoop,
            libc::EBUSY => Self::DeviceBusy,
            libc::ENODEV | libc::ENXIO => Self::NoDevice,
            libc::EMFILE => Self::ProcessFdQuotaExceeded,
            libc::ENFILE => Self::SystemFdQuotaExceeded,
            libc::ENOMEM | libc::EAGAIN => Self::SystemResources,
            libc::EINVAL => Self::BadPathName,
            _ => Self::Unexpected,
        }
    }

    /// Stable wire code stored in the packed state word.
    pub fn code(self) -> u16 {
        match self {
            Self::AccessDenied => 0,
            Self::FileNotFound => 1,
            Self::NotDir => 2,
            Self::NameTooLong => 3,
            Self::SymLinkLoop => 4,
            Self::DeviceBusy => 5,
            Self::NoDevice => 6,
            Self::ProcessFdQuotaExceeded => 7,
            Self::SystemFdQuotaExceeded => 8,
            Self::SystemResources => 9,
            Self::BadPathName => 10,
            Self::TooManyResults => 11,
            Self::Unexpected => 12,
        }
    }

    /// Inverse of [`TreeErrorKind::code`]. Unknown codes collapse to
    /// `Unexpected`; they can only appear if a state word was corrupted.
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Self::AccessDenied,
            1 => Self::FileNotFound,
            2 => Self::NotDir,
            3 => Self::NameTooLong,
            4 => Self::SymLinkLoop,
            5 => Self::DeviceBusy,
            6 => Self::NoDevice,
            7 => Self::ProcessFdQuotaExceeded,
            8 => Self::SystemFdQuotaExceeded,
            9 => Self::SystemResources,
            10 => Self::BadPathName,
            11 => Self::TooManyResults,
            _ => Self::Unexpected,
        }
    }
}
