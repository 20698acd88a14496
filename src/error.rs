use thiserror::Error;

#[derive(Error, Debug)]
pub enum StromError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown handle: {0:#x}")]
    UnknownHandle(u64),

    #[error("Unknown DMA task: {0}")]
    UnknownTask(u64),

    #[error("Region {handle:#x} is referenced by {refs} outstanding task(s)")]
    RegionBusy { handle: u64, refs: usize },

    #[error("DMA buffer {0:#x} is in use by an outstanding task")]
    BufferBusy(u64),

    #[error("Region registry exhausted")]
    OutOfHandles,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Too many outstanding DMA tasks (limit {limit})")]
    TooManyOutstanding { limit: usize },

    #[error("Region {handle:#x} page table changed under task (captured version {version})")]
    StaleRegion { handle: u64, version: u32 },

    #[error("Device I/O error: {0}")]
    DeviceIo(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("File is not backed by a transfer-capable block device")]
    NotBlockBacked,

    #[error("Virtual range is not resolvable to physical pages")]
    InvalidRange,

    #[error("Invalid NUMA node: {0}")]
    InvalidNode(i32),

    #[error("Operation timed out")]
    WaitTimeout,
}

impl StromError {
    /// The negative errno reported through the ABI `status` fields.
    #[must_use]
    pub fn errno(&self) -> i64 {
        let code = match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::UnknownHandle(_) | Self::UnknownTask(_) => libc::ENOENT,
            Self::RegionBusy { .. } | Self::BufferBusy(_) => libc::EBUSY,
            Self::OutOfHandles => libc::ENFILE,
            Self::OutOfMemory => libc::ENOMEM,
            Self::TooManyOutstanding { .. } => libc::EAGAIN,
            Self::StaleRegion { .. } => libc::ESTALE,
            Self::DeviceIo(_) => libc::EIO,
            Self::PermissionDenied => libc::EPERM,
            Self::NotBlockBacked => libc::ENOTSUP,
            Self::InvalidRange => libc::EFAULT,
            Self::InvalidNode(_) => libc::ENODEV,
            Self::WaitTimeout => libc::ETIMEDOUT,
        };
        -i64::from(code)
    }

    /// Resource exhaustion the caller can recover from by backing off.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OutOfHandles | Self::OutOfMemory | Self::TooManyOutstanding { .. }
        )
    }
}

// A convenient alias
pub type StromResult<T> = Result<T, StromError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(StromError::UnknownTask(7).errno(), -i64::from(libc::ENOENT));
        assert_eq!(
            StromError::RegionBusy { handle: 1, refs: 2 }.errno(),
            -i64::from(libc::EBUSY)
        );
        assert_eq!(StromError::BufferBusy(3).errno(), -i64::from(libc::EBUSY));
        assert_eq!(
            StromError::DeviceIo("short read".into()).errno(),
            -i64::from(libc::EIO)
        );
        let io: StromError = std::io::Error::from_raw_os_error(libc::EACCES).into();
        assert_eq!(io.errno(), -i64::from(libc::EACCES));
    }

    #[test]
    fn retryable_errors() {
        assert!(StromError::OutOfMemory.is_retryable());
        assert!(StromError::TooManyOutstanding { limit: 4 }.is_retryable());
        assert!(!StromError::PermissionDenied.is_retryable());
    }

    #[test]
    fn display() {
        let e = StromError::RegionBusy {
            handle: 0x10,
            refs: 1,
        };
        assert_eq!(
            e.to_string(),
            "Region 0x10 is referenced by 1 outstanding task(s)"
        );
    }
}
