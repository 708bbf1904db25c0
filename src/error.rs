use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("Malformed command stream at byte {offset}: {reason}")]
    MalformedStream { offset: usize, reason: &'static str },

    #[error("Command stream truncated: {remaining} trailing bytes")]
    TruncatedStream { remaining: usize },

    #[error("SVGA3D command {opcode} is only allowed for privileged clients")]
    ForbiddenCommand { opcode: u32 },

    #[error("Command buffer holds {available} bytes, {declared} declared")]
    BadCommandBuffer { declared: usize, available: usize },

    #[error("Could not find or use context {0}")]
    UnknownContext(u32),

    #[error("Could not find or use surface 0x{0:08x}")]
    UnknownSurface(u32),

    #[error("Could not find or use GMR region {0}")]
    UnknownBuffer(u32),

    #[error("Unknown fence handle {0}")]
    UnknownFence(u32),

    #[error("Too many resources referenced in command stream")]
    TooManyResources,

    #[error("Max number of DMA buffers per submission exceeded")]
    TooManyBuffers,

    #[error("Max number of relocations per submission exceeded")]
    TooManyRelocations,

    #[error("Out of device memory")]
    OutOfMemory,

    #[error("Interrupted by a pending client signal")]
    Interrupted,

    #[error("Tracked buffer {0} has no device placement")]
    Unplaced(usize),

    #[error("VRAM offset 0x{0:x} is not addressable by a guest pointer")]
    UnaddressablePlacement(u64),

    #[error("Failed reserving {requested} bytes of FIFO space")]
    RingFull { requested: usize },

    #[error("Command ring failure: {0}")]
    RingFailed(String),

    #[error("Fence wait timed out")]
    FenceTimeout,

    #[error("Fence result for seqno {seqno} could not be delivered")]
    Delivery { seqno: u32 },
}

/// Taxonomy of the submission pipeline's failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    StreamFormat,
    ReferenceResolution,
    CapacityExceeded,
    Placement,
    Submission,
    Delivery,
}

/// Exit-code class reported to the submitting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    InvalidArgument,
    ResourceExhaustion,
    Timeout,
    Device,
    /// The device accepted the work but the caller never saw the result.
    /// Associated handles must still be released.
    BestEffort,
}

impl ExecError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedStream { .. }
            | Self::TruncatedStream { .. }
            | Self::ForbiddenCommand { .. }
            | Self::BadCommandBuffer { .. } => ErrorKind::StreamFormat,
            Self::UnknownContext(_)
            | Self::UnknownSurface(_)
            | Self::UnknownBuffer(_)
            | Self::UnknownFence(_) => ErrorKind::ReferenceResolution,
            Self::TooManyResources | Self::TooManyBuffers | Self::TooManyRelocations => {
                ErrorKind::CapacityExceeded
            }
            Self::OutOfMemory
            | Self::Interrupted
            | Self::Unplaced(_)
            | Self::UnaddressablePlacement(_) => ErrorKind::Placement,
            Self::RingFull { .. } | Self::RingFailed(_) | Self::FenceTimeout => {
                ErrorKind::Submission
            }
            Self::Delivery { .. } => ErrorKind::Delivery,
        }
    }

    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self.kind() {
            ErrorKind::StreamFormat
            | ErrorKind::ReferenceResolution
            | ErrorKind::CapacityExceeded => ErrorClass::InvalidArgument,
            ErrorKind::Delivery => ErrorClass::BestEffort,
            ErrorKind::Placement | ErrorKind::Submission => match self {
                Self::FenceTimeout => ErrorClass::Timeout,
                Self::RingFailed(_) | Self::Unplaced(_) | Self::UnaddressablePlacement(_) => {
                    ErrorClass::Device
                }
                _ => ErrorClass::ResourceExhaustion,
            },
        }
    }

    /// Negative Linux errno for the ioctl-style return value.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        let code = match self {
            Self::BadCommandBuffer { .. } | Self::Delivery { .. } => libc::EFAULT,
            Self::OutOfMemory | Self::RingFull { .. } => libc::ENOMEM,
            Self::Interrupted => libc::EINTR,
            Self::FenceTimeout => libc::EBUSY,
            Self::RingFailed(_) | Self::Unplaced(_) | Self::UnaddressablePlacement(_) => {
                libc::EIO
            }
            _ => libc::EINVAL,
        };
        -code
    }
}

// A convenient alias
pub type ExecResult<T> = Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_are_invalid_argument() {
        for err in [
            ExecError::TooManyResources,
            ExecError::TooManyBuffers,
            ExecError::TooManyRelocations,
        ] {
            assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
            assert_eq!(err.class(), ErrorClass::InvalidArgument);
            assert_eq!(err.errno(), -libc::EINVAL);
        }
    }

    #[test]
    fn timeout_and_interruption_are_distinct() {
        assert_eq!(ExecError::FenceTimeout.class(), ErrorClass::Timeout);
        assert_eq!(
            ExecError::Interrupted.class(),
            ErrorClass::ResourceExhaustion
        );
        assert_ne!(ExecError::FenceTimeout.errno(), ExecError::Interrupted.errno());
    }

    #[test]
    fn delivery_is_best_effort() {
        let err = ExecError::Delivery { seqno: 9 };
        assert_eq!(err.class(), ErrorClass::BestEffort);
        assert_eq!(err.errno(), -libc::EFAULT);
    }
}
