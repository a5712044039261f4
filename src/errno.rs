//! Kernel error codes
//!
//! Internal recoverable errors propagate up through `KResult`; user-visible
//! failures map to the small integer codes below. Invariant violations are
//! assertions and never travel through this type.

/// Error codes surfaced by the kernel core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Out of physical or kernel heap memory
    OutOfMemory = 1,
    /// Handle table is full
    OutOfHandles = 2,
    /// A flag argument was not understood
    BadFlag = 3,
    /// A length argument was out of range or a buffer was malformed
    BadLength = 4,
    /// A handle index did not refer to a live handle
    BadHandle = 5,
    /// Access to an unmapped or improperly protected address
    Fault = 6,
    /// The operation is not supported in the current state
    Unsupported = 7,
    /// An argument was rejected for a reason not covered above
    Invalid = 8,
    /// The backing store returned less data than required
    Io = 9,
    /// No matching child/process/thread was found
    NotFound = 10,
}

/// Result type used by all fallible kernel operations.
pub type KResult<T> = Result<T, Errno>;

impl Errno {
    /// The small integer code handed to userland.
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Errno::OutOfMemory.code(), 1);
        assert_eq!(Errno::Fault.code(), 6);
    }
}
