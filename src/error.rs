pub type Result<T> = std::result::Result<T, Error>;

/// Raw Vulkan result codes.
pub mod code {
    pub const SUCCESS: i32 = 0;
    pub const INCOMPLETE: i32 = 5;
    pub const ERROR_OUT_OF_HOST_MEMORY: i32 = -1;
    pub const ERROR_OUT_OF_DEVICE_MEMORY: i32 = -2;
    pub const ERROR_MEMORY_MAP_FAILED: i32 = -5;
    pub const ERROR_FEATURE_NOT_PRESENT: i32 = -8;
    pub const ERROR_TOO_MANY_OBJECTS: i32 = -10;
    pub const ERROR_UNKNOWN: i32 = -13;
    pub const ERROR_VALIDATION_FAILED: i32 = -1000011001;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Out of host memory")]
    OutOfHostMemory,

    #[error("Out of device memory")]
    OutOfDeviceMemory,

    #[error("Memory map failed")]
    MemoryMapFailed,

    #[error("Feature not present: {0}")]
    FeatureNotPresent(String),

    #[error("Too many device memory objects")]
    TooManyObjects,

    #[error("Memory corruption detected: {0}")]
    CorruptionDetected(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub fn code(&self) -> i32 {
        match self {
            Error::OutOfHostMemory => code::ERROR_OUT_OF_HOST_MEMORY,
            Error::OutOfDeviceMemory => code::ERROR_OUT_OF_DEVICE_MEMORY,
            Error::MemoryMapFailed => code::ERROR_MEMORY_MAP_FAILED,
            Error::FeatureNotPresent(_) => code::ERROR_FEATURE_NOT_PRESENT,
            Error::TooManyObjects => code::ERROR_TOO_MANY_OBJECTS,
            Error::CorruptionDetected(_) | Error::Backend(_) => code::ERROR_UNKNOWN,
            Error::InvalidHandle(_) | Error::InvalidArgument(_) => code::ERROR_VALIDATION_FAILED,
        }
    }

    /// Out-of-memory failures are the ones worth retrying with another memory type or a
    /// smaller block.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfDeviceMemory | Error::OutOfHostMemory)
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub(crate) fn invalid_handle(message: impl Into<String>) -> Self {
        Error::InvalidHandle(message.into())
    }

    pub(crate) fn feature_not_present(message: impl Into<String>) -> Self {
        Error::FeatureNotPresent(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_c_interface() {
        assert_eq!(Error::OutOfDeviceMemory.code(), -2);
        assert_eq!(Error::feature_not_present("x").code(), -8);
        assert_eq!(Error::CorruptionDetected(String::new()).code(), -13);
        assert_eq!(Error::TooManyObjects.code(), -10);
        assert!(Error::OutOfHostMemory.is_out_of_memory());
        assert!(!Error::MemoryMapFailed.is_out_of_memory());
    }
}
