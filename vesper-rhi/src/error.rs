//! Error type shared by every fallible RHI operation.

use ash::vk;

pub type Result<T, E = RhiError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RhiError {
    /// Malformed create info or an out-of-range index.
    InvalidArgument(String),
    /// Recording or mapping state violated.
    InvalidState(String),
    AlreadyMapped,
    NotMapped,
    /// Shader bytecode could not be reflected.
    MalformedBytecode(String),
    /// A fixed-capacity table overflowed.
    ResourceExhausted { what: &'static str, max: usize },
    NoSuitableDevice,
    /// The Vulkan call itself reported failure.
    DeviceOperationFailed { operation: &'static str, result: vk::Result },
    /// Vulkan loader or window handle could not be obtained.
    Loading(String),
}

impl RhiError {
    /// Adapter for `map_err` that tags a raw `vk::Result` with the failing call.
    pub fn device(operation: &'static str) -> impl FnOnce(vk::Result) -> RhiError {
        move |result| RhiError::DeviceOperationFailed { operation, result }
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        RhiError::InvalidState(msg.into())
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        RhiError::InvalidArgument(msg.into())
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        RhiError::MalformedBytecode(msg.into())
    }
}

impl From<vk::Result> for RhiError {
    fn from(result: vk::Result) -> Self {
        RhiError::DeviceOperationFailed { operation: "vulkan call", result }
    }
}

impl std::fmt::Display for RhiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RhiError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            RhiError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            RhiError::AlreadyMapped => write!(f, "Invalid state: resource is already mapped"),
            RhiError::NotMapped => write!(f, "Invalid state: resource is not mapped"),
            RhiError::MalformedBytecode(msg) => write!(f, "Malformed shader bytecode: {}", msg),
            RhiError::ResourceExhausted { what, max } => {
                write!(f, "Resource exhausted: more than {} {}", max, what)
            }
            RhiError::NoSuitableDevice => write!(f, "No suitable GPU found"),
            RhiError::DeviceOperationFailed { operation, result } => {
                write!(f, "Device operation `{}` failed: {:?}", operation, result)
            }
            RhiError::Loading(msg) => write!(f, "Failed to load: {}", msg),
        }
    }
}

impl std::error::Error for RhiError {}
