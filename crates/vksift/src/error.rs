use ash::vk;

/// Failures reported while loading the Vulkan API or building an
/// [`Instance`](crate::Instance).
///
/// Runtime operations on an existing instance do not surface errors: a
/// driver fault at that point leaves the GPU in a state the library cannot
/// recover from, so those entry points log the failure and abort the
/// process instead (see the crate-level documentation).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The Vulkan runtime could not be located or initialized.
    #[error("failed to load the Vulkan API: {0}")]
    ApiLoad(String),
    /// No enumerated GPU scored above zero against the device requirements.
    #[error("no suitable GPU found")]
    NoSuitableDevice,
    /// A host or device memory allocation failed.
    #[error("allocation of {size} bytes failed ({result})")]
    AllocationFailure {
        /// Requested allocation size in bytes.
        size: u64,
        /// Result code reported by the driver.
        result: vk::Result,
    },
    /// A GPU object creation call reported failure.
    #[error("failed to create {object} ({result})")]
    ResourceCreation {
        /// Human-readable name of the object being created.
        object: &'static str,
        /// Result code reported by the driver.
        result: vk::Result,
    },
    /// A shader binary is missing or malformed.
    #[error("failed to load shader '{name}': {reason}")]
    ShaderLoad {
        /// Shader module name.
        name: &'static str,
        /// Reason for the failure.
        reason: String,
    },
    /// The configuration failed validation (see [`Config`](crate::Config)).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A caller-provided value is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A command-buffer submission or another driver command reported
    /// failure.
    #[error("GPU command submission failed ({0})")]
    SubmitFailure(vk::Result),
}

pub type Result<T> = std::result::Result<T, Error>;
