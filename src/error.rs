use thiserror::Error;

use crate::alloc::listener::AccessKind;

pub type Result<T, E = GuardError> = std::result::Result<T, E>;

/// Everything a guarded operation can refuse to do. Validation errors are
/// raised before the raw operation runs, so the memory is never touched when
/// one of these comes back.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum GuardError {
    #[error(
        "tried to access ({kind}) unallocated (or out of the record) memory \
         at address {address:#018x} with size {size}"
    )]
    AccessViolation {
        address: u64,
        size: u64,
        kind: AccessKind,
    },

    #[error("tried to free unallocated (or out of the record) memory at address {address:#018x}")]
    UnknownFree { address: u64 },

    #[error(
        "tried to reallocate unallocated (or out of the record) memory at address \
         {address:#018x} with new size {new_size}"
    )]
    UnknownReallocate { address: u64, new_size: u64 },

    #[error("raw allocator could not provide {size} bytes")]
    AllocationFailed { size: u64 },

    #[error("raw allocator could not grow {address:#018x} to {new_size} bytes")]
    ReallocationFailed { address: u64, new_size: u64 },

    #[error("allocation path monitoring is not enabled")]
    PathMonitoringDisabled,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not export diagnostics: {0}")]
    Export(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures while turning configuration into a wired-up guard. These are
/// only ever produced at startup.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`{name}` must be a boolean, got `{value}`")]
    InvalidFlag { name: String, value: String },

    #[error("unknown registry strategy `{0}` (expected one of: auto, exact, range)")]
    UnknownStrategy(String),

    #[error("registry strategy `{strategy}` cannot be used with {reason}")]
    IncompatibleStrategy {
        strategy: &'static str,
        reason: &'static str,
    },

    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
}
