use strata_core::CoreError;

/// Errors from device-map dispatch and offload orchestration.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("device map gives no placement for: {}", .paths.join(", "))]
    IncompleteDeviceMap { paths: Vec<String> },

    #[error("disk placement needs an offload directory for: {}", .paths.join(", "))]
    OffloadDirRequired { paths: Vec<String> },

    #[error("the whole model maps to disk; use disk_offload instead of dispatch_model")]
    DiskOnlyFastPath,

    #[error("model has offloaded (meta) parameters and cannot be moved wholesale")]
    OffloadedModelMoved,

    #[error("model is already dispatched")]
    AlreadyDispatched,

    #[error("invalid device map spec '{0}'")]
    InvalidDeviceMapSpec(String),

    #[error("checkpoint is missing keys: {}", .keys.join(", "))]
    MissingCheckpointKeys { keys: Vec<String> },

    #[error("checkpoint has unexpected keys: {}", .keys.join(", "))]
    UnexpectedCheckpointKeys { keys: Vec<String> },

    #[error("no weight named '{0}' in any source")]
    MissingWeight(String),

    #[error("weights map has no sources")]
    EmptyWeightsMap,

    #[error("parameter '{0}' is a meta placeholder with no value to place")]
    MetaParameter(String),

    #[error("offload index error: {0}")]
    Index(String),

    #[error("no module at path '{0}'")]
    ModuleNotFound(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
