use thiserror::Error;

/// Coarse error classification surfaced verbatim by front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    AlreadyRunning,
    ContainerRunning,
    InUse,
    BuildError,
    ImageNotFound,
    InvalidState,
    DigestMismatch,
    ParseError,
    Network,
    Runtime,
    Config,
    Io,
    Serialization,
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::AlreadyRunning => "AlreadyRunning",
            Self::ContainerRunning => "ContainerRunning",
            Self::InUse => "InUse",
            Self::BuildError => "BuildError",
            Self::ImageNotFound => "ImageNotFound",
            Self::InvalidState => "InvalidState",
            Self::DigestMismatch => "DigestMismatch",
            Self::ParseError => "ParseError",
            Self::Network => "NetworkError",
            Self::Runtime => "RuntimeError",
            Self::Config => "ConfigError",
            Self::Io => "IoError",
            Self::Serialization => "SerializationError",
            Self::Other => "Error",
        };
        f.write_str(s)
    }
}

/// Dockyard engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    /// Lookup miss for a tag, blob, container, volume or network
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Name already taken
    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    /// Start requested on a running container
    #[error("container {0} is already running")]
    AlreadyRunning(String),

    /// Unforced removal of a running container
    #[error("container {0} is running; stop it first or force removal")]
    ContainerRunning(String),

    /// Removal blocked by active users
    #[error("{kind} '{name}' is in use by {users} container(s)")]
    InUse {
        kind: &'static str,
        name: String,
        users: usize,
    },

    /// Build instruction failed
    #[error("build failed at instruction {index}: {cause}")]
    BuildError { index: usize, cause: String },

    /// Image reference could not be resolved
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Transition not allowed from the current state
    #[error("cannot {operation} container {id} in state {state}")]
    InvalidState {
        id: String,
        state: String,
        operation: &'static str,
    },

    /// Content did not hash to its declared digest
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Build file parse failure
    #[error("line {line}: {message}")]
    ParseError { line: usize, message: String },

    /// Network configuration or addressing error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Process supervision error
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn build(index: usize, cause: impl std::fmt::Display) -> Self {
        Self::BuildError {
            index,
            cause: cause.to_string(),
        }
    }

    /// Stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::ContainerRunning(_) => ErrorKind::ContainerRunning,
            Self::InUse { .. } => ErrorKind::InUse,
            Self::BuildError { .. } => ErrorKind::BuildError,
            Self::ImageNotFound(_) => ErrorKind::ImageNotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            Self::ParseError { .. } => ErrorKind::ParseError,
            Self::NetworkError(_) => ErrorKind::Network,
            Self::RuntimeError(_) => ErrorKind::Runtime,
            Self::ConfigError(_) => ErrorKind::Config,
            Self::IoError(_) => ErrorKind::Io,
            Self::SerializationError(_) => ErrorKind::Serialization,
            Self::Other(_) => ErrorKind::Other,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}

/// Result type alias for Dockyard operations
pub type Result<T> = std::result::Result<T, EngineError>;
