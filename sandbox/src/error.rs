/// Failures of the sandbox backend itself. A script that exits non-zero is
/// not an error here; it is a normal [`crate::ProcessExit`].
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Host prerequisites are missing (interpreter, kernel feature, directory).
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    /// The isolated workspace could not be prepared.
    #[error("sandbox creation failed: {0}")]
    CreationFailed(String),

    /// The script process could not be launched.
    #[error("sandbox start failed: {0}")]
    StartFailed(String),

    #[error("waiting for script exit failed: {0}")]
    WaitFailed(String),

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("sandbox io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
