use thiserror::Error;

/// Errors produced by the hrun protocol and session layers.
#[derive(Debug, Error)]
pub enum HrunError {
    #[error("malformed command record: {0}")]
    MalformedCommand(String),

    #[error("empty command")]
    EmptyCommand,

    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("PTY allocation failed: {0}")]
    PtyAllocationFailed(String),

    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("malformed control record: {0}")]
    MalformedControl(String),

    #[error("connection I/O error: {0}")]
    ConnectionIo(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl HrunError {
    /// Whether this error aborts a session before any relaying starts.
    pub fn is_command_stage(&self) -> bool {
        matches!(
            self,
            HrunError::MalformedCommand(_)
                | HrunError::EmptyCommand
                | HrunError::CommandNotAllowed(_)
                | HrunError::PtyAllocationFailed(_)
                | HrunError::SpawnFailed(_)
        )
    }
}

impl From<serde_json::Error> for HrunError {
    fn from(e: serde_json::Error) -> Self {
        HrunError::MalformedCommand(e.to_string())
    }
}

pub type HrunResult<T> = Result<T, HrunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_stage_classification() {
        assert!(HrunError::EmptyCommand.is_command_stage());
        assert!(HrunError::CommandNotAllowed("rm".into()).is_command_stage());
        assert!(HrunError::SpawnFailed("nope".into()).is_command_stage());
        assert!(!HrunError::ResizeFailed("closed".into()).is_command_stage());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(!HrunError::from(io).is_command_stage());
    }
}
