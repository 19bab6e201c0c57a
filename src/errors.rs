//! Typed error taxonomy for the build pipeline core.
//!
//! One enum covers every terminal outcome a driver, stage, or collaborator
//! can settle with:
//! - `InvalidArgument` — malformed requests (empty phase mask, multi-bit
//!   primary phase, reused progress)
//! - `NotInitialized` — awaiting a progress that was never given an operation
//! - `NotFound` — a program could not be resolved in the build environment
//! - `Io` / `BrokenPipe` — subprocess, fd, and filesystem failures
//! - `Cancelled` — the cancellation token fired
//! - `NotSupported` — a stage lacks the requested hook
//!
//! A progress settlement is observable any number of times, so the error is
//! `Clone` and carries rendered messages rather than live `io::Error` sources.

use thiserror::Error;

/// Errors produced by pipelines, stages, and their collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("progress has no operation to await")]
    NotInitialized,

    #[error("program `{0}` was not found in the build environment")]
    NotFound(String),

    #[error("{0}")]
    Io(String),

    #[error("the operation was cancelled")]
    Cancelled,

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("broken pipe: {0}")]
    BrokenPipe(String),
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe => BuildError::BrokenPipe(err.to_string()),
            _ => BuildError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_carries_program_name() {
        let err = BuildError::NotFound("ninja".into());
        match &err {
            BuildError::NotFound(program) => assert_eq!(program, "ninja"),
            _ => panic!("Expected NotFound variant"),
        }
        assert!(err.to_string().contains("ninja"));
    }

    #[test]
    fn io_error_converts_by_kind() {
        let pipe = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer closed");
        assert!(matches!(BuildError::from(pipe), BuildError::BrokenPipe(_)));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let converted = BuildError::from(denied);
        match &converted {
            BuildError::Io(message) => assert!(message.contains("denied")),
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn cancelled_is_matchable_and_comparable() {
        let err = BuildError::Cancelled;
        assert!(matches!(err, BuildError::Cancelled));
        assert_eq!(err.clone(), BuildError::Cancelled);
    }

    #[test]
    fn errors_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&BuildError::NotInitialized);
        assert_std_error(&BuildError::InvalidArgument("mask is empty".into()));
    }
}
