//! Typed errors that callers need to tell apart.
//!
//! Everything else travels as `anyhow::Error`; these are recovered with
//! `downcast_ref` where the distinction matters.

use std::path::PathBuf;

use thiserror::Error;

/// Failures saving or loading a persisted task.
#[derive(Error, Debug)]
pub enum PersistError {
    /// The settings kind has no registered serializer. Never swallowed.
    #[error("unknown settings type `{0}`")]
    UnknownSettingsType(String),

    #[error(
        "couldn't find the task {}: pass the full path to the task file \
         or the run identifier (e.g. 20110516_091754)",
        .0.display()
    )]
    NotFound(PathBuf),

    #[error("problem loading {}: unexpected end of data", .0.display())]
    UnexpectedEof(PathBuf),

    #[error("serialize task: {0}")]
    Serialize(String),

    #[error("malformed task file {}: {message}", path.display())]
    Malformed { path: PathBuf, message: String },

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PersistError {
    /// Soft errors are reported and turned into an absent result by loaders.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            PersistError::NotFound(_) | PersistError::UnexpectedEof(_)
        )
    }
}

/// The solver process could not be started.
#[derive(Error, Debug)]
#[error("failed to start `{program}` in {}: {source}", workdir.display())]
pub struct SpawnError {
    pub program: String,
    pub workdir: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_messages_stay_distinguishable() {
        let missing = PersistError::NotFound(PathBuf::from("/runs/x/taskfile.json"));
        let truncated = PersistError::UnexpectedEof(PathBuf::from("/runs/y/taskfile.json"));
        assert!(missing.to_string().contains("couldn't find the task"));
        assert!(truncated.to_string().contains("unexpected end of data"));
        assert!(missing.is_soft());
        assert!(truncated.is_soft());
        assert!(!PersistError::UnknownSettingsType("lsc".to_string()).is_soft());
    }
}
