//! Typed errors for the provisioning steps.
//!
//! Library code returns these; the binary converts them to `anyhow::Error`
//! at the boundary.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::cmd::CommandError;
use crate::provision::{Step, StepReport};

#[derive(Debug, Error)]
pub enum AccountCreationError {
    #[error("invalid UID range {min}-{max}: lower bound exceeds upper bound")]
    InvalidRange { min: u32, max: u32 },

    #[error("no free UID/GID left in range {min}-{max}")]
    RangeExhausted { min: u32, max: u32 },

    #[error("existing account '{name}' is incompatible: {reason}")]
    Conflict { name: String, reason: String },

    #[error("creating account '{0}' requires root privileges (use sudo)")]
    InsufficientPrivilege(String),

    #[error("account backend '{backend}' is not available: {program} not found in PATH")]
    BackendUnavailable {
        backend: &'static str,
        program: &'static str,
    },

    #[error("account backend '{backend}' failed")]
    Backend {
        backend: &'static str,
        #[source]
        source: CommandError,
    },

    #[error("failed to read account database {}", path.display())]
    Database {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum FilesystemError {
    #[error("{} exists but is not a {expected}", path.display())]
    PathConflict {
        path: PathBuf,
        expected: &'static str,
    },

    #[error("required source {} is missing", path.display())]
    MissingSource { path: PathBuf },

    #[error("account '{0}' does not exist; cannot assign ownership")]
    AccountMissing(String),

    #[error("failed to {op} {}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FilesystemError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Account(#[from] AccountCreationError),

    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
}

/// The first failing step of a run, together with what completed before it.
#[derive(Debug, Error)]
#[error("step '{step}' failed: {source}")]
pub struct StepFailure {
    pub step: Step,
    pub completed: Vec<StepReport>,
    #[source]
    pub source: ProvisionError,
}
