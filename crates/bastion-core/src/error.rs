use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::reconciler::ReconcileState;
use crate::rule::{Action, AddressFamily};

/// A requested rule is malformed. Never reaches the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid port spec '{0}': expected a port 1-65535 or a range lo-hi with lo <= hi")]
    InvalidPortSpec(String),

    #[error("invalid protocol '{0}': expected tcp or udp")]
    InvalidProtocol(String),
}

/// Errors produced by the durable rule store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rule store io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rule store at {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

/// Errors produced while talking to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("cannot connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("authentication to {endpoint} failed: {reason}")]
    Auth { endpoint: String, reason: String },

    #[error("remote command `{command}` exited with {exit_code}: {stderr}")]
    RemoteCommand {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("connection to {endpoint} timed out after {after:?}")]
    ConnectTimeout { endpoint: String, after: Duration },

    #[error("remote command `{command}` timed out after {after:?}")]
    CommandTimeout { command: String, after: Duration },

    #[error("file transfer to {remote} failed: {reason}")]
    Transfer { remote: String, reason: String },

    #[error("cannot parse live rules: {0}")]
    Parse(String),

    #[error("local io error: {0}")]
    Io(String),
}

impl ExecError {
    /// Whether this error means the gateway could not be reached at all.
    ///
    /// Only these are retried by the post-restart reconnect loop.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::ConnectTimeout { .. })
    }

    /// Whether this error is a timeout of some kind.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout { .. } | Self::CommandTimeout { .. })
    }
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e.to_string())
    }
}

pub type ExecResult<T> = Result<T, ExecError>;

/// Terminal failure of a reconciliation cycle.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("cancelled before any change was made")]
    Cancelled,

    #[error("local rule store: {0}")]
    Store(#[from] StoreError),

    #[error("{phase} failed{}: {source}", family_suffix(.family))]
    Phase {
        phase: ReconcileState,
        family: Option<AddressFamily>,
        source: ExecError,
    },

    #[error(
        "partial application: applied {} but {failed} failed: {source}",
        join_families(.applied)
    )]
    PartialApplication {
        applied: Vec<AddressFamily>,
        failed: AddressFamily,
        source: ExecError,
    },

    #[error("verification mismatch after {action}: live state disagrees for {}", join_families(.families))]
    VerificationMismatch {
        action: Action,
        families: Vec<AddressFamily>,
    },

    #[error("gateway unreachable after restart: {attempts} reconnect attempts timed out (last after {after:?})")]
    VerifyReconnectTimeout { attempts: u32, after: Duration },
}

impl ReconcileError {
    /// The state the cycle was in when it failed.
    pub fn phase(&self) -> ReconcileState {
        match self {
            Self::Validation(_) | Self::Cancelled => ReconcileState::Validating,
            Self::Store(_) | Self::PartialApplication { .. } => ReconcileState::Applying,
            Self::Phase { phase, .. } => *phase,
            Self::VerificationMismatch { .. } | Self::VerifyReconnectTimeout { .. } => {
                ReconcileState::Verifying
            }
        }
    }
}

fn family_suffix(family: &Option<AddressFamily>) -> String {
    family.map(|f| format!(" for {f}")).unwrap_or_default()
}

fn join_families(families: &[AddressFamily]) -> String {
    families
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
