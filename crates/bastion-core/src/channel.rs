//! Abstract command channel to the gateway.
//!
//! Implementations carry typed [`RemoteCommand`]s to the gateway and report
//! their output. A non-zero exit code is returned as data, not as an error;
//! errors are reserved for the channel itself failing.

use std::path::Path;

use crate::command::RemoteCommand;
use crate::error::{ExecError, ExecResult};

/// Output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`ExecError::RemoteCommand`].
    pub fn check(self, command: &RemoteCommand) -> ExecResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::RemoteCommand {
                command: command.to_shell(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// A remote command channel to one gateway.
#[allow(async_fn_in_trait)]
pub trait CommandChannel: Send {
    /// Establish the channel (or confirm an existing one still works).
    async fn connect(&mut self) -> ExecResult<()>;

    /// Drop the channel. Subsequent calls must `connect` again or reconnect
    /// implicitly.
    async fn close(&mut self) -> ExecResult<()>;

    /// Run a command and wait for it to finish.
    async fn execute(&mut self, command: &RemoteCommand) -> ExecResult<CommandOutput>;

    /// Copy a local file to `remote_path` on the gateway.
    async fn transfer(&mut self, local_path: &Path, remote_path: &str) -> ExecResult<()>;

    /// Start a command whose lifetime is independent of this channel; its
    /// output goes to `log_path` on the gateway. Returns once it is started.
    async fn spawn_detached(&mut self, command: &RemoteCommand, log_path: &str) -> ExecResult<()>;

    /// Human-readable endpoint, e.g. `root@vps.example.com:22`.
    fn endpoint(&self) -> &str;
}
