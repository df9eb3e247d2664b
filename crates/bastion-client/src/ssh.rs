//! Command channel over the system `ssh` and `scp` binaries.
//!
//! All invocations share one ControlMaster socket per gateway, so repeated
//! commands reuse a single authenticated connection. Closing the channel
//! tears the master down; the next `connect` builds a fresh one.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use bastion_core::{
    shell_quote, CommandChannel, CommandOutput, Credential, ExecError, ExecResult, GatewayConfig,
    RemoteCommand,
};
use tokio::process::Command;
use tracing::{debug, warn};

/// ssh reserves exit code 255 for its own failures.
const SSH_FAILURE: i32 = 255;

/// How to reach one gateway with ssh.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// `user@host`.
    pub destination: String,
    pub port: u16,
    pub credential: Credential,
    /// ControlMaster socket path.
    pub control_path: PathBuf,
    /// Value for `StrictHostKeyChecking`.
    pub strict_host_key_checking: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// How long an idle master lingers.
    pub control_persist: Duration,
    /// Binaries to run; looked up on `PATH` unless absolute.
    pub ssh_program: PathBuf,
    pub scp_program: PathBuf,
}

impl SshConfig {
    /// Build from a gateway description, placing the control socket in
    /// `control_dir`.
    pub fn from_gateway(gateway: &GatewayConfig, control_dir: &Path) -> Self {
        Self {
            destination: gateway.destination(),
            port: gateway.port,
            credential: gateway.credential.clone(),
            control_path: control_dir.join(format!("ctl-{}", gateway.id().file_stem())),
            strict_host_key_checking: "accept-new".into(),
            connect_timeout: gateway.timeouts.connect,
            command_timeout: gateway.timeouts.command,
            control_persist: Duration::from_secs(60),
            ssh_program: PathBuf::from("ssh"),
            scp_program: PathBuf::from("scp"),
        }
    }

    /// Options shared by every ssh/scp invocation.
    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut opt = |o: String| {
            args.push("-o".to_string());
            args.push(o);
        };
        opt("ControlMaster=auto".into());
        opt(format!("ControlPath={}", self.control_path.display()));
        opt(format!("ControlPersist={}", self.control_persist.as_secs()));
        opt(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        opt(format!("StrictHostKeyChecking={}", self.strict_host_key_checking));
        opt("ServerAliveInterval=5".into());
        opt("ServerAliveCountMax=3".into());
        // Password auth needs the prompt that batch mode suppresses.
        if !matches!(self.credential, Credential::Password(_)) {
            opt("BatchMode=yes".into());
        }
        if let Credential::KeyFile(path) = &self.credential {
            args.push("-i".to_string());
            args.push(path.display().to_string());
        }
        args
    }

    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args
    }

    pub fn scp_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.push("-P".to_string());
        args.push(self.port.to_string());
        args
    }

    /// A process for `program`, wrapped in `sshpass -e` for password auth.
    fn command(&self, program: &Path) -> Command {
        let mut cmd = match &self.credential {
            Credential::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(program).env("SSHPASS", password);
                cmd
            }
            _ => Command::new(program),
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Map a failed ssh/scp invocation onto the error taxonomy.
pub fn classify_ssh_failure(endpoint: &str, stderr: &str, connect_timeout: Duration) -> ExecError {
    let reason = stderr.trim().to_string();
    let lower = reason.to_lowercase();
    if lower.contains("permission denied")
        || lower.contains("authentication failed")
        || lower.contains("too many authentication failures")
        || lower.contains("host key verification failed")
    {
        ExecError::Auth {
            endpoint: endpoint.to_string(),
            reason,
        }
    } else if lower.contains("timed out") {
        ExecError::ConnectTimeout {
            endpoint: endpoint.to_string(),
            after: connect_timeout,
        }
    } else {
        ExecError::Connect {
            endpoint: endpoint.to_string(),
            reason,
        }
    }
}

fn exit_code(output: &Output) -> i32 {
    output.status.code().unwrap_or(-1)
}

fn spawn_error(program: &Path, e: std::io::Error) -> ExecError {
    let program = program.display();
    if e.kind() == std::io::ErrorKind::NotFound {
        ExecError::Io(format!("{program} not found in PATH"))
    } else {
        ExecError::Io(format!("failed to run {program}: {e}"))
    }
}

/// Shell line that starts `command` in its own session on the gateway.
///
/// `setsid -f` forks so the job outlives the ssh connection that launched
/// it; all three std streams are detached from that connection.
fn detached_line(command: &RemoteCommand, log_path: &str) -> String {
    format!(
        "setsid -f sh -c {} > {} 2>&1 < /dev/null",
        shell_quote(&command.to_shell()),
        shell_quote(log_path)
    )
}

/// [`CommandChannel`] backed by OpenSSH.
pub struct SshChannel {
    config: SshConfig,
    endpoint: String,
    connected: bool,
}

impl SshChannel {
    pub fn new(config: SshConfig) -> Self {
        let endpoint = format!("{}:{}", config.destination, config.port);
        Self {
            config,
            endpoint,
            connected: false,
        }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Run `line` on the gateway through ssh, bounded by `limit`.
    ///
    /// Returns `None` when the limit expired; the child is killed on drop.
    async fn ssh(&self, line: &str, limit: Duration) -> ExecResult<Option<Output>> {
        let program = &self.config.ssh_program;
        let mut cmd = self.config.command(program);
        cmd.args(self.config.ssh_args())
            .arg(&self.config.destination)
            .arg("--")
            .arg(line);
        debug!(endpoint = %self.endpoint, command = %line, "ssh exec");
        let child = cmd.spawn().map_err(|e| spawn_error(program, e))?;
        match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => Ok(Some(output?)),
            Err(_) => Ok(None),
        }
    }

    fn failure(&self, output: &Output) -> ExecError {
        let stderr = String::from_utf8_lossy(&output.stderr);
        classify_ssh_failure(&self.endpoint, &stderr, self.config.connect_timeout)
    }
}

impl CommandChannel for SshChannel {
    async fn connect(&mut self) -> ExecResult<()> {
        let limit = self.config.connect_timeout;
        let output = self
            .ssh("true", limit)
            .await?
            .ok_or_else(|| ExecError::ConnectTimeout {
                endpoint: self.endpoint.clone(),
                after: limit,
            })?;
        if !output.status.success() {
            return Err(self.failure(&output));
        }
        debug!(endpoint = %self.endpoint, "channel connected");
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> ExecResult<()> {
        self.connected = false;
        let program = &self.config.ssh_program;
        let mut cmd = self.config.command(program);
        cmd.args(self.config.ssh_args())
            .arg("-O")
            .arg("exit")
            .arg(&self.config.destination);
        let child = cmd.spawn().map_err(|e| spawn_error(program, e))?;
        match tokio::time::timeout(self.config.connect_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if !output.status.success() => {
                // No master running is the normal case after a restart.
                debug!(
                    endpoint = %self.endpoint,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "no control master to close"
                );
            }
            Ok(Ok(_)) => debug!(endpoint = %self.endpoint, "control master closed"),
            Ok(Err(e)) => warn!(endpoint = %self.endpoint, error = %e, "closing control master failed"),
            Err(_) => warn!(endpoint = %self.endpoint, "closing control master timed out"),
        }
        Ok(())
    }

    async fn execute(&mut self, command: &RemoteCommand) -> ExecResult<CommandOutput> {
        let line = command.to_shell();
        let limit = self.config.command_timeout;
        let output = self
            .ssh(&line, limit)
            .await?
            .ok_or_else(|| ExecError::CommandTimeout {
                command: line.clone(),
                after: limit,
            })?;
        let code = exit_code(&output);
        if code == SSH_FAILURE {
            return Err(self.failure(&output));
        }
        self.connected = true;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: code,
        })
    }

    async fn transfer(&mut self, local_path: &Path, remote_path: &str) -> ExecResult<()> {
        let target = format!("{}:{}", self.config.destination, remote_path);
        let program = &self.config.scp_program;
        let mut cmd = self.config.command(program);
        cmd.args(self.config.scp_args()).arg(local_path).arg(&target);
        debug!(endpoint = %self.endpoint, local = %local_path.display(), remote = %remote_path, "scp");

        let child = cmd.spawn().map_err(|e| spawn_error(program, e))?;
        let limit = self.config.command_timeout;
        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ExecError::CommandTimeout {
                    command: format!("scp {} {target}", local_path.display()),
                    after: limit,
                })
            }
        };
        if output.status.success() {
            return Ok(());
        }
        match self.failure(&output) {
            ExecError::Connect { reason, .. } => Err(ExecError::Transfer {
                remote: remote_path.to_string(),
                reason,
            }),
            other => Err(other),
        }
    }

    async fn spawn_detached(&mut self, command: &RemoteCommand, log_path: &str) -> ExecResult<()> {
        let line = detached_line(command, log_path);
        let limit = self.config.command_timeout;
        let output = self
            .ssh(&line, limit)
            .await?
            .ok_or_else(|| ExecError::CommandTimeout {
                command: line.clone(),
                after: limit,
            })?;
        match exit_code(&output) {
            0 => Ok(()),
            SSH_FAILURE => Err(self.failure(&output)),
            code => Err(ExecError::RemoteCommand {
                command: line,
                exit_code: code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::CommandBuilder;
    use std::net::Ipv4Addr;
    use std::os::unix::fs::PermissionsExt;

    // Scripts are written and executed by several tests; a script still open
    // for writing in a forked child fails to exec with ETXTBSY.
    static STUBS: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    fn gateway() -> GatewayConfig {
        let mut gw = GatewayConfig::new("vps.example.com", Ipv4Addr::new(10, 0, 0, 2));
        gw.port = 2222;
        gw
    }

    #[test]
    fn ssh_args_carry_port_and_control_socket() {
        let cfg = SshConfig::from_gateway(&gateway(), Path::new("/run/bastion"));
        let args = cfg.ssh_args();
        assert!(args.contains(&"ControlPath=/run/bastion/ctl-root_vps.example.com_2222".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert_eq!(&args[args.len() - 2..], ["-p", "2222"]);
        assert_eq!(&cfg.scp_args()[args.len() - 2..], ["-P", "2222"]);
    }

    #[test]
    fn key_file_is_passed_with_dash_i() {
        let mut gw = gateway();
        gw.credential = Credential::KeyFile("/root/.ssh/vps".into());
        let args = SshConfig::from_gateway(&gw, Path::new("/tmp")).ssh_args();
        let pos = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[pos + 1], "/root/.ssh/vps");
    }

    #[test]
    fn password_disables_batch_mode() {
        let mut gw = gateway();
        gw.credential = Credential::Password("secret".into());
        let cfg = SshConfig::from_gateway(&gw, Path::new("/tmp"));
        assert!(!cfg.ssh_args().contains(&"BatchMode=yes".to_string()));
        assert!(!format!("{cfg:?}").contains("secret"));
    }

    #[test]
    fn classifies_auth_failures() {
        let err = classify_ssh_failure(
            "root@vps:22",
            "root@vps: Permission denied (publickey,password).\n",
            Duration::from_secs(10),
        );
        assert!(matches!(err, ExecError::Auth { .. }));
    }

    #[test]
    fn classifies_timeouts() {
        let err = classify_ssh_failure(
            "root@vps:22",
            "ssh: connect to host vps port 22: Connection timed out",
            Duration::from_secs(10),
        );
        assert_eq!(
            err,
            ExecError::ConnectTimeout {
                endpoint: "root@vps:22".into(),
                after: Duration::from_secs(10),
            }
        );
    }

    #[test]
    fn classifies_other_failures_as_connect() {
        let err = classify_ssh_failure(
            "root@vps:22",
            "ssh: Could not resolve hostname vps: Name or service not known",
            Duration::from_secs(10),
        );
        assert!(err.is_connectivity());
        assert!(matches!(err, ExecError::Connect { .. }));
    }

    /// Channel whose `ssh` is a shell script with `body`.
    fn stub_channel(dir: &Path, body: &str, command_timeout: Duration) -> SshChannel {
        let path = dir.join("ssh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut cfg = SshConfig::from_gateway(&gateway(), dir);
        cfg.ssh_program = path;
        cfg.command_timeout = command_timeout;
        SshChannel::new(cfg)
    }

    #[test]
    fn detached_line_quotes_command_and_log() {
        let restart = CommandBuilder::default().run_restart_script();
        assert_eq!(
            detached_line(&restart, "/var/log/bastion restart.log"),
            "setsid -f sh -c 'sh /etc/bastion/restart.sh' > '/var/log/bastion restart.log' 2>&1 < /dev/null"
        );
        assert_eq!(
            detached_line(&restart, "/var/log/bastion-restart.log"),
            "setsid -f sh -c 'sh /etc/bastion/restart.sh' > /var/log/bastion-restart.log 2>&1 < /dev/null"
        );
    }

    #[tokio::test]
    async fn exit_255_with_permission_denied_is_auth() {
        let _guard = STUBS.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let mut channel = stub_channel(
            dir.path(),
            "echo 'root@vps.example.com: Permission denied (publickey).' >&2\nexit 255",
            Duration::from_secs(10),
        );

        let err = channel
            .execute(&CommandBuilder::default().daemon_status())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Auth { .. }), "{err:?}");
        assert!(!err.is_connectivity());
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn remote_exit_status_is_returned_not_raised() {
        let _guard = STUBS.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let mut channel = stub_channel(dir.path(), "echo inactive\nexit 3", Duration::from_secs(10));

        let out = channel
            .execute(&CommandBuilder::default().daemon_status())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "inactive");
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let _guard = STUBS.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let limit = Duration::from_millis(300);
        let mut channel = stub_channel(dir.path(), "exec sleep 5", limit);

        let started = std::time::Instant::now();
        let err = channel
            .execute(&CommandBuilder::default().daemon_status())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));
        match err {
            ExecError::CommandTimeout { command, after } => {
                assert_eq!(command, "systemctl is-active wg-quick@wg0");
                assert_eq!(after, limit);
            }
            other => panic!("expected CommandTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_detached_sends_setsid_line() {
        let _guard = STUBS.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let seen = dir.path().join("line");
        let body = format!(
            "for a; do last=$a; done\nprintf '%s' \"$last\" > {}",
            shell_quote(&seen.display().to_string())
        );
        let mut channel = stub_channel(dir.path(), &body, Duration::from_secs(10));

        let restart = CommandBuilder::default().run_restart_script();
        channel
            .spawn_detached(&restart, "/var/log/bastion-restart.log")
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&seen).unwrap(),
            detached_line(&restart, "/var/log/bastion-restart.log")
        );
    }

    #[test]
    fn new_channel_is_not_connected() {
        let channel = SshChannel::new(SshConfig::from_gateway(&gateway(), Path::new("/tmp")));
        assert!(!channel.is_connected());
        assert_eq!(channel.endpoint(), "root@vps.example.com:2222");
    }
}
