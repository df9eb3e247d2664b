//! CLI subcommand implementations.

pub mod drift;
pub mod forward;
pub mod init;
pub mod list;
pub mod status;

use anyhow::{Context, Result};
use bastion_client::{NftExecutor, SshChannel, SshConfig};
use bastion_core::{CommandChannel, GatewayConfig, RuleStore};
use tracing::debug;

use crate::config::Config;
use crate::lockfile::LockFile;

/// Everything a subcommand needs from the command line and config file.
pub struct Invocation {
    pub config: Config,
    pub json: bool,
    pub yes: bool,
}

impl Invocation {
    pub fn gateway(&self) -> Result<GatewayConfig> {
        self.config.to_gateway_config()
    }

    /// The durable rule store for `gateway`.
    pub fn open_store(&self, gateway: &GatewayConfig) -> Result<RuleStore> {
        let path = self
            .config
            .state_dir()
            .join(format!("{}.rules.json", gateway.id().file_stem()));
        RuleStore::open(&path).with_context(|| format!("failed to open rule store {}", path.display()))
    }

    /// Take the cross-process lock for `gateway`.
    pub fn lock(&self, gateway: &GatewayConfig) -> Result<LockFile> {
        let path = self
            .config
            .state_dir()
            .join(format!("{}.lock", gateway.id().file_stem()));
        LockFile::acquire(path)
    }

    /// Open the ssh channel and wrap it in the nftables executor.
    pub async fn connect(&self, gateway: &GatewayConfig) -> Result<NftExecutor<SshChannel>> {
        let control_dir = self.config.state_dir();
        std::fs::create_dir_all(&control_dir)
            .with_context(|| format!("failed to create {}", control_dir.display()))?;

        let mut ssh = SshConfig::from_gateway(gateway, &control_dir);
        ssh.strict_host_key_checking = self.config.gateway.strict_host_key_checking.clone();
        let mut channel = SshChannel::new(ssh);
        channel
            .connect()
            .await
            .with_context(|| format!("failed to connect to {}", gateway.id()))?;
        debug!(gateway = %gateway.id(), "connected");

        Ok(NftExecutor::new(channel, gateway).with_scratch_dir(control_dir))
    }
}

/// Release the shared ssh connection at the end of a command.
pub async fn disconnect(executor: &mut NftExecutor<SshChannel>) {
    if let Err(e) = executor.channel_mut().close().await {
        debug!(error = %e, "closing channel failed");
    }
}
