//! Client configuration at `~/.bastion/config.toml`.
//!
//! Describes the gateway, the homelab tunnel addresses, the managed firewall
//! layout, the tunnel unit and timeouts. CLI flags override file values. The
//! file is turned into a [`GatewayConfig`] that is passed explicitly to the
//! executor and reconciler.

use anyhow::{Context, Result};
use bastion_core::{Credential, FirewallLayout, GatewayConfig, Timeouts, TunnelLayout};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub homelab: HomelabSection,
    #[serde(default)]
    pub firewall: FirewallSection,
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub state: StateSection,
}

/// How to reach the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Gateway hostname or address (empty = none).
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    /// Private key passed to ssh with `-i`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,

    /// Password for `sshpass -e`. Prefer keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default = "default_strict_host_key_checking")]
    pub strict_host_key_checking: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            user: default_user(),
            identity_file: None,
            password: None,
            strict_host_key_checking: default_strict_host_key_checking(),
        }
    }
}

/// Tunnel addresses of the homelab, the DNAT targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomelabSection {
    #[serde(default = "default_tunnel_v4")]
    pub tunnel_v4: Ipv4Addr,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_v6: Option<Ipv6Addr>,
}

impl Default for HomelabSection {
    fn default() -> Self {
        Self {
            tunnel_v4: default_tunnel_v4(),
            tunnel_v6: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallSection {
    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_chain")]
    pub chain: String,

    /// Where the managed table is saved for the tunnel's PostUp to reload.
    #[serde(default = "default_persist_dir")]
    pub persist_dir: String,
}

impl Default for FirewallSection {
    fn default() -> Self {
        Self {
            table: default_table(),
            chain: default_chain(),
            persist_dir: default_persist_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_interface")]
    pub interface: String,

    /// systemd unit; `{interface}` is replaced with the interface name.
    #[serde(default = "default_unit")]
    pub unit: String,

    #[serde(default = "default_restart_log")]
    pub restart_log: String,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            unit: default_unit(),
            restart_log: default_restart_log(),
        }
    }
}

/// Timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_connect")]
    pub connect: u64,
    #[serde(default = "default_command")]
    pub command: u64,
    #[serde(default = "default_verify_reconnect")]
    pub verify_reconnect: u64,
    #[serde(default = "default_settle")]
    pub settle: u64,
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
    /// First backoff between reconnect attempts; doubled per attempt.
    #[serde(default = "default_verify_backoff")]
    pub verify_backoff: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            command: default_command(),
            verify_reconnect: default_verify_reconnect(),
            settle: default_settle(),
            verify_attempts: default_verify_attempts(),
            verify_backoff: default_verify_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSection {
    /// Holds the rule store, lock files and ssh control sockets.
    #[serde(default = "default_state_dir")]
    pub dir: String,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

fn default_strict_host_key_checking() -> String {
    "accept-new".to_string()
}

fn default_tunnel_v4() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 2)
}

fn default_table() -> String {
    "bastion".to_string()
}

fn default_chain() -> String {
    "prerouting".to_string()
}

fn default_persist_dir() -> String {
    "/etc/bastion".to_string()
}

fn default_interface() -> String {
    "wg0".to_string()
}

fn default_unit() -> String {
    "wg-quick@{interface}".to_string()
}

fn default_restart_log() -> String {
    "/var/log/bastion-restart.log".to_string()
}

fn default_connect() -> u64 {
    10
}

fn default_command() -> u64 {
    30
}

fn default_verify_reconnect() -> u64 {
    15
}

fn default_settle() -> u64 {
    30
}

fn default_verify_attempts() -> u32 {
    5
}

fn default_verify_backoff() -> u64 {
    2
}

fn default_state_dir() -> String {
    "~/.bastion/state".to_string()
}

/// `~/.bastion/config.toml`.
pub fn default_config_path() -> String {
    let home = dirs::home_dir().unwrap_or_default();
    home.join(".bastion")
        .join("config.toml")
        .to_string_lossy()
        .to_string()
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().unwrap_or_default().join(rest),
        None if path == "~" => dirs::home_dir().unwrap_or_default(),
        None => PathBuf::from(path),
    }
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &str) -> Result<Self> {
        let path = Path::new(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Save the configuration to a TOML file.
    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;

        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config to {}", path.display()))?;

        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        expand_home(&self.state.dir)
    }

    /// Build the gateway description the core works with.
    pub fn to_gateway_config(&self) -> Result<GatewayConfig> {
        let gw = &self.gateway;
        if gw.host.is_empty() {
            anyhow::bail!("no gateway host configured: set [gateway].host or pass --host");
        }

        let credential = match (&gw.password, &gw.identity_file) {
            (Some(password), _) => Credential::Password(password.clone()),
            (None, Some(key)) => Credential::KeyFile(expand_home(key)),
            (None, None) => Credential::Agent,
        };

        let t = &self.timeouts;
        Ok(GatewayConfig {
            host: gw.host.clone(),
            port: gw.port,
            user: gw.user.clone(),
            credential,
            homelab_v4: self.homelab.tunnel_v4,
            homelab_v6: self.homelab.tunnel_v6,
            firewall: FirewallLayout {
                table: self.firewall.table.clone(),
                chain: self.firewall.chain.clone(),
                persist_dir: self.firewall.persist_dir.clone(),
            },
            tunnel: TunnelLayout {
                interface: self.tunnel.interface.clone(),
                unit: self.tunnel.unit.replace("{interface}", &self.tunnel.interface),
                restart_log: self.tunnel.restart_log.clone(),
            },
            timeouts: Timeouts {
                connect: Duration::from_secs(t.connect),
                command: Duration::from_secs(t.command),
                verify_reconnect: Duration::from_secs(t.verify_reconnect),
                settle: Duration::from_secs(t.settle),
                verify_attempts: t.verify_attempts,
                verify_backoff: Duration::from_secs(t.verify_backoff),
            },
        })
    }
}
