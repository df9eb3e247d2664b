//! Explicit description of one gateway and the homelab behind it.
//!
//! Everything the reconciler and executors need (addresses, names of the
//! managed firewall namespace, the tunnel unit, timeouts) is carried here and
//! passed in by the caller.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::rule::{AddressFamily, PortRule, PortSpec, Protocol};

/// How to authenticate to the gateway. Opaque to the core.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Whatever the local ssh agent / default keys provide.
    Agent,
    /// A private key file.
    KeyFile(PathBuf),
    /// A password, fed to the channel out of band.
    Password(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Agent => f.write_str("Agent"),
            Credential::KeyFile(p) => f.debug_tuple("KeyFile").field(p).finish(),
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// The gateway's managed packet-filter namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallLayout {
    /// nftables table name, created in both the `ip` and `ip6` families.
    pub table: String,
    /// NAT prerouting chain inside the table.
    pub chain: String,
    /// Directory on the gateway where the managed tables are saved so the
    /// tunnel daemon can reload them when it comes back up.
    pub persist_dir: String,
}

impl Default for FirewallLayout {
    fn default() -> Self {
        Self {
            table: "bastion".into(),
            chain: "prerouting".into(),
            persist_dir: "/etc/bastion".into(),
        }
    }
}

impl FirewallLayout {
    /// Path of the saved table for `family` on the gateway.
    pub fn persist_path(&self, family: AddressFamily) -> String {
        format!("{}/{}.nft", self.persist_dir.trim_end_matches('/'), family)
    }

    /// Path of the uploaded restart script on the gateway.
    pub fn restart_script_path(&self) -> String {
        format!("{}/restart.sh", self.persist_dir.trim_end_matches('/'))
    }
}

/// The tunnel daemon on the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelLayout {
    /// WireGuard interface name.
    pub interface: String,
    /// systemd unit restarted to re-read the firewall state.
    pub unit: String,
    /// Where the detached restart writes its output.
    pub restart_log: String,
}

impl Default for TunnelLayout {
    fn default() -> Self {
        Self::for_interface("wg0")
    }
}

impl TunnelLayout {
    pub fn for_interface(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            unit: format!("wg-quick@{interface}"),
            restart_log: "/var/log/bastion-restart.log".into(),
        }
    }
}

/// Independent timeouts and the post-restart settle policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Establishing the command channel.
    pub connect: Duration,
    /// A single remote command.
    pub command: Duration,
    /// One reconnect attempt after a restart.
    pub verify_reconnect: Duration,
    /// Mandatory wait between issuing the restart and verifying.
    pub settle: Duration,
    /// Reconnect attempts before giving up on verification.
    pub verify_attempts: u32,
    /// First backoff between reconnect attempts, doubled each time.
    pub verify_backoff: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            command: Duration::from_secs(30),
            verify_reconnect: Duration::from_secs(15),
            settle: Duration::from_secs(30),
            verify_attempts: 5,
            verify_backoff: Duration::from_secs(2),
        }
    }
}

/// Stable identity of a gateway, used for locking and state file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GatewayId(String);

impl GatewayId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A filesystem-safe rendering of the identity.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Full description of a gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: Credential,
    /// Homelab tunnel address, always present.
    pub homelab_v4: Ipv4Addr,
    /// Homelab IPv6 tunnel address, if the tunnel carries IPv6.
    pub homelab_v6: Option<Ipv6Addr>,
    pub firewall: FirewallLayout,
    pub tunnel: TunnelLayout,
    pub timeouts: Timeouts,
}

impl GatewayConfig {
    /// A gateway reached as root on port 22 with default layouts.
    pub fn new(host: impl Into<String>, homelab_v4: Ipv4Addr) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: "root".into(),
            credential: Credential::Agent,
            homelab_v4,
            homelab_v6: None,
            firewall: FirewallLayout::default(),
            tunnel: TunnelLayout::default(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn id(&self) -> GatewayId {
        GatewayId(format!("{}@{}:{}", self.user, self.host, self.port))
    }

    /// `user@host`, as the command channel addresses it.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Address families a rule is applied for: IPv4 always, IPv6 when a v6
    /// tunnel address is configured.
    pub fn families(&self) -> Vec<AddressFamily> {
        let mut families = vec![AddressFamily::V4];
        if self.homelab_v6.is_some() {
            families.push(AddressFamily::V6);
        }
        families
    }

    /// Homelab target for a family.
    pub fn target(&self, family: AddressFamily) -> Option<IpAddr> {
        match family {
            AddressFamily::V4 => Some(IpAddr::V4(self.homelab_v4)),
            AddressFamily::V6 => self.homelab_v6.map(IpAddr::V6),
        }
    }

    /// One concrete rule per configured family.
    pub fn rules_for(&self, port: PortSpec, protocol: Protocol) -> Vec<PortRule> {
        self.families()
            .into_iter()
            .filter_map(|f| self.target(f))
            .map(|target| PortRule::new(port, protocol, target))
            .collect()
    }
}
