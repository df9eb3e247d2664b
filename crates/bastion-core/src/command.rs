//! Typed remote commands for the gateway's packet filter and tunnel daemon.
//!
//! Every operation is built from an argv per step; arguments are shell-quoted
//! only when the command is rendered for the channel, so no operation is
//! assembled by splicing strings into a shell line.

use std::fmt;

use crate::gateway::{FirewallLayout, TunnelLayout};
use crate::live::rule_tag;
use crate::rule::{AddressFamily, PortRule};

/// Shell-quote a string for safe embedding in a remote `sh -c` line.
///
/// Wraps in single quotes and replaces internal `'` with `'\''`.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"@%+=:,./-_".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// What a remote command does. Used for logging and by test doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Probe,
    EnsureTable,
    ListRules,
    AddRule,
    DeleteRule,
    PersistTable,
    RunScript,
    DaemonStatus,
    TunnelStatus,
}

/// A fully-typed remote operation: one or more argv steps joined with `&&`,
/// optionally redirecting the last step's stdout to a remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub kind: CommandKind,
    pub family: Option<AddressFamily>,
    steps: Vec<Vec<String>>,
    stdout_to: Option<String>,
}

impl RemoteCommand {
    fn new(kind: CommandKind, family: Option<AddressFamily>, steps: Vec<Vec<String>>) -> Self {
        Self {
            kind,
            family,
            steps,
            stdout_to: None,
        }
    }

    fn redirect(mut self, path: String) -> Self {
        self.stdout_to = Some(path);
        self
    }

    /// The argv of each step.
    pub fn steps(&self) -> &[Vec<String>] {
        &self.steps
    }

    /// Whether running the command leaves the gateway unchanged.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::Probe
                | CommandKind::ListRules
                | CommandKind::DaemonStatus
                | CommandKind::TunnelStatus
        )
    }

    /// Render as a single POSIX shell line.
    pub fn to_shell(&self) -> String {
        let mut line = self
            .steps
            .iter()
            .map(|argv| argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join(" && ");
        if let Some(path) = &self.stdout_to {
            line.push_str(" > ");
            line.push_str(&shell_quote(path));
        }
        line
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Builds the remote commands for one gateway's layout.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    firewall: FirewallLayout,
    tunnel: TunnelLayout,
}

impl CommandBuilder {
    pub fn new(firewall: FirewallLayout, tunnel: TunnelLayout) -> Self {
        Self { firewall, tunnel }
    }

    pub fn firewall(&self) -> &FirewallLayout {
        &self.firewall
    }

    pub fn tunnel(&self) -> &TunnelLayout {
        &self.tunnel
    }

    /// A no-op used to check the channel is usable.
    pub fn probe(&self) -> RemoteCommand {
        RemoteCommand::new(CommandKind::Probe, None, vec![argv(["true"])])
    }

    /// Create the managed table and its NAT prerouting chain. Idempotent.
    pub fn ensure_table(&self, family: AddressFamily) -> RemoteCommand {
        let fw = &self.firewall;
        let fam = family.nft_family();
        RemoteCommand::new(
            CommandKind::EnsureTable,
            Some(family),
            vec![
                argv(["nft", "add", "table", fam, fw.table.as_str()]),
                argv([
                    "nft",
                    "add",
                    "chain",
                    fam,
                    fw.table.as_str(),
                    fw.chain.as_str(),
                    "{ type nat hook prerouting priority dstnat; policy accept; }",
                ]),
            ],
        )
    }

    /// List the managed chain as nftables JSON.
    pub fn list_rules(&self, family: AddressFamily) -> RemoteCommand {
        let fw = &self.firewall;
        RemoteCommand::new(
            CommandKind::ListRules,
            Some(family),
            vec![argv([
                "nft",
                "-j",
                "list",
                "chain",
                family.nft_family(),
                fw.table.as_str(),
                fw.chain.as_str(),
            ])],
        )
    }

    /// Append a DNAT rule tagged with its identity comment.
    pub fn add_rule(&self, rule: &PortRule) -> RemoteCommand {
        let fw = &self.firewall;
        let family = rule.family();
        let port = rule.port.to_string();
        let target = rule.target.to_string();
        let comment = format!("\"{}\"", rule_tag(rule));
        RemoteCommand::new(
            CommandKind::AddRule,
            Some(family),
            vec![argv([
                "nft",
                "add",
                "rule",
                family.nft_family(),
                fw.table.as_str(),
                fw.chain.as_str(),
                rule.protocol.as_str(),
                "dport",
                port.as_str(),
                "dnat",
                "to",
                target.as_str(),
                "comment",
                comment.as_str(),
            ])],
        )
    }

    /// Delete a rule by its nftables handle.
    pub fn delete_rule(&self, family: AddressFamily, handle: u64) -> RemoteCommand {
        let fw = &self.firewall;
        let handle = handle.to_string();
        RemoteCommand::new(
            CommandKind::DeleteRule,
            Some(family),
            vec![argv([
                "nft",
                "delete",
                "rule",
                family.nft_family(),
                fw.table.as_str(),
                fw.chain.as_str(),
                "handle",
                handle.as_str(),
            ])],
        )
    }

    /// Save the managed table where the tunnel daemon reloads it on start.
    pub fn persist_table(&self, family: AddressFamily) -> RemoteCommand {
        let fw = &self.firewall;
        RemoteCommand::new(
            CommandKind::PersistTable,
            Some(family),
            vec![
                argv(["mkdir", "-p", fw.persist_dir.as_str()]),
                argv(["nft", "list", "table", family.nft_family(), fw.table.as_str()]),
            ],
        )
        .redirect(fw.persist_path(family))
    }

    /// Contents of the restart script uploaded before a detached restart.
    pub fn restart_script(&self) -> String {
        format!(
            "#!/bin/sh\n# written by bastion; restarts the tunnel after a rule change\nsleep 1\nsystemctl restart {}\n",
            shell_quote(&self.tunnel.unit)
        )
    }

    /// Run the uploaded restart script.
    pub fn run_restart_script(&self) -> RemoteCommand {
        let script = self.firewall.restart_script_path();
        RemoteCommand::new(
            CommandKind::RunScript,
            None,
            vec![argv(["sh", script.as_str()])],
        )
    }

    pub fn daemon_status(&self) -> RemoteCommand {
        RemoteCommand::new(
            CommandKind::DaemonStatus,
            None,
            vec![argv(["systemctl", "is-active", self.tunnel.unit.as_str()])],
        )
    }

    pub fn tunnel_status(&self) -> RemoteCommand {
        RemoteCommand::new(
            CommandKind::TunnelStatus,
            None,
            vec![argv(["wg", "show", self.tunnel.interface.as_str(), "latest-handshakes"])],
        )
    }
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new(FirewallLayout::default(), TunnelLayout::default())
    }
}
