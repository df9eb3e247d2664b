//! nftables-backed [`RemoteExecutor`].
//!
//! Managed rules live in a dedicated table (`ip bastion` / `ip6 bastion` by
//! default) with a single NAT prerouting chain. Every rule carries its
//! identity as a comment, so the live state can be read back exactly. After
//! each change the table is saved under the gateway's persist directory,
//! where the tunnel's `PostUp` reloads it on every restart.

use std::path::PathBuf;

use bastion_core::{
    parse_live_rules, Action, AddressFamily, CommandBuilder, CommandChannel, CommandOutput,
    ExecError, ExecResult, GatewayConfig, LiveChange, LiveRule, PortRule, RemoteCommand,
    RemoteExecutor, TunnelStatus,
};
use tracing::{debug, info, warn};

/// Drives one gateway's packet filter over a [`CommandChannel`].
pub struct NftExecutor<C> {
    channel: C,
    commands: CommandBuilder,
    restart_log: String,
    scratch_dir: PathBuf,
    stem: String,
}

impl<C: CommandChannel> NftExecutor<C> {
    pub fn new(channel: C, gateway: &GatewayConfig) -> Self {
        Self {
            channel,
            commands: CommandBuilder::new(gateway.firewall.clone(), gateway.tunnel.clone()),
            restart_log: gateway.tunnel.restart_log.clone(),
            scratch_dir: std::env::temp_dir(),
            stem: gateway.id().file_stem(),
        }
    }

    /// Local directory for files staged before upload.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Execute and require a zero exit status.
    async fn run(&mut self, command: &RemoteCommand) -> ExecResult<CommandOutput> {
        debug!(endpoint = %self.channel.endpoint(), kind = ?command.kind, "remote command");
        self.channel.execute(command).await?.check(command)
    }

    async fn list_once(&mut self, family: AddressFamily) -> ExecResult<Vec<LiveRule>> {
        let command = self.commands.list_rules(family);
        let output = self.channel.execute(&command).await?;
        // An absent table just means nothing was ever installed for this family.
        if !output.success() && output.stderr.contains("No such file or directory") {
            debug!(%family, "managed table absent");
            return Ok(Vec::new());
        }
        let output = output.check(&command)?;
        parse_live_rules(family, self.commands.firewall(), &output.stdout)
    }

    async fn persist(&mut self, family: AddressFamily) -> ExecResult<()> {
        let command = self.commands.persist_table(family);
        self.run(&command).await?;
        debug!(%family, path = %self.commands.firewall().persist_path(family), "table persisted");
        Ok(())
    }

    async fn delete(&mut self, live: &LiveRule) -> ExecResult<()> {
        info!(family = %live.family, rule = %live.rule, handle = live.handle, "deleting live rule");
        let command = self.commands.delete_rule(live.family, live.handle);
        self.run(&command).await?;
        Ok(())
    }
}

impl<C: CommandChannel> RemoteExecutor for NftExecutor<C> {
    async fn apply_rule(&mut self, rule: &PortRule, action: Action) -> ExecResult<LiveChange> {
        let family = rule.family();
        if action == Action::Add {
            let command = self.commands.ensure_table(family);
            self.run(&command).await?;
        }

        let live = self.query_live_rules(family).await?;
        let (exact, same_key): (Vec<LiveRule>, Vec<LiveRule>) = live
            .into_iter()
            .filter(|l| l.rule.key() == rule.key())
            .partition(|l| l.rule == *rule);

        match action {
            Action::Add => {
                if !exact.is_empty() {
                    debug!(%family, %rule, "rule already live");
                    return Ok(LiveChange::Unchanged);
                }
                // Same ports forwarded elsewhere: replace, never duplicate.
                for stale in &same_key {
                    self.delete(stale).await?;
                }
                info!(%family, %rule, "adding live rule");
                let command = self.commands.add_rule(rule);
                self.run(&command).await?;
            }
            Action::Remove => {
                if exact.is_empty() && same_key.is_empty() {
                    debug!(%family, %rule, "rule not live");
                    return Ok(LiveChange::Unchanged);
                }
                for live in exact.iter().chain(&same_key) {
                    self.delete(live).await?;
                }
            }
        }

        self.persist(family).await?;
        Ok(LiveChange::Changed)
    }

    async fn restart_tunnel(&mut self) -> ExecResult<()> {
        let local = self
            .scratch_dir
            .join(format!("bastion-restart-{}-{}.sh", self.stem, std::process::id()));
        tokio::fs::write(&local, self.commands.restart_script()).await?;

        let remote = self.commands.firewall().restart_script_path();
        let uploaded = self.channel.transfer(&local, &remote).await;
        if let Err(e) = tokio::fs::remove_file(&local).await {
            warn!(path = %local.display(), error = %e, "could not remove staged restart script");
        }
        uploaded?;

        let command = self.commands.run_restart_script();
        info!(
            endpoint = %self.channel.endpoint(),
            unit = %self.commands.tunnel().unit,
            log = %self.restart_log,
            "restarting tunnel"
        );
        self.channel.spawn_detached(&command, &self.restart_log).await
    }

    async fn query_live_rules(&mut self, family: AddressFamily) -> ExecResult<Vec<LiveRule>> {
        // Reads are safe to repeat; a failed listing gets one more try.
        match self.list_once(family).await {
            Err(e @ ExecError::RemoteCommand { .. }) => {
                warn!(%family, error = %e, "listing failed, retrying once");
                self.list_once(family).await
            }
            other => other,
        }
    }

    async fn reconnect(&mut self) -> ExecResult<()> {
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "closing stale channel failed");
        }
        self.channel.connect().await
    }

    async fn tunnel_status(&mut self) -> ExecResult<TunnelStatus> {
        let unit = self.commands.tunnel().unit.clone();

        // `systemctl is-active` exits non-zero for anything but active.
        let command = self.commands.daemon_status();
        let output = self.channel.execute(&command).await?;
        let state = match output.stdout.trim() {
            "" => "unknown".to_string(),
            s => s.to_string(),
        };

        let command = self.commands.tunnel_status();
        let output = self.channel.execute(&command).await?;
        let handshakes = if output.success() {
            output.stdout.trim().to_string()
        } else {
            String::new()
        };

        Ok(TunnelStatus {
            unit,
            state,
            handshakes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::live::parse_rule_tag;
    use bastion_core::{CommandKind, PortSpec, Protocol};
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::path::Path;

    /// In-memory gateway that interprets the typed commands it receives.
    #[derive(Default)]
    struct FakeGateway {
        tables: Vec<AddressFamily>,
        rules: Vec<LiveRule>,
        next_handle: u64,
        executed: Vec<CommandKind>,
        uploads: Vec<(String, String)>,
        detached: Vec<(String, String)>,
        /// Canned responses consumed before interpreting a command of that kind.
        canned: VecDeque<(CommandKind, ExecResult<CommandOutput>)>,
        closed: u32,
        connected: u32,
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    fn fail(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: code,
        }
    }

    impl FakeGateway {
        fn listing(&self, family: AddressFamily) -> String {
            let rules: Vec<String> = self
                .rules
                .iter()
                .filter(|l| l.family == family)
                .map(|l| {
                    format!(
                        r#"{{"rule": {{"family": "{}", "table": "bastion", "chain": "prerouting", "handle": {}, "comment": "{}"}}}}"#,
                        family.nft_family(),
                        l.handle,
                        bastion_core::live::rule_tag(&l.rule)
                    )
                })
                .collect();
            format!(r#"{{"nftables": [{}]}}"#, rules.join(","))
        }

        fn interpret(&mut self, command: &RemoteCommand) -> CommandOutput {
            let family = command.family;
            let argv = command.steps().last().cloned().unwrap_or_default();
            match command.kind {
                CommandKind::EnsureTable => {
                    let family = family.unwrap();
                    if !self.tables.contains(&family) {
                        self.tables.push(family);
                    }
                    ok("")
                }
                CommandKind::ListRules => {
                    let family = family.unwrap();
                    if self.tables.contains(&family) {
                        ok(&self.listing(family))
                    } else {
                        fail(1, "Error: No such file or directory\nlist chain ip bastion prerouting\n")
                    }
                }
                CommandKind::AddRule => {
                    let comment = argv.last().unwrap().trim_matches('"');
                    let rule = parse_rule_tag(comment).unwrap();
                    self.next_handle += 1;
                    self.rules.push(LiveRule {
                        family: family.unwrap(),
                        rule,
                        handle: self.next_handle,
                    });
                    ok("")
                }
                CommandKind::DeleteRule => {
                    let handle: u64 = argv.last().unwrap().parse().unwrap();
                    self.rules.retain(|l| l.handle != handle);
                    ok("")
                }
                CommandKind::PersistTable | CommandKind::Probe | CommandKind::RunScript => ok(""),
                CommandKind::DaemonStatus => CommandOutput {
                    stdout: "inactive\n".into(),
                    stderr: String::new(),
                    exit_code: 3,
                },
                CommandKind::TunnelStatus => ok("peerkey=\t1760860800\n"),
            }
        }
    }

    impl CommandChannel for FakeGateway {
        async fn connect(&mut self) -> ExecResult<()> {
            self.connected += 1;
            Ok(())
        }

        async fn close(&mut self) -> ExecResult<()> {
            self.closed += 1;
            Ok(())
        }

        async fn execute(&mut self, command: &RemoteCommand) -> ExecResult<CommandOutput> {
            self.executed.push(command.kind);
            if self.canned.front().map(|(k, _)| *k) == Some(command.kind) {
                let (_, response) = self.canned.pop_front().unwrap();
                return response;
            }
            Ok(self.interpret(command))
        }

        async fn transfer(&mut self, local_path: &Path, remote_path: &str) -> ExecResult<()> {
            let contents = std::fs::read_to_string(local_path)?;
            self.uploads.push((remote_path.to_string(), contents));
            Ok(())
        }

        async fn spawn_detached(
            &mut self,
            command: &RemoteCommand,
            log_path: &str,
        ) -> ExecResult<()> {
            self.detached.push((command.to_shell(), log_path.to_string()));
            Ok(())
        }

        fn endpoint(&self) -> &str {
            "root@fake:22"
        }
    }

    fn gateway() -> GatewayConfig {
        GatewayConfig::new("fake", Ipv4Addr::new(10, 0, 0, 2))
    }

    fn executor() -> NftExecutor<FakeGateway> {
        NftExecutor::new(FakeGateway::default(), &gateway())
    }

    fn rule(target: &str) -> PortRule {
        PortRule::new(
            PortSpec::Range { lo: 8080, hi: 8085 },
            Protocol::Tcp,
            target.parse().unwrap(),
        )
    }

    fn count(exec: &NftExecutor<FakeGateway>, kind: CommandKind) -> usize {
        exec.channel().executed.iter().filter(|k| **k == kind).count()
    }

    #[tokio::test]
    async fn add_installs_and_persists() {
        let mut exec = executor();
        let change = exec.apply_rule(&rule("10.0.0.2"), Action::Add).await.unwrap();
        assert_eq!(change, LiveChange::Changed);
        assert_eq!(
            exec.channel().executed,
            vec![
                CommandKind::EnsureTable,
                CommandKind::ListRules,
                CommandKind::AddRule,
                CommandKind::PersistTable,
            ]
        );
        let live = exec.query_live_rules(AddressFamily::V4).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].rule, rule("10.0.0.2"));
    }

    #[tokio::test]
    async fn add_of_live_rule_is_unchanged() {
        let mut exec = executor();
        exec.apply_rule(&rule("10.0.0.2"), Action::Add).await.unwrap();
        let change = exec.apply_rule(&rule("10.0.0.2"), Action::Add).await.unwrap();
        assert_eq!(change, LiveChange::Unchanged);
        assert_eq!(count(&exec, CommandKind::AddRule), 1);
        assert_eq!(count(&exec, CommandKind::PersistTable), 1);
    }

    #[tokio::test]
    async fn add_replaces_rule_pointing_elsewhere() {
        let mut exec = executor();
        exec.apply_rule(&rule("10.0.0.9"), Action::Add).await.unwrap();
        let change = exec.apply_rule(&rule("10.0.0.2"), Action::Add).await.unwrap();
        assert_eq!(change, LiveChange::Changed);
        assert_eq!(count(&exec, CommandKind::DeleteRule), 1);
        let live = exec.query_live_rules(AddressFamily::V4).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].rule.target, "10.0.0.2".parse::<std::net::IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn remove_absent_rule_with_no_table() {
        let mut exec = executor();
        let change = exec.apply_rule(&rule("10.0.0.2"), Action::Remove).await.unwrap();
        assert_eq!(change, LiveChange::Unchanged);
        assert_eq!(count(&exec, CommandKind::EnsureTable), 0);
        assert_eq!(count(&exec, CommandKind::PersistTable), 0);
    }

    #[tokio::test]
    async fn remove_deletes_by_handle() {
        let mut exec = executor();
        exec.apply_rule(&rule("10.0.0.2"), Action::Add).await.unwrap();
        let change = exec.apply_rule(&rule("10.0.0.2"), Action::Remove).await.unwrap();
        assert_eq!(change, LiveChange::Changed);
        assert!(exec.channel().rules.is_empty());
        assert_eq!(count(&exec, CommandKind::PersistTable), 2);
    }

    #[tokio::test]
    async fn failed_add_is_reported_not_retried() {
        let mut exec = executor();
        exec.channel_mut()
            .canned
            .push_back((CommandKind::AddRule, Ok(fail(1, "Error: Could not process rule"))));
        let err = exec.apply_rule(&rule("10.0.0.2"), Action::Add).await.unwrap_err();
        assert!(matches!(err, ExecError::RemoteCommand { exit_code: 1, .. }));
        assert_eq!(count(&exec, CommandKind::AddRule), 1);
        assert_eq!(count(&exec, CommandKind::PersistTable), 0);
    }

    #[tokio::test]
    async fn listing_is_retried_once() {
        let mut exec = executor();
        exec.channel_mut().tables.push(AddressFamily::V4);
        exec.channel_mut()
            .canned
            .push_back((CommandKind::ListRules, Ok(fail(1, "Error: busy"))));
        let live = exec.query_live_rules(AddressFamily::V4).await.unwrap();
        assert!(live.is_empty());
        assert_eq!(count(&exec, CommandKind::ListRules), 2);
    }

    #[tokio::test]
    async fn connectivity_errors_are_not_retried() {
        let mut exec = executor();
        exec.channel_mut().canned.push_back((
            CommandKind::ListRules,
            Err(ExecError::Connect {
                endpoint: "root@fake:22".into(),
                reason: "Connection refused".into(),
            }),
        ));
        let err = exec.query_live_rules(AddressFamily::V4).await.unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(count(&exec, CommandKind::ListRules), 1);
    }

    #[tokio::test]
    async fn garbage_listing_is_a_parse_error() {
        let mut exec = executor();
        exec.channel_mut()
            .canned
            .push_back((CommandKind::ListRules, Ok(ok("not json"))));
        let err = exec.query_live_rules(AddressFamily::V4).await.unwrap_err();
        assert!(matches!(err, ExecError::Parse(_)));
    }

    #[tokio::test]
    async fn restart_uploads_script_and_detaches() {
        let dir = std::env::temp_dir();
        let mut exec = executor().with_scratch_dir(dir.clone());
        exec.restart_tunnel().await.unwrap();

        let gw = exec.channel();
        assert_eq!(gw.uploads.len(), 1);
        assert_eq!(gw.uploads[0].0, "/etc/bastion/restart.sh");
        assert!(gw.uploads[0].1.contains("systemctl restart wg-quick@wg0"));
        assert_eq!(
            gw.detached,
            vec![(
                "sh /etc/bastion/restart.sh".to_string(),
                "/var/log/bastion-restart.log".to_string()
            )]
        );
        let staged = dir.join(format!("bastion-restart-root_fake_22-{}.sh", std::process::id()));
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn reconnect_closes_then_connects() {
        let mut exec = executor();
        exec.reconnect().await.unwrap();
        assert_eq!(exec.channel().closed, 1);
        assert_eq!(exec.channel().connected, 1);
    }

    #[tokio::test]
    async fn inactive_unit_is_a_status_not_an_error() {
        let mut exec = executor();
        let status = exec.tunnel_status().await.unwrap();
        assert_eq!(status.unit, "wg-quick@wg0");
        assert_eq!(status.state, "inactive");
        assert!(!status.is_active());
        assert!(status.handshakes.contains("1760860800"));
    }
}
