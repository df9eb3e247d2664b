//! Remote executor: the gateway-side half of a reconciliation.

use serde::Serialize;

use crate::error::ExecResult;
use crate::live::LiveRule;
use crate::rule::{Action, AddressFamily, PortRule};

/// Whether applying a rule changed the gateway's live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveChange {
    Changed,
    Unchanged,
}

/// Health of the tunnel daemon as seen from the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    pub unit: String,
    /// `systemctl is-active` verdict (`active`, `inactive`, `failed`, ...).
    pub state: String,
    /// Raw `wg show <if> latest-handshakes` output, empty if unavailable.
    pub handshakes: String,
}

impl TunnelStatus {
    pub fn is_active(&self) -> bool {
        self.state == "active"
    }
}

/// Mutating and read-only operations on one gateway.
///
/// `apply_rule` checks the live state before acting, so it is idempotent on
/// its own even when the local store has drifted from the gateway.
#[allow(async_fn_in_trait)]
pub trait RemoteExecutor {
    /// Install (`Add`) or delete (`Remove`) the live rule for `rule`'s family.
    async fn apply_rule(&mut self, rule: &PortRule, action: Action) -> ExecResult<LiveChange>;

    /// Restart the tunnel daemon detached from the command channel.
    async fn restart_tunnel(&mut self) -> ExecResult<()>;

    /// Managed rules currently live for `family`.
    async fn query_live_rules(&mut self, family: AddressFamily) -> ExecResult<Vec<LiveRule>>;

    /// Re-establish the command channel, dropping any stale one.
    async fn reconnect(&mut self) -> ExecResult<()>;

    async fn tunnel_status(&mut self) -> ExecResult<TunnelStatus>;
}
