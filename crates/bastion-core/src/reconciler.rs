//! The reconciliation cycle.
//!
//! One request moves through
//! `Idle -> Validating -> Applying -> Restarting -> Verifying -> {Done, Failed}`:
//!
//! - Validating parses the request locally; a bad request never reaches the
//!   gateway.
//! - Applying records the change in the [`RuleStore`] and then applies it on
//!   the gateway per address family. Nothing is rolled back on failure; the
//!   outcome says which family got through.
//! - Restarting is skipped when no family changed the live state.
//! - After the restart the cycle waits a fixed settle period, reconnects
//!   (retrying connectivity failures with backoff) and re-reads the live rules
//!   to confirm every attempted family matches the request.
//!
//! Listing, drift and status queries bypass the cycle.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ExecError, ExecResult, ReconcileError, ValidationError};
use crate::executor::{LiveChange, RemoteExecutor, TunnelStatus};
use crate::gateway::GatewayConfig;
use crate::live::LiveRule;
use crate::lock::GatewayLocks;
use crate::rule::{Action, AddressFamily, PortRule, PortSpec, Protocol};
use crate::store::{RuleStore, StoreChange};

/// States of a reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileState {
    Idle,
    Validating,
    Applying,
    Restarting,
    Verifying,
    Done,
    Failed,
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Applying => "applying",
            Self::Restarting => "restarting",
            Self::Verifying => "verifying",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Cancellation flag shared between a caller and a running cycle.
///
/// Honoured only while the cycle is validating. Once the cycle starts
/// changing state it runs to `Done` or `Failed`, and the outcome records
/// that a cancellation was requested.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A requested change, as typed by the caller. Transient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationRequest {
    pub action: Action,
    pub port_spec: String,
    pub protocol: String,
}

impl ReconciliationRequest {
    pub fn add(port_spec: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            action: Action::Add,
            port_spec: port_spec.into(),
            protocol: protocol.into(),
        }
    }

    pub fn remove(port_spec: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            action: Action::Remove,
            port_spec: port_spec.into(),
            protocol: protocol.into(),
        }
    }

    /// Parse the request into typed parts without touching anything.
    pub fn validate(&self) -> Result<(PortSpec, Protocol), ValidationError> {
        let port = PortSpec::parse(&self.port_spec)?;
        let protocol = self.protocol.parse()?;
        Ok((port, protocol))
    }
}

/// What happened on the gateway for one address family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FamilyApply {
    NotAttempted,
    Changed,
    Unchanged,
    Failed { error: String },
}

impl From<LiveChange> for FamilyApply {
    fn from(change: LiveChange) -> Self {
        match change {
            LiveChange::Changed => FamilyApply::Changed,
            LiveChange::Unchanged => FamilyApply::Unchanged,
        }
    }
}

/// Per-family result of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FamilyReport {
    pub family: AddressFamily,
    pub target: IpAddr,
    pub apply: FamilyApply,
    /// `Some(true)` when post-restart verification matched the request.
    pub verified: Option<bool>,
}

/// How a successful cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// The gateway changed, the tunnel was restarted and verified.
    Applied,
    /// The gateway already matched the request; no restart was needed.
    NoChange,
}

/// Structured result of one cycle.
#[derive(Debug)]
pub struct ReconcileOutcome {
    pub gateway: String,
    pub action: Action,
    pub port: Option<PortSpec>,
    pub protocol: Option<Protocol>,
    pub store: Option<StoreChange>,
    pub families: Vec<FamilyReport>,
    pub restarted: bool,
    /// A cancellation arrived after the point of no return.
    pub cancel_deferred: bool,
    /// Every state the cycle passed through, starting at `Idle`.
    pub trace: Vec<ReconcileState>,
    pub result: Result<Completion, ReconcileError>,
}

impl ReconcileOutcome {
    fn begin(gateway: String, action: Action) -> Self {
        Self {
            gateway,
            action,
            port: None,
            protocol: None,
            store: None,
            families: Vec::new(),
            restarted: false,
            cancel_deferred: false,
            trace: vec![ReconcileState::Idle],
            result: Ok(Completion::NoChange),
        }
    }

    fn current(&self) -> ReconcileState {
        self.trace.last().copied().unwrap_or(ReconcileState::Idle)
    }

    fn enter(&mut self, next: ReconcileState) {
        info!(
            gateway = %self.gateway,
            action = %self.action,
            from = %self.current(),
            to = %next,
            "reconcile transition"
        );
        self.trace.push(next);
    }

    fn finish(mut self, cancel: &CancelToken, result: Result<Completion, ReconcileError>) -> Self {
        if cancel.is_cancelled() && self.current() != ReconcileState::Validating {
            self.cancel_deferred = true;
        }
        match &result {
            Ok(completion) => {
                self.enter(ReconcileState::Done);
                info!(gateway = %self.gateway, ?completion, "reconcile done");
            }
            Err(e) => {
                self.enter(ReconcileState::Failed);
                warn!(gateway = %self.gateway, phase = %e.phase(), error = %e, "reconcile failed");
            }
        }
        self.result = result;
        self
    }

    /// Final state: `Done` or `Failed`.
    pub fn state(&self) -> ReconcileState {
        if self.result.is_ok() {
            ReconcileState::Done
        } else {
            ReconcileState::Failed
        }
    }

    pub fn is_done(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&ReconcileError> {
        self.result.as_ref().err()
    }
}

/// Local record vs gateway, as found by [`Reconciler::drift`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    /// Recorded locally but not live on the gateway.
    pub missing_remote: Vec<PortRule>,
    /// Live and tagged as ours, but not recorded locally.
    pub untracked_remote: Vec<LiveRule>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.missing_remote.is_empty() && self.untracked_remote.is_empty()
    }
}

/// Drives reconciliation cycles for one gateway.
pub struct Reconciler<E> {
    config: GatewayConfig,
    executor: E,
    store: RuleStore,
    locks: GatewayLocks,
}

impl<E: RemoteExecutor> Reconciler<E> {
    pub fn new(config: GatewayConfig, executor: E, store: RuleStore) -> Self {
        Self {
            config,
            executor,
            store,
            locks: GatewayLocks::global(),
        }
    }

    /// Use a specific lock registry instead of the process-wide one.
    pub fn with_locks(mut self, locks: GatewayLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    /// Run one full cycle for `request`.
    ///
    /// Always returns an outcome; failures are carried in
    /// [`ReconcileOutcome::result`] together with how far the cycle got.
    pub async fn reconcile(
        &mut self,
        request: ReconciliationRequest,
        cancel: &CancelToken,
    ) -> ReconcileOutcome {
        let id = self.config.id();
        let _guard = self.locks.acquire(&id).await;
        let action = request.action;
        let mut out = ReconcileOutcome::begin(id.to_string(), action);

        // Validating
        out.enter(ReconcileState::Validating);
        let (port, protocol) = match request.validate() {
            Ok(parts) => parts,
            Err(e) => return out.finish(cancel, Err(e.into())),
        };
        out.port = Some(port);
        out.protocol = Some(protocol);
        let rules = self.config.rules_for(port, protocol);
        for rule in &rules {
            if let Err(e) = self.store.validate(rule) {
                return out.finish(cancel, Err(e.into()));
            }
        }
        if cancel.is_cancelled() {
            info!(gateway = %id, "cancelled while validating");
            return out.finish(cancel, Err(ReconcileError::Cancelled));
        }

        // Applying
        out.enter(ReconcileState::Applying);
        out.families = rules
            .iter()
            .map(|r| FamilyReport {
                family: r.family(),
                target: r.target,
                apply: FamilyApply::NotAttempted,
                verified: None,
            })
            .collect();

        let mut store_change = StoreChange::NoOp;
        for rule in &rules {
            let change = match action {
                Action::Add => self.store.add(rule),
                Action::Remove => self.store.remove(rule),
            };
            match change {
                Ok(StoreChange::Applied) => store_change = StoreChange::Applied,
                Ok(StoreChange::NoOp) => {}
                Err(e) => return out.finish(cancel, Err(e.into())),
            }
        }
        out.store = Some(store_change);
        debug!(gateway = %id, store = ?store_change, "local store updated");
        if store_change == StoreChange::Applied {
            if let Err(e) = self.store.save() {
                return out.finish(cancel, Err(e.into()));
            }
        }

        let mut applied = Vec::new();
        let mut live_changed = false;
        for (idx, rule) in rules.iter().enumerate() {
            let family = rule.family();
            match self.executor.apply_rule(rule, action).await {
                Ok(change) => {
                    debug!(gateway = %id, %family, ?change, "applied on gateway");
                    out.families[idx].apply = change.into();
                    live_changed |= change == LiveChange::Changed;
                    applied.push(family);
                }
                Err(source) => {
                    out.families[idx].apply = FamilyApply::Failed {
                        error: source.to_string(),
                    };
                    let err = if applied.is_empty() {
                        ReconcileError::Phase {
                            phase: ReconcileState::Applying,
                            family: Some(family),
                            source,
                        }
                    } else {
                        ReconcileError::PartialApplication {
                            applied,
                            failed: family,
                            source,
                        }
                    };
                    return out.finish(cancel, Err(err));
                }
            }
        }

        if !live_changed {
            info!(gateway = %id, "gateway already matches, skipping restart");
            return out.finish(cancel, Ok(Completion::NoChange));
        }

        // Restarting
        out.enter(ReconcileState::Restarting);
        if let Err(source) = self.executor.restart_tunnel().await {
            return out.finish(
                cancel,
                Err(ReconcileError::Phase {
                    phase: ReconcileState::Restarting,
                    family: None,
                    source,
                }),
            );
        }
        out.restarted = true;
        let settle = self.config.timeouts.settle;
        info!(gateway = %id, ?settle, "restart issued, waiting for tunnel to settle");
        tokio::time::sleep(settle).await;

        // Verifying
        out.enter(ReconcileState::Verifying);
        if let Err(e) = self.reconnect_after_restart().await {
            return out.finish(cancel, Err(e));
        }

        let mut mismatched = Vec::new();
        for (idx, rule) in rules.iter().enumerate() {
            let family = rule.family();
            let live = match self.executor.query_live_rules(family).await {
                Ok(live) => live,
                Err(source) => {
                    return out.finish(
                        cancel,
                        Err(ReconcileError::Phase {
                            phase: ReconcileState::Verifying,
                            family: Some(family),
                            source,
                        }),
                    )
                }
            };
            let matches = match action {
                Action::Add => live.iter().any(|l| l.rule == *rule),
                Action::Remove => !live.iter().any(|l| l.rule.key() == rule.key()),
            };
            out.families[idx].verified = Some(matches);
            if !matches {
                warn!(gateway = %id, %family, rule = %rule, "live state does not match request");
                mismatched.push(family);
            }
        }

        if mismatched.is_empty() {
            out.finish(cancel, Ok(Completion::Applied))
        } else {
            out.finish(
                cancel,
                Err(ReconcileError::VerificationMismatch {
                    action,
                    families: mismatched,
                }),
            )
        }
    }

    /// Reconnect after the tunnel restart, retrying only connectivity
    /// failures, with doubling backoff.
    async fn reconnect_after_restart(&mut self) -> Result<(), ReconcileError> {
        let timeouts = self.config.timeouts.clone();
        let attempts = timeouts.verify_attempts.max(1);
        let per_attempt = timeouts.verify_reconnect;
        let mut backoff = timeouts.verify_backoff;
        let mut last_error: Option<ExecError> = None;
        let mut only_timeouts = true;

        for attempt in 1..=attempts {
            match tokio::time::timeout(per_attempt, self.executor.reconnect()).await {
                Ok(Ok(())) => {
                    debug!(attempt, "reconnected after restart");
                    return Ok(());
                }
                Ok(Err(e)) if e.is_connectivity() => {
                    warn!(attempt, error = %e, "reconnect failed");
                    if !matches!(e, ExecError::ConnectTimeout { .. }) {
                        only_timeouts = false;
                    }
                    last_error = Some(e);
                }
                Ok(Err(source)) => {
                    return Err(ReconcileError::Phase {
                        phase: ReconcileState::Verifying,
                        family: None,
                        source,
                    })
                }
                Err(_) => warn!(attempt, ?per_attempt, "reconnect attempt timed out"),
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        match last_error {
            Some(source) if !only_timeouts => Err(ReconcileError::Phase {
                phase: ReconcileState::Verifying,
                family: None,
                source,
            }),
            _ => Err(ReconcileError::VerifyReconnectTimeout {
                attempts,
                after: per_attempt,
            }),
        }
    }

    /// Live managed rules for every configured family. No mutation, no restart.
    pub async fn list(&mut self) -> ExecResult<Vec<LiveRule>> {
        let mut rules = Vec::new();
        for family in self.config.families() {
            rules.extend(self.executor.query_live_rules(family).await?);
        }
        Ok(rules)
    }

    /// Compare the local store with the gateway's live rules.
    pub async fn drift(&mut self) -> ExecResult<DriftReport> {
        let live = self.list().await?;
        let recorded: Vec<PortRule> = self.store.list().collect();

        let missing_remote = recorded
            .iter()
            .filter(|r| !live.iter().any(|l| l.rule == **r))
            .cloned()
            .collect();
        let untracked_remote = live
            .into_iter()
            .filter(|l| !recorded.contains(&l.rule))
            .collect();

        Ok(DriftReport {
            missing_remote,
            untracked_remote,
        })
    }

    pub async fn status(&mut self) -> ExecResult<TunnelStatus> {
        self.executor.tunnel_status().await
    }
}
