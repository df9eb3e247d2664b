//! Rendering of command results, as text or as JSON on stdout.

use anyhow::{Context, Result};
use bastion_core::{
    Action, Completion, DriftReport, FamilyApply, FamilyReport, LiveRule, PortRule, PortSpec,
    Protocol, ReconcileOutcome, ReconcileState, StoreChange, TunnelStatus,
};
use serde::Serialize;

/// Machine-readable summary of one reconciliation.
#[derive(Debug, Serialize)]
pub struct OutcomeReport<'a> {
    /// `applied`, `noop` or `failed`.
    pub status: &'static str,
    /// State the cycle failed in, if it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<ReconcileState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreChange>,
    pub families: &'a [FamilyReport],
    pub restarted: bool,
    pub cancel_deferred: bool,
    pub trace: &'a [ReconcileState],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl<'a> OutcomeReport<'a> {
    pub fn from_outcome(outcome: &'a ReconcileOutcome) -> Self {
        let (status, phase, reason) = match &outcome.result {
            Ok(Completion::Applied) => ("applied", None, None),
            Ok(Completion::NoChange) => ("noop", None, None),
            Err(e) => ("failed", Some(e.phase()), Some(e.to_string())),
        };
        Self {
            status,
            phase,
            gateway: Some(&outcome.gateway),
            action: Some(outcome.action),
            port: outcome.port,
            protocol: outcome.protocol,
            store: outcome.store,
            families: &outcome.families,
            restarted: outcome.restarted,
            cancel_deferred: outcome.cancel_deferred,
            trace: &outcome.trace,
            reason,
        }
    }

    /// A failure that happened before a cycle could start.
    pub fn rejected(action: Action, phase: ReconcileState, reason: String) -> Self {
        Self {
            status: "failed",
            phase: Some(phase),
            gateway: None,
            action: Some(action),
            port: None,
            protocol: None,
            store: None,
            families: &[],
            restarted: false,
            cancel_deferred: false,
            trace: &[],
            reason: Some(reason),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{text}");
    Ok(())
}

fn apply_label(apply: &FamilyApply) -> String {
    match apply {
        FamilyApply::NotAttempted => "not attempted".to_string(),
        FamilyApply::Changed => "changed".to_string(),
        FamilyApply::Unchanged => "unchanged".to_string(),
        FamilyApply::Failed { error } => format!("failed: {error}"),
    }
}

/// Human-readable lines for an outcome.
pub fn render_outcome(outcome: &ReconcileOutcome) -> Vec<String> {
    let mut lines = Vec::new();
    let what = match (outcome.port, outcome.protocol) {
        (Some(port), Some(protocol)) => format!("{port}/{protocol}"),
        _ => "request".to_string(),
    };
    let verb = match outcome.action {
        Action::Add => "forward",
        Action::Remove => "remove",
    };
    let headline = match &outcome.result {
        Ok(Completion::Applied) => format!("{verb} {what} on {}: applied", outcome.gateway),
        Ok(Completion::NoChange) => {
            format!("{verb} {what} on {}: already in place, tunnel not restarted", outcome.gateway)
        }
        Err(e) => format!("{verb} {what} on {}: failed while {}", outcome.gateway, e.phase()),
    };
    lines.push(headline);

    for report in &outcome.families {
        let verified = match report.verified {
            Some(true) => ", verified",
            Some(false) => ", NOT verified",
            None => "",
        };
        lines.push(format!(
            "  {:<5} -> {:<24} {}{verified}",
            report.family.to_string(),
            report.target.to_string(),
            apply_label(&report.apply)
        ));
    }
    if outcome.restarted {
        lines.push("  tunnel restarted".to_string());
    }
    if outcome.cancel_deferred {
        lines.push("  cancellation ignored: changes were already in progress".to_string());
    }
    lines
}

pub fn print_outcome(outcome: &ReconcileOutcome, json: bool) -> Result<()> {
    if json {
        return print_json(&OutcomeReport::from_outcome(outcome));
    }
    for line in render_outcome(outcome) {
        println!("{line}");
    }
    Ok(())
}

pub fn print_rejected(action: Action, phase: ReconcileState, reason: &str, json: bool) -> Result<()> {
    if json {
        print_json(&OutcomeReport::rejected(action, phase, reason.to_string()))?;
    }
    Ok(())
}

pub fn print_live_rules(rules: &[LiveRule], json: bool) -> Result<()> {
    if json {
        return print_json(&rules);
    }
    if rules.is_empty() {
        println!("No managed rules on the gateway.");
        return Ok(());
    }
    println!("{:<6} {:<14} {:<6} {:<24} {}", "FAMILY", "PORTS", "PROTO", "TARGET", "HANDLE");
    for live in rules {
        println!(
            "{:<6} {:<14} {:<6} {:<24} {}",
            live.family.to_string(),
            live.rule.port.to_string(),
            live.rule.protocol.to_string(),
            live.rule.target.to_string(),
            live.handle
        );
    }
    Ok(())
}

pub fn print_local_rules(rules: &[PortRule], json: bool) -> Result<()> {
    if json {
        return print_json(&rules);
    }
    if rules.is_empty() {
        println!("No rules recorded locally.");
        return Ok(());
    }
    println!("{:<14} {:<6} {}", "PORTS", "PROTO", "TARGET");
    for rule in rules {
        println!(
            "{:<14} {:<6} {}",
            rule.port.to_string(),
            rule.protocol.to_string(),
            rule.target
        );
    }
    Ok(())
}

pub fn print_drift(report: &DriftReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    if report.is_clean() {
        println!("No drift: the gateway matches the local record.");
        return Ok(());
    }
    for rule in &report.missing_remote {
        println!("missing on gateway: {rule}");
    }
    for live in &report.untracked_remote {
        println!("not recorded locally: {} (handle {})", live.rule, live.handle);
    }
    Ok(())
}

pub fn print_status(status: &TunnelStatus, json: bool) -> Result<()> {
    if json {
        return print_json(status);
    }
    println!("{}: {}", status.unit, status.state);
    if status.handshakes.is_empty() {
        println!("  no handshake information");
    } else {
        for line in status.handshakes.lines() {
            println!("  {line}");
        }
    }
    Ok(())
}
