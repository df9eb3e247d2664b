//! Live rules as reported by the gateway's packet filter.
//!
//! The gateway is queried with `nft -j list chain ...`. Only rule objects in
//! the managed table/chain whose comment starts with `bastion:` belong to us;
//! everything else is ignored. The comment tag has an exact grammar:
//!
//! ```text
//! bastion:<portspec>/<tcp|udp>-><address>
//! ```
//!
//! A tagged comment that does not follow the grammar is an error, never
//! skipped, so verification cannot pass on a rule it failed to understand.

use std::net::IpAddr;

use serde::Serialize;
use serde_json::Value;

use crate::error::{ExecError, ExecResult};
use crate::gateway::FirewallLayout;
use crate::rule::{AddressFamily, PortRule, PortSpec, Protocol};

const TAG_PREFIX: &str = "bastion:";

/// A managed rule currently installed on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveRule {
    pub family: AddressFamily,
    pub rule: PortRule,
    /// nftables handle, needed to delete the rule.
    pub handle: u64,
}

/// The identity comment attached to a rule on the gateway.
pub fn rule_tag(rule: &PortRule) -> String {
    format!("{TAG_PREFIX}{}/{}->{}", rule.port, rule.protocol, rule.target)
}

/// Parse a `bastion:` comment back into a rule.
pub fn parse_rule_tag(tag: &str) -> Result<PortRule, String> {
    let body = tag
        .strip_prefix(TAG_PREFIX)
        .ok_or_else(|| format!("missing '{TAG_PREFIX}' prefix"))?;
    let (spec, target) = body
        .split_once("->")
        .ok_or_else(|| format!("missing '->' in tag '{tag}'"))?;
    let (port, protocol) = spec
        .split_once('/')
        .ok_or_else(|| format!("missing '/' in tag '{tag}'"))?;

    // Only the canonical lowercase rendering is accepted.
    let protocol = match protocol {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        other => return Err(format!("unknown protocol '{other}' in tag '{tag}'")),
    };
    let port: PortSpec = port
        .parse()
        .map_err(|_| format!("bad port spec '{port}' in tag '{tag}'"))?;
    let target: IpAddr = target
        .parse()
        .map_err(|_| format!("bad address '{target}' in tag '{tag}'"))?;

    Ok(PortRule::new(port, protocol, target))
}

/// Decode the managed rules of one family from `nft -j` output.
pub fn parse_live_rules(
    family: AddressFamily,
    layout: &FirewallLayout,
    json: &str,
) -> ExecResult<Vec<LiveRule>> {
    let doc: Value = serde_json::from_str(json)
        .map_err(|e| ExecError::Parse(format!("nft output is not JSON: {e}")))?;
    let items = doc
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or_else(|| ExecError::Parse("missing top-level 'nftables' array".into()))?;

    let mut rules = Vec::new();
    for item in items {
        let Some(rule) = item.get("rule") else {
            continue;
        };
        if rule.get("family").and_then(Value::as_str) != Some(family.nft_family())
            || rule.get("table").and_then(Value::as_str) != Some(layout.table.as_str())
            || rule.get("chain").and_then(Value::as_str) != Some(layout.chain.as_str())
        {
            continue;
        }
        let Some(comment) = rule.get("comment").and_then(Value::as_str) else {
            continue;
        };
        if !comment.starts_with(TAG_PREFIX) {
            continue;
        }

        let parsed = parse_rule_tag(comment).map_err(ExecError::Parse)?;
        if parsed.family() != family {
            return Err(ExecError::Parse(format!(
                "tag '{comment}' targets {} but sits in the {family} table",
                parsed.family()
            )));
        }
        let handle = rule
            .get("handle")
            .and_then(Value::as_u64)
            .ok_or_else(|| ExecError::Parse(format!("rule '{comment}' has no handle")))?;

        rules.push(LiveRule {
            family,
            rule: parsed,
            handle,
        });
    }
    Ok(rules)
}
