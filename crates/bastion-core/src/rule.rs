//! Port-forward rule model.
//!
//! A rule forwards inbound traffic on the gateway for one port (or an
//! inclusive port range) and protocol to a homelab tunnel address. The only
//! direction modelled is inbound-to-gateway, forward-to-target (DNAT).

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A single port or an inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PortSpec {
    Single(u16),
    Range { lo: u16, hi: u16 },
}

impl PortSpec {
    /// Build a range, collapsing equal bounds to a single port so both
    /// spellings share one identity.
    pub fn range(lo: u16, hi: u16) -> Self {
        if lo == hi {
            PortSpec::Single(lo)
        } else {
            PortSpec::Range { lo, hi }
        }
    }

    /// Check that the spec lies within 1-65535 and that a range has `lo < hi`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let ok = match *self {
            PortSpec::Single(p) => p != 0,
            PortSpec::Range { lo, hi } => lo != 0 && lo < hi,
        };
        if ok {
            Ok(())
        } else {
            Err(ValidationError::InvalidPortSpec(self.to_string()))
        }
    }

    /// Parse `"8080"` or `"8080-8085"`. `"80-80"` parses as `80`.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidPortSpec(s.to_string());
        let s_trim = s.trim();
        let spec = match s_trim.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_port(lo).ok_or_else(invalid)?;
                let hi = parse_port(hi).ok_or_else(invalid)?;
                PortSpec::range(lo, hi)
            }
            None => PortSpec::Single(parse_port(s_trim).ok_or_else(invalid)?),
        };
        spec.validate().map_err(|_| invalid())?;
        Ok(spec)
    }

    /// Whether `port` falls inside this spec.
    pub fn contains(&self, port: u16) -> bool {
        match *self {
            PortSpec::Single(p) => p == port,
            PortSpec::Range { lo, hi } => (lo..=hi).contains(&port),
        }
    }
}

/// Strict decimal port: digits only, no sign, fits in u16.
fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(p) => write!(f, "{p}"),
            PortSpec::Range { lo, hi } => write!(f, "{lo}-{hi}"),
        }
    }
}

impl FromStr for PortSpec {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PortSpec::parse(s)
    }
}

impl TryFrom<String> for PortSpec {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        PortSpec::parse(&s)
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        spec.to_string()
    }
}

/// Transport protocol of a forwarded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(ValidationError::InvalidProtocol(s.to_string())),
        }
    }
}

/// IP address family of a rule's target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressFamily {
    #[serde(rename = "ipv4")]
    V4,
    #[serde(rename = "ipv6")]
    V6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// The nftables family keyword for this address family.
    pub fn nft_family(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "ip",
            AddressFamily::V6 => "ip6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("ipv4"),
            AddressFamily::V6 => f.write_str("ipv6"),
        }
    }
}

/// Requested mutation of the rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Remove,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Add => f.write_str("add"),
            Action::Remove => f.write_str("remove"),
        }
    }
}

/// Identity of a rule. Two rules with the same key are the same rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub port: PortSpec,
    pub protocol: Protocol,
    pub family: AddressFamily,
}

/// A forwarded port on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRule {
    pub port: PortSpec,
    pub protocol: Protocol,
    pub target: IpAddr,
}

impl PortRule {
    pub fn new(port: PortSpec, protocol: Protocol, target: IpAddr) -> Self {
        Self {
            port,
            protocol,
            target,
        }
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.target)
    }

    pub fn key(&self) -> RuleKey {
        RuleKey {
            port: self.port,
            protocol: self.protocol,
            family: self.family(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.port.validate()
    }
}

impl fmt::Display for PortRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} -> {}", self.port, self.protocol, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_and_range() {
        assert_eq!(PortSpec::parse("22").unwrap(), PortSpec::Single(22));
        assert_eq!(
            PortSpec::parse("8080-8085").unwrap(),
            PortSpec::Range { lo: 8080, hi: 8085 }
        );
        assert_eq!(PortSpec::parse("443-443").unwrap(), PortSpec::Single(443));
    }

    #[test]
    fn port_bounds() {
        for p in [1u16, 80, 1024, 65535] {
            assert!(PortSpec::Single(p).validate().is_ok());
            assert!(PortSpec::parse(&p.to_string()).is_ok());
        }
        assert!(PortSpec::Range { lo: 1, hi: 65535 }.validate().is_ok());

        for bad in ["0", "65536", "70000", "", "-", "80-", "-80", "+80", "8o", "9000-8000", "0-10"] {
            assert!(
                matches!(PortSpec::parse(bad), Err(ValidationError::InvalidPortSpec(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(PortSpec::Single(0).validate().is_err());
        assert!(PortSpec::Range { lo: 10, hi: 9 }.validate().is_err());
    }

    #[test]
    fn degenerate_range_shares_single_port_identity() {
        assert_eq!(PortSpec::range(80, 80), PortSpec::Single(80));
        assert_eq!(PortSpec::range(80, 90), PortSpec::Range { lo: 80, hi: 90 });
        assert!(matches!(
            PortSpec::Range { lo: 80, hi: 80 }.validate(),
            Err(ValidationError::InvalidPortSpec(_))
        ));

        let target = "10.0.0.2".parse().unwrap();
        let single = PortRule::new(PortSpec::Single(80), Protocol::Tcp, target);
        let ranged = PortRule::new(PortSpec::range(80, 80), Protocol::Tcp, target);
        assert_eq!(single.key(), ranged.key());
    }

    #[test]
    fn protocol_parse() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!(
            "icmp".parse::<Protocol>(),
            Err(ValidationError::InvalidProtocol("icmp".into()))
        );
    }

    #[test]
    fn key_ignores_target_address_but_not_family() {
        let a = PortRule::new(PortSpec::Single(80), Protocol::Tcp, "10.0.0.2".parse().unwrap());
        let b = PortRule::new(PortSpec::Single(80), Protocol::Tcp, "10.0.0.3".parse().unwrap());
        let c = PortRule::new(PortSpec::Single(80), Protocol::Tcp, "fd00::2".parse().unwrap());
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn port_spec_serializes_as_string() {
        let rule = PortRule::new(
            PortSpec::Range { lo: 8080, hi: 8085 },
            Protocol::Tcp,
            "10.0.0.2".parse().unwrap(),
        );
        let json = serde_json::to_string(&rule).unwrap();
        assert_eq!(json, r#"{"port":"8080-8085","protocol":"tcp","target":"10.0.0.2"}"#);
        let bad: Result<PortRule, _> =
            serde_json::from_str(r#"{"port":"9-1","protocol":"tcp","target":"10.0.0.2"}"#);
        assert!(bad.is_err());
    }
}
