//! bastion-core: Shared library for the bastion port-forwarding tool.
//!
//! Provides the port-forward rule model, the local rule store, typed remote
//! commands for the packet filter and tunnel daemon, live-rule parsing,
//! the abstract command channel / remote executor traits, and the
//! reconciler that drives a validate → apply → restart → verify cycle.

pub mod channel;
pub mod command;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod live;
pub mod lock;
pub mod reconciler;
pub mod rule;
pub mod store;

// Re-export commonly used items at crate root.
pub use channel::{CommandChannel, CommandOutput};
pub use command::{shell_quote, CommandBuilder, CommandKind, RemoteCommand};
pub use error::{ExecError, ExecResult, ReconcileError, StoreError, ValidationError};
pub use executor::{LiveChange, RemoteExecutor, TunnelStatus};
pub use gateway::{Credential, FirewallLayout, GatewayConfig, GatewayId, Timeouts, TunnelLayout};
pub use live::{parse_live_rules, LiveRule};
pub use lock::GatewayLocks;
pub use reconciler::{
    CancelToken, Completion, DriftReport, FamilyApply, FamilyReport, ReconcileOutcome,
    ReconcileState, ReconciliationRequest, Reconciler,
};
pub use rule::{Action, AddressFamily, PortRule, PortSpec, Protocol, RuleKey};
pub use store::{RuleSnapshot, RuleStore, StoreChange};
