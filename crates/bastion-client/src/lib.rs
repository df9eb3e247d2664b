//! bastion-client: gateway-side plumbing for bastion.
//!
//! Provides [`SshChannel`], a [`CommandChannel`](bastion_core::CommandChannel)
//! over the system `ssh`/`scp` binaries with a shared ControlMaster socket,
//! and [`NftExecutor`], a [`RemoteExecutor`](bastion_core::RemoteExecutor)
//! that manages DNAT rules in a dedicated nftables table and restarts the
//! WireGuard unit detached from the channel.
//!
//! # Quick Start
//!
//! ```no_run
//! use bastion_client::{NftExecutor, SshChannel, SshConfig};
//! use bastion_core::{CancelToken, GatewayConfig, ReconciliationRequest, Reconciler, RuleStore};
//!
//! # async fn example() {
//! let gateway = GatewayConfig::new("vps.example.com", "10.0.0.2".parse().unwrap());
//! let channel = SshChannel::new(SshConfig::from_gateway(&gateway, "/tmp".as_ref()));
//! let executor = NftExecutor::new(channel, &gateway);
//! let mut reconciler = Reconciler::new(gateway, executor, RuleStore::in_memory());
//!
//! let outcome = reconciler
//!     .reconcile(ReconciliationRequest::add("8080-8085", "tcp"), &CancelToken::new())
//!     .await;
//! println!("{:?}", outcome.result);
//! # }
//! ```

pub mod nft;
pub mod ssh;

pub use nft::NftExecutor;
pub use ssh::{classify_ssh_failure, SshChannel, SshConfig};

// Re-export core error types for convenience.
pub use bastion_core::{ExecError, ExecResult};
