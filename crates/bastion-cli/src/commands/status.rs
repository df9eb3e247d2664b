//! `bastion status`: tunnel daemon state and last handshakes.

use anyhow::Result;
use bastion_core::{Reconciler, RuleStore};

use super::{disconnect, Invocation};
use crate::output;

pub async fn run(inv: &Invocation) -> Result<()> {
    let gateway = inv.gateway()?;
    let executor = inv.connect(&gateway).await?;

    let mut reconciler = Reconciler::new(gateway, executor, RuleStore::in_memory());
    let status = reconciler.status().await;
    disconnect(reconciler.executor_mut()).await;

    output::print_status(&status?, inv.json)
}
