//! `bastion list`: show managed forwards.
//!
//! Reads the live rules from the gateway by default, or the local rule store
//! with `--local`. Never changes anything.

use anyhow::Result;
use bastion_core::{PortRule, Reconciler, RuleStore};

use super::{disconnect, Invocation};
use crate::output;

pub async fn run(inv: &Invocation, local: bool) -> Result<()> {
    let gateway = inv.gateway()?;

    if local {
        let store = inv.open_store(&gateway)?;
        let rules: Vec<PortRule> = store.list().collect();
        return output::print_local_rules(&rules, inv.json);
    }

    let executor = inv.connect(&gateway).await?;
    let mut reconciler = Reconciler::new(gateway, executor, RuleStore::in_memory());
    let live = reconciler.list().await;
    disconnect(reconciler.executor_mut()).await;

    output::print_live_rules(&live?, inv.json)
}
