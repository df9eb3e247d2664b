//! `bastion drift`: compare the local record with the gateway.

use anyhow::Result;
use bastion_core::Reconciler;

use super::{disconnect, Invocation};
use crate::output;

pub async fn run(inv: &Invocation) -> Result<()> {
    let gateway = inv.gateway()?;
    let store = inv.open_store(&gateway)?;
    let executor = inv.connect(&gateway).await?;

    let mut reconciler = Reconciler::new(gateway, executor, store);
    let report = reconciler.drift().await;
    disconnect(reconciler.executor_mut()).await;

    output::print_drift(&report?, inv.json)
}
