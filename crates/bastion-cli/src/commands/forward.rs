//! `bastion add` / `bastion remove`: run one reconciliation cycle.
//!
//! The request is validated locally before anything else happens. Then the
//! gateway lock is taken, the ssh channel opened, and the cycle driven to
//! completion. Ctrl-C is caught from the moment the lock is taken, but it
//! cancels only while the request is still being validated; after that the
//! cycle finishes and the outcome notes it.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use bastion_core::{CancelToken, ReconcileState, ReconciliationRequest, Reconciler};
use dialoguer::Confirm;
use tracing::{debug, info, warn};

use super::{disconnect, Invocation};
use crate::output;

pub async fn run(inv: &Invocation, request: ReconciliationRequest) -> Result<()> {
    let action = request.action;
    if let Err(e) = request.validate() {
        output::print_rejected(action, ReconcileState::Validating, &e.to_string(), inv.json)?;
        return Err(e.into());
    }

    let gateway = inv.gateway()?;
    info!(gateway = %gateway.id(), %action, port = %request.port_spec, protocol = %request.protocol, "forward");

    if !inv.yes && std::io::stdin().is_terminal() {
        let prompt = format!(
            "{action} {}/{} on {}? The tunnel restarts if the gateway changes",
            request.port_spec,
            request.protocol,
            gateway.host
        );
        let accept = Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("failed to read user input")?;
        if !accept {
            anyhow::bail!("aborted by user");
        }
    }

    // Listen before taking the lock; SIGINT must never skip LockFile's Drop.
    let cancel = CancelToken::new();
    let on_interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; only honoured before changes start");
                cancel.cancel();
            }
        })
    };

    let lock = inv.lock(&gateway)?;
    debug!(lock = %lock.path().display(), "gateway locked");
    let store = inv.open_store(&gateway)?;
    let executor = match inv.connect(&gateway).await {
        Ok(executor) => executor,
        Err(e) => {
            on_interrupt.abort();
            output::print_rejected(action, ReconcileState::Applying, &format!("{e:#}"), inv.json)?;
            return Err(e);
        }
    };

    let mut reconciler = Reconciler::new(gateway, executor, store);
    let outcome = reconciler.reconcile(request, &cancel).await;
    on_interrupt.abort();
    disconnect(reconciler.executor_mut()).await;

    output::print_outcome(&outcome, inv.json)?;
    match outcome.result {
        Ok(_) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
