//! `bastion init-config`: write a config file with every default spelled out.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;

pub fn run(path: &str, host: Option<&str>, force: bool) -> Result<()> {
    if Path::new(path).exists() && !force {
        anyhow::bail!("{path} already exists; pass --force to overwrite");
    }

    let mut config = Config::default();
    if let Some(host) = host {
        config.gateway.host = host.to_string();
    }
    config.save(path)?;

    println!("Wrote {path}");
    if config.gateway.host.is_empty() {
        println!("Set [gateway].host before running other commands.");
    }
    Ok(())
}
