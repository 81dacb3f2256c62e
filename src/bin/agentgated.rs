//! agentgated - interception daemon
//!
//! This daemon:
//! 1. Probes the host for command, filesystem and network interception
//! 2. Loads policies from the configured directory (plus the built-in default)
//! 3. Opens the hash-chained audit log
//! 4. Serves the control API until Ctrl-C, then terminates every session

use anyhow::{anyhow, Result};
use std::sync::{mpsc, Arc};

use agentgate::api::{ApiConfig, ApiServer};
use agentgate::{AgentgateConfig, Capability, Daemon};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = AgentgateConfig::load()?;
    let daemon = Arc::new(Daemon::open(&cfg)?);

    let matrix = daemon.capabilities.current();
    for capability in Capability::ALL {
        if !matrix.is_supported(capability) {
            log::warn!(
                "{} is {}; its shim will record intents as unenforced",
                capability,
                matrix.state(capability).as_str()
            );
        }
    }
    log::info!(
        "agentgated {} ready: {} policies, default {}, audit at {}",
        env!("CARGO_PKG_VERSION"),
        daemon.policies.len(),
        cfg.default_policy,
        cfg.db_path
    );

    let api_config = ApiConfig {
        addr: cfg.api_addr.clone(),
        token_path: cfg.api_token_path.clone(),
    };
    let api_handle = ApiServer::new(api_config, Arc::clone(&daemon)).spawn()?;
    log::info!("control api listening on {}", api_handle.addr);
    if let Some(path) = &api_handle.token_path {
        log::info!("control api token written to {}", path.display());
    } else {
        log::warn!(
            "control api token (handle securely): {}",
            api_handle.token
        );
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("agentgated waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, terminating sessions...");
    daemon.shutdown();
    api_handle.stop()?;

    Ok(())
}
