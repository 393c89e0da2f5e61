// NetworkTables daemon: serve or mirror a table until Ctrl+C or SIGTERM.

mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use log::{info, warn};
use nt_core::{NtInstance, FLAG_PERSISTENT};

use crate::config::{Config, Mode};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("nt-daemon {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let p = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(p));
            }
            other => anyhow::bail!("unknown argument {:?}", other),
        }
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cfg = config::load(config_path.as_deref())?;

    let nt = NtInstance::new();
    nt.set_network_identity(&cfg.identity);
    nt.set_update_rate(Duration::from_millis(cfg.update_rate_ms));
    nt.set_default_proto_rev(cfg.protocol_revision);
    nt.add_connection_listener(false, |_, n| {
        let who = format!("{} ({}:{})", n.info.remote_id, n.info.remote_ip, n.info.remote_port);
        if n.connected {
            info!("{} connected, protocol {:#06x}", who, n.info.protocol_version);
        } else {
            info!("{} disconnected", who);
        }
    });

    start(&nt, &cfg)?;
    seed(&nt, &cfg);

    let rt = tokio::runtime::Runtime::new()?;
    let signal = rt.block_on(shutdown_signal())?;
    info!("{} received, shutting down", signal);
    nt.stop();
    Ok(())
}

fn start(nt: &NtInstance, cfg: &Config) -> anyhow::Result<()> {
    match cfg.mode {
        Mode::Server => {
            nt.start_server(cfg.persist_file.clone(), &cfg.listen_address, cfg.port)?;
            info!("serving as {:?} on port {}", cfg.identity, cfg.port);
        }
        Mode::Client => {
            if let Some(o) = &cfg.server_override {
                nt.set_server_override(&o.host, o.port);
            }
            let servers = cfg
                .servers
                .iter()
                .map(|s| (s.host.clone(), s.port))
                .collect();
            nt.start_client(servers)?;
            info!("client {:?} started", cfg.identity);
        }
    }
    Ok(())
}

/// Seed configured entries. Values already in the table (e.g. from the persist file) win.
fn seed(nt: &NtInstance, cfg: &Config) {
    for e in &cfg.entries {
        if !nt.set_default_entry_value(&e.name, e.value.clone()) {
            warn!("{}: existing value has a different type, seed ignored", e.name);
            continue;
        }
        if e.persistent {
            nt.set_entry_flags(&e.name, nt.get_entry_flags(&e.name) | FLAG_PERSISTENT);
        }
    }
}

/// Block until Ctrl+C or SIGTERM (Unix) and name the signal. The caller then
/// stops the instance: connections close, peers see a disconnect, and a server
/// with a persist file writes it one last time if anything changed.
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        Ok(tokio::select! {
            r = tokio::signal::ctrl_c() => {
                r?;
                "SIGINT"
            }
            _ = sigterm.recv() => "SIGTERM",
            _ = sighup.recv() => "SIGHUP",
        })
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}
