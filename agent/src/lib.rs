pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod socket;
pub mod state;
pub mod transport;

use std::sync::Arc;

use anyhow::{bail, Context};
use codec::{ChannelStateInfo, PacketType};
use config::{AgentSettings, Cli, Command};
use notify::Notifier;
use tokio::sync::watch;

/// Surfaced for malformed CLI input that `clap` itself cannot catch
/// (rule syntax is validated by `RuleArg::from_str`; this covers
/// cross-rule invariants). `main` maps this to exit code 2, matching
/// the code `clap` uses for its own parse failures, instead of the
/// generic failure exit code used for runtime errors.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = AgentSettings::from_cli(&cli);
    let rules: Vec<codec::ForwardingRule> = cli.rules.iter().cloned().map(Into::into).collect();

    if let Some(port) = config::duplicate_local_port(&rules) {
        return Err(ValidationError(format!(
            "two forwarding rules cannot share local port {port}"
        ))
        .into());
    }

    match cli.command {
        Command::List => list_members(&settings).await,
        Command::Start => start(settings, rules).await,
    }
}

/// `list`: connect just long enough to receive the first `ChannelState`,
/// print the current members in join order, then disconnect.
async fn list_members(settings: &AgentSettings) -> anyhow::Result<()> {
    let mut transport = transport::connect(settings)
        .await
        .context("failed to connect to the relay")?;

    loop {
        let (packet, ok) = transport.read().await;
        if !ok {
            bail!("connection closed before receiving channel state");
        }
        let Some(packet) = packet else { continue };

        match packet.r#type {
            PacketType::ChannelState => {
                let info: ChannelStateInfo = packet.body()?;
                for member in info.current_members {
                    println!("{}", member.name);
                }
                transport.handle.close();
                return Ok(());
            }
            PacketType::CriticalError => {
                let text: String = packet.body().unwrap_or_default();
                bail!(text);
            }
            _ => continue,
        }
    }
}

/// `start`: run the forwarder until SIGINT/SIGTERM.
async fn start(settings: AgentSettings, rules: Vec<codec::ForwardingRule>) -> anyhow::Result<()> {
    let notifier = Arc::new(Notifier::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    client::run(settings, rules, notifier, shutdown_rx).await
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
