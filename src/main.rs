use anyhow::Context;
use clap::Parser;
use rand::rngs::OsRng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wpa_lite::config::Config;
use wpa_lite::engine::{Engine, EngineHandle, LowerMac, RoleSettings, SessionObserver};
use wpa_lite::error::ReasonCode;
use wpa_lite::handshake::InstalledKeys;
use wpa_lite::keys::Gtk;
use wpa_lite::link::LoopbackMac;
use wpa_lite::pmksa::{JsonFileStore, PmksaStore};
use wpa_lite::types::{MacAddr, Role};

#[derive(Parser)]
#[command(name = "wpa-lite")]
#[command(about = "WPA2/WPA3 handshake engine running an access point and a station over a loopback link")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Group rekeys to force once the station is connected
    #[arg(short, long, default_value_t = 1)]
    rekeys: u32,
}

#[derive(Debug)]
enum Progress {
    Complete(Role),
    Failed(Role, ReasonCode),
    GroupDone(u8),
}

/// Logs every session event and reports progress to `main`
struct LogObserver {
    progress: mpsc::UnboundedSender<Progress>,
}

impl SessionObserver for LogObserver {
    fn handshake_started(&self, role: Role, peer: MacAddr, rekey: bool) {
        info!("[{}] {} with {} started", role, if rekey { "Rekey" } else { "4-way handshake" }, peer);
    }

    fn handshake_complete(&self, role: Role, peer: MacAddr, keys: &InstalledKeys) {
        info!(
            "[{}] Keys installed with {} (GTK index {})",
            role,
            peer,
            keys.gtk.as_ref().map_or("-".to_string(), |g| g.index.to_string())
        );
        let _ = self.progress.send(Progress::Complete(role));
    }

    fn handshake_failed(&self, role: Role, peer: MacAddr, reason: ReasonCode) {
        warn!("[{}] Handshake with {} failed: {}", role, peer, reason);
        let _ = self.progress.send(Progress::Failed(role, reason));
    }

    fn group_keys_installed(&self, role: Role, peer: MacAddr, gtk: &Gtk) {
        info!("[{}] Group key index {} in use with {}", role, gtk.index, peer);
    }

    fn group_rekey_complete(&self, gtk_index: u8) {
        info!("Group rekey to index {} complete", gtk_index);
        let _ = self.progress.send(Progress::GroupDone(gtk_index));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("wpa-lite v{}", env!("CARGO_PKG_VERSION"));
    info!("Policy {:?} on SSID {:?}", config.security.policy, config.security.ssid);

    let ap_settings = config
        .role_settings(Role::Authenticator)
        .context("Invalid access point settings")?;
    let sta_settings = config
        .role_settings(Role::Supplicant)
        .context("Invalid station settings")?;
    let store: Option<Box<dyn PmksaStore>> = config.pmksa.store_path.as_ref().map(|path| {
        info!("PMKSA cache persisted to {:?}", path);
        Box::new(JsonFileStore::new(path.clone())) as Box<dyn PmksaStore>
    });

    let link = Arc::new(LoopbackMac::new());
    let (tx, mut progress) = mpsc::unbounded_channel();
    let observer = Arc::new(LogObserver { progress: tx });

    let ap = start(ap_settings, &link, observer.clone(), store)?;
    let sta = start(sta_settings, &link, observer, None)?;

    sta.connect(
        ap.own(),
        ap.advertised_ie().to_vec(),
        ap.advertised_rsnxe().map(|r| r.to_vec()),
    )?;

    let result = drive(&ap, &mut progress, cli.rekeys).await;
    match &result {
        Ok(()) => {
            info!("Link up. Press Ctrl+C to stop.");
            tokio::signal::ctrl_c().await?;
        }
        Err(e) => error!("Simulation failed: {:#}", e),
    }

    info!("Shutting down...");
    sta.shutdown().await;
    ap.shutdown().await;
    link.detach(sta.own());
    link.detach(ap.own());
    result
}

fn start(
    settings: RoleSettings,
    link: &Arc<LoopbackMac>,
    observer: Arc<LogObserver>,
    store: Option<Box<dyn PmksaStore>>,
) -> anyhow::Result<EngineHandle> {
    let own = settings.own;
    let role = settings.role;
    let lower: Arc<dyn LowerMac> = link.clone();
    let engine = Engine::new(settings, lower, observer, Box::new(OsRng), store)
        .with_context(|| format!("Failed to start {} {}", role, own))?;
    let handle = engine.spawn();
    link.attach(own, handle.clone());
    Ok(handle)
}

/// Wait for the initial handshake, then run the forced group rekeys
async fn drive(
    ap: &EngineHandle,
    progress: &mut mpsc::UnboundedReceiver<Progress>,
    rekeys: u32,
) -> anyhow::Result<()> {
    let mut ap_done = false;
    let mut sta_done = false;
    while !(ap_done && sta_done) {
        match next(progress).await? {
            Progress::Complete(Role::Authenticator) => ap_done = true,
            Progress::Complete(Role::Supplicant) => sta_done = true,
            Progress::Failed(role, reason) => anyhow::bail!("{} failed: {}", role, reason),
            Progress::GroupDone(_) => {}
        }
    }

    for round in 1..=rekeys {
        ap.group_rekey()?;
        loop {
            match next(progress).await? {
                Progress::GroupDone(index) => {
                    info!("Rekey {}/{} done, GTK index {}", round, rekeys, index);
                    break;
                }
                Progress::Failed(role, reason) => anyhow::bail!("{} failed: {}", role, reason),
                Progress::Complete(_) => {}
            }
        }
    }
    Ok(())
}

async fn next(progress: &mut mpsc::UnboundedReceiver<Progress>) -> anyhow::Result<Progress> {
    tokio::time::timeout(Duration::from_secs(30), progress.recv())
        .await
        .context("Timed out waiting for the handshake")?
        .context("Engines stopped")
}
