// DeltaPod Linux: listener, peer connections, sync worker.

mod config;
mod transport;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use deltapod_core::{spawn_worker, FileStore, Inbox, MemoryIndex, Pipe, SyncSystem};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code for an unusable configuration.
const EXIT_CONFIG: u8 = 2;
/// Exit code when the listen port cannot be bound.
const EXIT_BIND: u8 = 3;

fn main() -> ExitCode {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("deltapod-linux {}", VERSION);
                return ExitCode::SUCCESS;
            }
            "--config" => match args.next() {
                Some(p) => config_path = Some(PathBuf::from(p)),
                None => {
                    eprintln!("--config needs a path");
                    return ExitCode::from(EXIT_CONFIG);
                }
            },
            other => {
                eprintln!("unknown argument: {other}");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    }

    let cfg = match config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cfg) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "daemon failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cfg: config::Config) -> anyhow::Result<ExitCode> {
    let store = FileStore::new(&cfg.root);
    let system = SyncSystem::new(MemoryIndex::new(), store, cfg.sync_config());
    let inbox: Inbox = Arc::new(Pipe::new());
    let worker = spawn_worker(system, inbox.clone())?;

    let rt = tokio::runtime::Runtime::new()?;
    let announce_every = Duration::from_secs(cfg.announce_interval_secs);
    let bound = rt.block_on(async {
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", cfg.listen_port)).await {
            Ok(l) => l,
            Err(e) => {
                error!(port = cfg.listen_port, error = %e, "bind failed");
                return Ok(false);
            }
        };
        info!(
            port = cfg.listen_port,
            root = %cfg.root.display(),
            peers = cfg.peers.len(),
            "deltapod {} listening",
            VERSION
        );
        tokio::spawn(transport::run_listener(
            listener,
            inbox.clone(),
            announce_every,
        ));
        for peer in &cfg.peers {
            tokio::spawn(transport::run_peer(
                peer.clone(),
                inbox.clone(),
                announce_every,
            ));
        }
        shutdown_signal().await?;
        info!("shutting down");
        Ok::<_, std::io::Error>(true)
    })?;

    inbox.close();
    rt.shutdown_timeout(Duration::from_secs(1));
    if worker.join().is_err() {
        anyhow::bail!("sync worker panicked");
    }
    Ok(if bound {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_BIND)
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
