//! Command handlers: each builds the core pieces and runs one operation.

use anyhow::{Context, Result, bail};
use fsync_core::{
    AutoConfirm, Confirm, DirectoryScope, ListenOutcome, NoProgress, PeerAddress, PeerStore,
    PushOutcome, SyncEngine, SyncListener, TransferProgress,
};
use std::io::IsTerminal;
use tracing::info;

use crate::config::{Args, Command, Config};
use crate::persistence::JsonPeerStore;
use crate::progress::{ConsoleProgress, format_bytes};
use crate::prompt::PromptConfirmer;

pub async fn run(args: Args) -> Result<()> {
    let config = Config::from_args(&args);
    match args.command {
        Command::Listen { port, host, yes } => listen(&config, &host, port, yes).await,
        Command::Sync { peer, patterns } => sync(&config, peer, &patterns).await,
        Command::Register { host, port } => register(&config, host, port),
        Command::Peers => list_peers(&config),
    }
}

fn engine(config: &Config) -> Result<SyncEngine> {
    let scope = DirectoryScope::new(&config.dir)
        .with_context(|| format!("Cannot sync {}", config.dir.display()))?;
    let progress: Box<dyn TransferProgress> = if std::io::stderr().is_terminal() {
        Box::new(ConsoleProgress::stderr())
    } else {
        Box::new(NoProgress)
    };
    Ok(SyncEngine::new(scope, config.sync_config()).with_progress(progress))
}

async fn listen(config: &Config, host: &str, port: u16, yes: bool) -> Result<()> {
    let mut engine = engine(config)?;
    let addr = PeerAddress::with_port(host, port)?.to_string();
    let listener = SyncListener::bind(&addr).await?;
    info!("Listening on {} for one sync session", addr);

    let confirm: Box<dyn Confirm> = if yes {
        Box::new(AutoConfirm(true))
    } else {
        Box::new(PromptConfirmer::stdio())
    };
    match engine.await_sync(&listener, confirm.as_ref()).await? {
        ListenOutcome::Received { files, bytes } => {
            println!("Received {} file(s), {}", files, format_bytes(bytes));
        }
        ListenOutcome::Declined => println!("Sync aborted"),
    }
    Ok(())
}

async fn sync(config: &Config, peer: Option<PeerAddress>, patterns: &[String]) -> Result<()> {
    let mut engine = engine(config)?;
    let reports = match peer {
        Some(peer) => engine.init_sync(&[peer], patterns).await,
        None => {
            let store = JsonPeerStore::new(&config.peers_file);
            engine
                .init_sync_registered(&store, patterns)
                .await
                .context("Failed to load peer list")?
        }
    };
    if reports.is_empty() {
        bail!(
            "No peers to sync with; pass --peer or add one with `fsync register` ({})",
            config.peers_file.display()
        );
    }

    let mut failed = 0;
    for report in &reports {
        match &report.result {
            Ok(PushOutcome::Sent { files, bytes }) => {
                println!(
                    "{}: sent {} file(s), {}",
                    report.peer,
                    files,
                    format_bytes(*bytes)
                );
            }
            Ok(PushOutcome::Declined) => println!("{}: declined", report.peer),
            Err(e) => {
                failed += 1;
                eprintln!("{}: {}", report.peer, e);
            }
        }
    }
    if failed > 0 {
        bail!("Sync failed for {} of {} peer(s)", failed, reports.len());
    }
    Ok(())
}

fn register(config: &Config, host: String, port: u16) -> Result<()> {
    let peer = PeerAddress::with_port(host, port)?;
    let store = JsonPeerStore::new(&config.peers_file);
    if store.append(peer.clone())? {
        println!("Registered {}", peer);
    } else {
        println!("{} is already registered", peer);
    }
    Ok(())
}

fn list_peers(config: &Config) -> Result<()> {
    let peers = JsonPeerStore::new(&config.peers_file).load()?;
    if peers.is_empty() {
        println!("No registered peers ({})", config.peers_file.display());
    }
    for peer in peers {
        println!("{}", peer);
    }
    Ok(())
}
