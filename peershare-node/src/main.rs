// PeerShare node: TCP transport, LAN provider routing, shared-directory catalog and downloads.

mod catalog;
mod config;
mod discovery;
mod transport;

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use peershare_core::download::percentage;
use peershare_core::memory::MemoryCatalog;
use peershare_core::{
    ChannelSink, ContentId, DiscoveryGateway, DownloadEngine, DownloadId, DownloadRecord,
    DownloadState, DownloadStatus, EventSink, HandlerRegistry, JsonDownloadStore, NodeEvent,
    ProviderOutcome, RpcEngine, Search, Transport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::discovery::LanRouting;
use crate::transport::{AddressBook, TcpTransport};

#[derive(Parser)]
#[command(name = "peershare-node", version, about = "PeerShare file sharing node")]
struct Cli {
    /// Config file (default: ~/.config/peershare/config.toml, then /etc/peershare/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    listen_port: Option<u16>,
    #[arg(long, global = true)]
    discovery_port: Option<u16>,
    #[arg(long, global = true)]
    shared_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Share files and answer peers until interrupted. Download commands are read from stdin.
    Serve,
    /// Find `name` on the network, download the first match and exit.
    Get {
        name: String,
        /// Replace an unfinished download of the same content.
        #[arg(long = "override")]
        override_existing: bool,
    },
    #[command(flatten)]
    Downloads(DownloadCommand),
}

/// Download management. Accepted as subcommands and, while serving, as lines on stdin.
#[derive(Subcommand, Debug, PartialEq, Eq)]
enum DownloadCommand {
    /// Show every known download.
    List,
    /// Continue a paused download. From the command line it runs in the foreground.
    Resume { id: DownloadId },
    /// Stop a running download at its next chunk. Only a serving node has running downloads.
    Pause { id: DownloadId },
    /// Forget a download.
    Delete {
        id: DownloadId,
        /// Also remove the downloaded file.
        #[arg(long)]
        files: bool,
    },
}

/// One line of control input, e.g. `pause 67e55044-10b1-426f-9247-bb680e5fe0c8`.
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_help_flag = true, disable_version_flag = true)]
struct ControlLine {
    #[command(subcommand)]
    command: DownloadCommand,
}

impl Cli {
    fn apply(&self, c: &mut Config) {
        if let Some(port) = self.listen_port {
            c.listen_port = port;
        }
        if let Some(port) = self.discovery_port {
            c.discovery_port = port;
        }
        if let Some(dir) = &self.shared_dir {
            c.shared_dir = dir.clone();
        }
        if let Some(dir) = &self.download_dir {
            c.download_dir = dir.clone();
        }
    }
}

struct Node {
    engine: Arc<DownloadEngine>,
    search: Search,
    sink: ChannelSink,
    events: mpsc::UnboundedReceiver<NodeEvent>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    cli.apply(&mut cfg);
    config::init_tracing(&cfg);

    let node = start(&cfg).await?;
    match cli.command {
        Command::Serve => serve(node).await,
        Command::Get {
            name,
            override_existing,
        } => get(node, &name, override_existing).await,
        Command::Downloads(DownloadCommand::Resume { id }) => {
            node.engine.resume(id).await?;
            let record = node.engine.get(id).await?.with_context(|| format!("download {id} vanished"))?;
            let state = run_foreground(&node.engine, id).await?;
            report(&record, &state)
        }
        Command::Downloads(DownloadCommand::Pause { id }) => anyhow::bail!(
            "download {id} is not running here; send `pause {id}` to the serving node's input"
        ),
        Command::Downloads(command) => manage(&node.engine, command).await,
    }
}

async fn start(cfg: &Config) -> anyhow::Result<Node> {
    let peer = config::load_or_create_peer_id(&cfg.data_dir)?;
    let book = AddressBook::default();

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, cfg.listen_port))
        .await
        .with_context(|| format!("failed to listen on port {}", cfg.listen_port))?;
    let listen_addr: SocketAddr = listener.local_addr()?;
    let transport = Arc::new(TcpTransport::new(peer, listen_addr, book.clone()));
    tokio::spawn({
        let transport = transport.clone();
        async move {
            if let Err(err) = transport.serve(listener).await {
                tracing::error!(error = %err, "transport stopped");
            }
        }
    });

    let routing = Arc::new(LanRouting::new(
        peer,
        listen_addr.port(),
        Duration::from_secs(cfg.announce_interval_secs.max(1)),
        book,
    ));
    tokio::spawn({
        let routing = routing.clone();
        let port = cfg.discovery_port;
        async move {
            if let Err(err) = routing.run(port).await {
                tracing::error!(error = %err, "lan discovery stopped");
            }
        }
    });

    let files = catalog::scan(&cfg.shared_dir)
        .await
        .with_context(|| format!("failed to scan shared dir {}", cfg.shared_dir.display()))?;

    let catalog = Arc::new(MemoryCatalog::new(files));
    let identifiers: HashSet<ContentId> = catalog.files().iter().map(|f| f.identifier).collect();
    let registry = HandlerRegistry::with_catalog(catalog);
    let rpc = Arc::new(RpcEngine::new(transport.clone(), registry));
    rpc.register();

    let discovery = Arc::new(DiscoveryGateway::new(routing, peer, transport.listen_addrs()));
    for identifier in &identifiers {
        discovery.announce(identifier).await;
    }

    let store = JsonDownloadStore::open(cfg.records_dir()).await?;
    let (sink, events) = ChannelSink::new();
    let engine = Arc::new(DownloadEngine::new(
        rpc.clone(),
        Arc::new(store),
        Arc::new(sink.clone()),
        cfg.download_dir.clone(),
    ));
    let recovered = engine.recover().await?;
    if !recovered.is_empty() {
        tracing::info!(
            count = recovered.len(),
            "interrupted downloads are paused; `resume <id>` to continue"
        );
    }

    tracing::info!(peer = %peer, addr = %listen_addr, shared = identifiers.len(), "node started");
    Ok(Node {
        engine,
        search: Search::new(rpc, discovery, cfg.search()),
        sink,
        events,
    })
}

async fn serve(node: Node) -> anyhow::Result<()> {
    let Node {
        engine,
        sink,
        mut events,
        ..
    } = node;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                tracing::info!("shutting down");
                return Ok(());
            }
            Some(event) = events.recv() => on_event(&engine, &sink, event),
            line = input.next_line(), if input_open => match line {
                Ok(Some(line)) => control(&engine, &line).await,
                Ok(None) => input_open = false,
                Err(err) => {
                    tracing::warn!(error = %err, "control input closed");
                    input_open = false;
                }
            },
        }
    }
}

/// Apply one line of control input. Resumed downloads start through the event loop.
async fn control(engine: &DownloadEngine, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match ControlLine::try_parse_from(line.split_whitespace()) {
        Ok(parsed) => {
            if let Err(err) = manage(engine, parsed.command).await {
                tracing::warn!(command = line.trim(), error = %err, "command failed");
            }
        }
        Err(err) => tracing::warn!(command = line.trim(), "{}", err.render()),
    }
}

async fn manage(engine: &DownloadEngine, command: DownloadCommand) -> anyhow::Result<()> {
    match command {
        DownloadCommand::List => {
            for record in engine.list().await? {
                println!("{}", describe(&record));
            }
        }
        DownloadCommand::Resume { id } => {
            engine.resume(id).await?;
        }
        DownloadCommand::Pause { id } => {
            let state = engine.pause(id).await?;
            log_progress(&state);
        }
        DownloadCommand::Delete { id, files } => engine.delete(id, files).await?,
    }
    Ok(())
}

/// One `list` row: id, status, progress and destination.
fn describe(record: &DownloadRecord) -> String {
    format!(
        "{}  {:<20}  {:>3}%  {}/{}  {}",
        record.id,
        format!("{:?}", record.status),
        percentage(record.offset, record.remote_size),
        record.offset,
        record.remote_size,
        record.path.display()
    )
}

fn on_event(engine: &Arc<DownloadEngine>, sink: &ChannelSink, event: NodeEvent) {
    match event {
        NodeEvent::DownloadQueued { id, .. } | NodeEvent::DownloadResumed(id) => {
            spawn_run(engine.clone(), sink.clone(), id);
        }
        NodeEvent::Progress(state) => log_progress(&state),
        NodeEvent::Monitor(message) => tracing::info!(event = "monitor", "{message}"),
    }
}

/// Run a download in the background, feeding its snapshots back as progress events.
fn spawn_run(engine: Arc<DownloadEngine>, sink: ChannelSink, id: DownloadId) {
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let forward = tokio::spawn(async move {
            while let Some(state) = rx.recv().await {
                sink.emit(NodeEvent::Progress(state));
            }
        });
        if let Err(err) = engine.run(id, &tx).await {
            tracing::warn!(download = %id, error = %err, "download run failed");
        }
        drop(tx);
        let _ = forward.await;
    });
}

fn log_progress(state: &DownloadState) {
    tracing::info!(
        download = %state.id,
        status = ?state.status,
        offset = state.offset,
        size = state.size,
        "{}%",
        state.percentage
    );
}

async fn get(node: Node, name: &str, override_existing: bool) -> anyhow::Result<()> {
    let results = node.search.search_files(name).await;
    let (peer, file) = results
        .into_iter()
        .find_map(|result| match result.outcome {
            ProviderOutcome::Found(files) => files.into_iter().next().map(|f| (result.peer, f)),
            ProviderOutcome::Unreachable(reason) => {
                tracing::info!(peer = %result.peer.id, reason = %reason, "provider unreachable");
                None
            }
        })
        .with_context(|| format!("no provider found for {name:?}"))?;
    tracing::info!(peer = %peer.id, file = file.id, path = %file.path, size = file.size, "found");

    let record = node
        .engine
        .queue(peer.id, file.id, override_existing)
        .await?;
    let state = run_foreground(&node.engine, record.id).await?;
    report(&record, &state)
}

/// Run a download to its end, logging progress. Ctrl+C pauses it instead of abandoning it.
async fn run_foreground(
    engine: &Arc<DownloadEngine>,
    id: DownloadId,
) -> anyhow::Result<DownloadState> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let logger = tokio::spawn(async move {
        while let Some(state) = rx.recv().await {
            log_progress(&state);
        }
    });
    let state = {
        let run = engine.run(id, &tx);
        tokio::pin!(run);
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        tokio::select! {
            state = &mut run => state?,
            res = &mut shutdown => {
                res?;
                if let Err(err) = engine.pause(id).await {
                    tracing::debug!(download = %id, error = %err, "nothing to pause");
                }
                (&mut run).await?
            }
        }
    };
    drop(tx);
    let _ = logger.await;
    Ok(state)
}

fn report(record: &DownloadRecord, state: &DownloadState) -> anyhow::Result<()> {
    match state.status {
        DownloadStatus::CompletedUnverified => {
            tracing::info!(path = %record.path.display(), "download complete");
            Ok(())
        }
        DownloadStatus::Paused => {
            tracing::info!(download = %record.id, offset = state.offset, "paused; `resume {}` to continue", record.id);
            Ok(())
        }
        other => anyhow::bail!("download {} ended as {:?}", record.id, other),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "peershare-node",
            "--listen-port",
            "7000",
            "--shared-dir",
            "/srv/share",
            "get",
            "song",
            "--override",
        ]);
        let mut cfg = Config::default();
        cli.apply(&mut cfg);
        assert_eq!(cfg.listen_port, 7000);
        assert_eq!(cfg.shared_dir, PathBuf::from("/srv/share"));
        assert_eq!(cfg.discovery_port, Config::default().discovery_port);
        match cli.command {
            Command::Get {
                name,
                override_existing,
            } => {
                assert_eq!(name, "song");
                assert!(override_existing);
            }
            _ => panic!("expected get"),
        }
    }

    const ID: &str = "67e55044-10b1-426f-9247-bb680e5fe0c8";

    #[test]
    fn download_subcommands_parse() {
        let id: DownloadId = ID.parse().unwrap();
        let cli = Cli::parse_from(["peershare-node", "delete", ID, "--files"]);
        assert!(matches!(
            cli.command,
            Command::Downloads(DownloadCommand::Delete { id: got, files: true }) if got == id
        ));
        let cli = Cli::parse_from(["peershare-node", "list"]);
        assert!(matches!(cli.command, Command::Downloads(DownloadCommand::List)));
        assert!(Cli::try_parse_from(["peershare-node", "resume", "not-a-uuid"]).is_err());
    }

    #[test]
    fn control_lines_parse_without_binary_name() {
        let id: DownloadId = ID.parse().unwrap();
        let line = format!("pause {ID}");
        let parsed = ControlLine::try_parse_from(line.split_whitespace()).unwrap();
        assert_eq!(parsed.command, DownloadCommand::Pause { id });
        let parsed = ControlLine::try_parse_from(["resume", ID]).unwrap();
        assert_eq!(parsed.command, DownloadCommand::Resume { id });
        assert!(ControlLine::try_parse_from(["serve"]).is_err());
        assert!(ControlLine::try_parse_from(["delete"]).is_err());
    }

    #[test]
    fn list_row_shows_status_and_progress() {
        let record = DownloadRecord {
            id: ID.parse().unwrap(),
            remote_peer: peershare_core::PeerId::from_bytes([1; 16]),
            remote_file_id: 3,
            remote_checksum: "abc".into(),
            remote_size: 200,
            offset: 50,
            status: DownloadStatus::Paused,
            path: PathBuf::from("/tmp/dl/foo.bin"),
        };
        let row = describe(&record);
        assert!(row.starts_with(ID));
        assert!(row.contains("Paused"));
        assert!(row.contains(" 25%"));
        assert!(row.contains("50/200"));
        assert!(row.ends_with("/tmp/dl/foo.bin"));
    }

    #[test]
    fn serve_takes_no_arguments() {
        assert!(Cli::try_parse_from(["peershare-node", "serve", "extra"]).is_err());
        assert!(Cli::try_parse_from(["peershare-node", "serve"]).is_ok());
    }
}
