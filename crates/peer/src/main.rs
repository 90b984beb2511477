#![forbid(unsafe_code)]

mod heartbeat;
mod host;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use heartbeat::{Heartbeat, OpenDocuments};
use host::HeadlessHost;
use peerlink_core::ids::SessionId;
use peerlink_core::{PeerDocument, PeerIdentity};
use peerlink_gateway::{
    Gateway, GatewayOptions, MainContext, PeerConfig, RemoteClient, RemoteCommand, RuntimeDir,
};
use peerlink_storage::SharedStore;
use peerlink_storage::legacy::write_documents_file;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const MAIN_CONTEXT_POLL: Duration = Duration::from_millis(25);

#[derive(Parser, Debug)]
#[command(name = "peerlink", version, about = "Peer registry, shared selection and remote execution")]
struct Cli {
    /// Config file (TOML). Defaults to the per-user config when present.
    #[arg(long, global = true, env = "PEERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Registry database path.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a headless peer that registers documents and serves remote commands.
    Serve(ServeArgs),
    /// List registered peer documents.
    Peers {
        /// Include rows whose heartbeat expired.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Send one command to a peer's gateway.
    Invoke {
        session: String,
        command: String,
        /// Command arguments as JSON.
        #[arg(long)]
        args: Option<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Send one command to every live peer and print the answers.
    Broadcast {
        command: String,
        #[arg(long)]
        args: Option<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Inspect or clear the shared selection.
    Selection {
        #[command(subcommand)]
        action: SelectionAction,
    },
    /// Show a session's view activation history.
    History {
        session: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Distinct recent views of one document instead of the raw log.
        #[arg(long)]
        document: Option<String>,
    },
    /// Write the registry in the legacy CSV documents format.
    ExportLegacy {
        file: PathBuf,
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SelectionAction {
    Show {
        /// Only items whose document some live peer has open.
        #[arg(long)]
        open_only: bool,
        #[arg(long)]
        json: bool,
    },
    Clear,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// `TITLE` or `TITLE=PATH`; repeatable.
    #[arg(long = "document", value_name = "TITLE[=PATH]")]
    documents: Vec<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    bind: Option<IpAddr>,
    /// Register documents without starting the gateway.
    #[arg(long)]
    no_gateway: bool,
    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration_secs: Option<u64>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = PeerConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = Some(db);
    }
    let db_path = config.db_path_or_default();
    let store = SharedStore::open(&db_path)
        .with_context(|| format!("opening registry {}", db_path.display()))?;

    match cli.command {
        Command::Serve(args) => serve(config, store, args),
        Command::Peers { all, json } => {
            let rows = if all {
                store.all_peers()
            } else {
                store.active_peers()
            };
            print_peers(&rows, json)
        }
        Command::Invoke {
            session,
            command,
            args,
            timeout_secs,
        } => {
            let session = SessionId::try_new(session)?;
            let command = parse_command(&command, args.as_deref())?;
            let client = client(&config, store)?;
            let response = client.invoke(&session, &command, timeout_secs.map(Duration::from_secs))?;
            print!("{}", response.output);
            if !response.success {
                bail!(
                    "{session}: {}",
                    response.error.as_deref().unwrap_or("command failed")
                );
            }
            Ok(())
        }
        Command::Broadcast {
            command,
            args,
            timeout_secs,
        } => {
            let command = parse_command(&command, args.as_deref())?;
            let mut sessions = store
                .active_peers()
                .into_iter()
                .map(|doc| doc.session_id)
                .collect::<Vec<_>>();
            sessions.sort();
            sessions.dedup();
            let client = client(&config, store)?;
            for (session, response) in
                client.invoke_all(&sessions, &command, timeout_secs.map(Duration::from_secs))
            {
                let status = if response.success { "ok" } else { "failed" };
                println!("== {session} ({status})");
                print!("{}", response.output);
                if let Some(error) = response.error {
                    println!("error: {error}");
                }
            }
            Ok(())
        }
        Command::Selection { action } => match action {
            SelectionAction::Show { open_only, json } => {
                let items = if open_only {
                    store.selection_for_open_peers()
                } else {
                    store.selection()
                };
                if json {
                    println!("{}", serde_json::to_string_pretty(&items)?);
                } else {
                    for item in items {
                        println!("{}\t{}\t{}", item.document_title, item.unique_id, item.document_path);
                    }
                }
                Ok(())
            }
            SelectionAction::Clear => {
                let removed = store.clear_selection()?;
                tracing::info!(removed, "selection cleared");
                Ok(())
            }
        },
        Command::History {
            session,
            limit,
            document,
        } => {
            let session = SessionId::try_new(session)?;
            let entries = match document {
                Some(title) => store.recent_views(&session, &title),
                None => store.history_for_session(&session, limit),
            };
            for entry in entries {
                println!(
                    "{}\t{}\t{}\t{}",
                    peerlink_core::clock::ts_ms_to_rfc3339(entry.activated_at_ms),
                    entry.document_title,
                    entry.view_title,
                    entry.view_type
                );
            }
            Ok(())
        }
        Command::ExportLegacy { file, all } => {
            let rows = if all {
                store.all_peers()
            } else {
                store.active_peers()
            };
            write_documents_file(&file, &rows)
                .with_context(|| format!("writing {}", file.display()))?;
            tracing::info!(rows = rows.len(), file = %file.display(), "legacy documents file written");
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn client(config: &PeerConfig, store: SharedStore) -> Result<RemoteClient> {
    let runtime_dir = RuntimeDir::resolve(config.runtime_dir.as_deref())?;
    Ok(RemoteClient::from_config(store, runtime_dir, config)?)
}

fn parse_command(name: &str, args: Option<&str>) -> Result<RemoteCommand> {
    let args = args
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--args must be JSON")?;
    RemoteCommand::from_name_and_args(name, args)
        .with_context(|| format!("invalid arguments for {name}"))
}

fn parse_document_arg(raw: &str) -> Result<(String, String)> {
    let (title, path) = match raw.split_once('=') {
        Some((title, path)) => (title.trim(), path.trim()),
        None => (raw.trim(), ""),
    };
    if title.is_empty() {
        bail!("--document needs a title: {raw:?}");
    }
    Ok((title.to_string(), path.to_string()))
}

fn print_peers(rows: &[PeerDocument], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(rows)?);
        return Ok(());
    }
    for doc in rows {
        println!(
            "{}\t{}:{}\t{}\t{}",
            doc.session_id,
            doc.hostname,
            doc.port,
            doc.document_title,
            peerlink_core::clock::ts_ms_to_rfc3339(doc.last_heartbeat_ms)
        );
    }
    Ok(())
}

fn serve(mut config: PeerConfig, store: SharedStore, args: ServeArgs) -> Result<()> {
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    let documents = args
        .documents
        .iter()
        .map(|raw| parse_document_arg(raw))
        .collect::<Result<Vec<_>>>()?;

    let hostname = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    let identity = PeerIdentity::new(hostname.clone(), std::process::id());
    tracing::info!(session = %identity.session_id, "starting peer");

    match store.prune_history(config.history_keep_per_session) {
        Ok(0) => {}
        Ok(pruned) => tracing::info!(pruned, "old view history pruned"),
        Err(err) => tracing::warn!(error = %err, "history prune failed"),
    }

    let (main_context, dispatcher) = MainContext::channel(identity.clone());
    let mut gateway = if args.no_gateway {
        None
    } else {
        let runtime_dir = RuntimeDir::resolve(config.runtime_dir.as_deref())?;
        Gateway::start_best_effort(
            identity.clone(),
            dispatcher.clone(),
            GatewayOptions::from_config(&config, runtime_dir, &hostname),
        )
    };
    let port = gateway.as_ref().map_or(0, Gateway::port);

    let open: OpenDocuments = Arc::new(Mutex::new(Vec::new()));
    let mut host = HeadlessHost::new(identity.clone(), store.clone(), Arc::clone(&open), port);
    for (title, path) in &documents {
        host.open_document(title, path)
            .with_context(|| format!("registering {title}"))?;
    }
    let mut heartbeat = Heartbeat::start(
        store,
        identity.session_id.clone(),
        open,
        config.heartbeat_interval(),
    )?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            tracing::info!("shutdown requested");
            stop.store(true, Ordering::SeqCst);
        })
        .context("installing the Ctrl-C handler")?;
    }
    if let Some(secs) = args.duration_secs {
        let stop = Arc::clone(&stop);
        std::thread::Builder::new()
            .name("peerlink-timer".to_string())
            .spawn(move || {
                std::thread::sleep(Duration::from_secs(secs));
                stop.store(true, Ordering::SeqCst);
            })?;
    }

    main_context.run_until(&mut host, &stop, MAIN_CONTEXT_POLL);

    // Requests accepted before shutdown still need the main context while the gateway drains.
    let drained = AtomicBool::new(false);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            if let Some(gateway) = gateway.as_mut() {
                gateway.shutdown();
            }
            drained.store(true, Ordering::SeqCst);
        });
        main_context.run_until(&mut host, &drained, MAIN_CONTEXT_POLL);
    });
    drop(dispatcher);
    heartbeat.stop();
    tracing::info!(session = %identity.session_id, "peer stopped");
    Ok(())
}
