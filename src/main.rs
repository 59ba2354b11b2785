mod doctor;

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use execflow_compiler::command::RunMode;
use execflow_compiler::{CommandRequest, CompileOptions, Compiler};
use execflow_core::config::{AppConfig, KEY_ENV_VAR};
use execflow_core::event::SessionEvent;
use execflow_core::graph::GraphSnapshot;
use execflow_core::types::{LogEntry, SessionState};
use execflow_crypto::{decrypt_to_string, encrypt, Envelope, SharedKey};
use execflow_dispatch::{Dispatcher, SingleShotClient, WsConnector};

const DEFAULT_CONFIG: &str = "execflow.toml";

#[derive(Parser)]
#[command(name = "execflow", version, about = "Compile task graphs and dispatch them to a remote agent")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a graph file (JSON or TOML) and print the task-set document
    Compile {
        graph: PathBuf,
        /// Print the parent-first node order instead of the document
        #[arg(long)]
        order: bool,
        #[arg(long)]
        pretty: bool,
    },
    /// Compile, encrypt, and stream a graph to the agent
    Run {
        graph: PathBuf,
        /// Override the streaming endpoint
        #[arg(long)]
        url: Option<String>,
    },
    /// Send a shell script to the agent as a single command
    Exec {
        script: PathBuf,
        /// Override the command endpoint
        #[arg(long)]
        url: Option<String>,
        /// Ask the agent to run synchronously
        #[arg(long)]
        sync: bool,
    },
    /// Encrypt stdin into a wire envelope
    Encrypt {
        /// Associated data (defaults to the configured value)
        #[arg(long)]
        aad: Option<String>,
    },
    /// Decrypt a wire envelope read from stdin
    Decrypt,
    /// Show current configuration
    Config,
    /// Run configuration health checks
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("execflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "execflow", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Compile {
            graph,
            order,
            pretty,
        } => {
            let snapshot = load_graph(&graph)?;
            let compiler = Compiler::new(CompileOptions::from(&config.compiler));
            let compiled = compiler.compile(&snapshot)?;
            if order {
                for id in &compiled.order {
                    println!("{}", id);
                }
            } else if pretty {
                println!("{}", compiled.document.to_json_pretty()?);
            } else {
                println!("{}", compiled.document.to_json()?);
            }
        }
        Commands::Run { graph, url } => {
            let snapshot = load_graph(&graph)?;
            run_stream(&config, &snapshot, url).await?;
        }
        Commands::Exec { script, url, sync } => {
            let source = std::fs::read_to_string(&script)
                .with_context(|| format!("reading script {}", script.display()))?;
            let mode = if sync { RunMode::Sync } else { RunMode::Async };
            let request = CommandRequest::run_bash_script(&source)
                .with_run_mode(mode)
                .to_json()?;

            let dispatcher = Dispatcher::from_config(&config)?;
            let mut client = SingleShotClient::from_config(&config)?;
            if let Some(url) = url {
                client = client.with_endpoint(url);
            }

            info!(endpoint = %client.endpoint(), "Sending command");
            let response = dispatcher.exec(&client, &request).await?;
            if response.envelope().is_some() {
                println!("{}", response.decrypt(dispatcher.key())?);
            } else {
                println!("{}", serde_json::to_string_pretty(&response.body)?);
            }
        }
        Commands::Encrypt { aad } => {
            let key = load_key(&config)?;
            let aad = aad.unwrap_or_else(|| config.crypto.associated_data.clone());
            let input = read_stdin()?;
            let envelope = encrypt(&key, input.as_bytes(), aad.as_bytes())?;
            println!("{}", envelope.to_json());
        }
        Commands::Decrypt => {
            let key = load_key(&config)?;
            let input = read_stdin()?;
            let envelope = Envelope::from_json(input.trim())?;
            print!("{}", decrypt_to_string(&envelope, &key)?);
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config.redacted())?);
        }
        Commands::Doctor => {
            println!("execflow doctor");
            println!("===============");
            doctor::run_doctor(&config);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// The default path may be absent; an explicit one must exist.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    if path == Path::new(DEFAULT_CONFIG) {
        warn!("No {} found, using defaults", DEFAULT_CONFIG);
        return Ok(AppConfig::default());
    }
    Ok(AppConfig::load(path)?)
}

fn load_graph(path: &Path) -> anyhow::Result<GraphSnapshot> {
    GraphSnapshot::load(path).with_context(|| format!("loading graph {}", path.display()))
}

fn load_key(config: &AppConfig) -> anyhow::Result<SharedKey> {
    let encoded = config.crypto.resolve_key().with_context(|| {
        format!("no key configured: set [crypto] key or {}", KEY_ENV_VAR)
    })?;
    Ok(SharedKey::from_base64(&encoded)?)
}

fn read_stdin() -> anyhow::Result<String> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    Ok(input)
}

async fn run_stream(
    config: &AppConfig,
    snapshot: &GraphSnapshot,
    url: Option<String>,
) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::from_config(config)?;
    let prepared = dispatcher.prepare(snapshot)?;
    info!(
        tasks = prepared.compiled.order.len(),
        records = prepared.compiled.document.record_count(),
        "Task set ready"
    );

    let endpoint = url.unwrap_or_else(|| config.agent.stream_url.clone());
    let mut session = dispatcher.session(endpoint);

    let rx = dispatcher.events().subscribe();
    let print_handle = tokio::spawn(print_events(rx, |entry| println!("{}", entry)));

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling session...");
        cancel.cancel();
    });

    let result = dispatcher
        .stream(&mut session, &prepared, &WsConnector::new())
        .await;
    // Release the bus so the printer sees Closed even if it lagged past the state change.
    drop(session);
    drop(dispatcher);
    print_handle.await.ok();

    let report = result?;
    eprintln!(
        "\n[session {}: {} entries]",
        report.session_id,
        report.entries.len()
    );
    Ok(())
}

/// Print entries as they arrive; stop once the session reaches Closed or the
/// bus goes away. Returns how many entries were printed.
async fn print_events(
    mut rx: broadcast::Receiver<SessionEvent>,
    mut print: impl FnMut(&LogEntry),
) -> usize {
    let mut printed = 0;
    loop {
        match rx.recv().await {
            Ok(SessionEvent::Message { entry, .. }) => {
                print(&entry);
                printed += 1;
            }
            Ok(SessionEvent::StateChanged { to, .. }) => {
                info!(state = %to, "Session state");
                if to == SessionState::Closed {
                    break;
                }
            }
            Ok(SessionEvent::Error { error, .. }) => error!(error = %error, "Session error"),
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "Printer fell behind, skipped entries are in the session log");
            }
            Err(RecvError::Closed) => break,
        }
    }
    printed
}
