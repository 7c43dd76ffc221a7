use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use fleetsync::sync::orchestrator::command_channel;
use fleetsync::sync::SyncCommand;
use fleetsync::{
    Attachment, DrainOutcome, EngineConfig, Method, OperationId, PerformOutcome, PerformRequest,
    SyncEngine,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fleetsync")]
#[command(about = "Offline-first sync engine for the fleet management API", long_about = None)]
struct Cli {
    /// Path to fleetsync.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the offline store
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Server base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Start in offline mode (mutations are queued without a network attempt)
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show connectivity and the pending operation queue
    Status,
    /// Read a collection (falls back to the cache)
    Get { url: String },
    /// Issue a mutation
    Send {
        method: Method,
        url: String,
        /// JSON body
        #[arg(long)]
        body: Option<String>,
        /// File attachment as field=path (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<String>,
    },
    /// Replay pending operations once
    Drain,
    /// Remove a pending operation
    Discard { id: String },
    /// Replace the body of a pending operation and queue it again
    Resubmit {
        id: String,
        #[arg(long)]
        body: String,
    },
    /// Keep syncing in the background until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(url) = cli.base_url {
        config.base_url = url;
    }
    config.validate()?;

    let engine = SyncEngine::builder(config).online(!cli.offline).build()?;

    match cli.command {
        Command::Status => status(&engine)?,
        Command::Get { url } => {
            let outcome = engine.perform(PerformRequest::get(url)).await?;
            print_outcome(&outcome)?;
        }
        Command::Send {
            method,
            url,
            body,
            attachments,
        } => {
            if method == Method::Get {
                bail!("use `get` for reads");
            }
            let mut request = PerformRequest::new(method, url);
            if let Some(body) = body {
                request = request.body(serde_json::from_str(&body).context("invalid --body JSON")?);
            }
            for arg in attachments {
                request = request.attachment(read_attachment(&arg)?);
            }
            let outcome = engine.perform(request).await?;
            print_outcome(&outcome)?;
        }
        Command::Drain => match engine.drain().await {
            DrainOutcome::Completed(summary) => {
                println!("{}", serde_json::to_string_pretty(&summary)?)
            }
            DrainOutcome::AlreadyRunning => println!("A drain is already running"),
            DrainOutcome::Skipped => println!("Offline, nothing attempted"),
        },
        Command::Discard { id } => {
            let op = engine.discard(&OperationId::from(id))?;
            println!("Discarded {} {} ({})", op.method, op.resource_url, op.id);
        }
        Command::Resubmit { id, body } => {
            let body = serde_json::from_str(&body).context("invalid --body JSON")?;
            let op = engine.resubmit(&OperationId::from(id), Some(body))?;
            println!("Resubmitted {} {} ({})", op.method, op.resource_url, op.id);
        }
        Command::Run => run(engine).await?,
    }

    Ok(())
}

fn status(engine: &SyncEngine) -> anyhow::Result<()> {
    let stats = engine.stats()?;
    println!("State:    {}", engine.state());
    println!(
        "Pending:  {} operations, {} bytes ({} syncing, {} failed, {} rejected)",
        stats.count, stats.bytes, stats.syncing, stats.failed, stats.rejected
    );

    for op in engine.pending()? {
        let detail = match (&op.last_status, &op.last_error) {
            (Some(status), Some(error)) => format!(" [{}] {}", status, error),
            (None, Some(error)) => format!(" {}", error),
            _ => String::new(),
        };
        println!(
            "{}  {:<6} {}  {:?}{}",
            op.id,
            op.method.as_str(),
            op.resource_url,
            op.status,
            detail
        );
    }
    Ok(())
}

fn print_outcome(outcome: &PerformOutcome) -> anyhow::Result<()> {
    match outcome {
        PerformOutcome::Fetched { payload, source } => {
            eprintln!("(source: {:?})", source);
            println!("{}", serde_json::to_string_pretty(payload)?);
        }
        PerformOutcome::Applied(response) => {
            eprintln!("(HTTP {})", response.status);
            println!("{}", serde_json::to_string_pretty(&response.body)?);
        }
        PerformOutcome::Queued(ack) => {
            println!("Queued as {} for '{}'", ack.id, ack.collection_key);
        }
    }
    Ok(())
}

fn read_attachment(arg: &str) -> anyhow::Result<Attachment> {
    let (field, path) = arg
        .split_once('=')
        .with_context(|| format!("attachment '{}' must be field=path", arg))?;
    let path = Path::new(path);
    let data = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;

    let mut attachment = Attachment::new(field, data);
    if let Some(name) = path.file_name() {
        attachment = attachment.with_file_name(name.to_string_lossy());
    }
    Ok(attachment)
}

async fn run(engine: SyncEngine) -> anyhow::Result<()> {
    let (commands, rx) = command_channel();
    let orchestrator = engine.orchestrator().clone();

    let (background, background_task) = engine.spawn_background();
    let mut foreground = engine.foreground(background.clone(), "cli");
    foreground.attach()?;

    let probe = orchestrator.spawn_probe(commands.clone(), engine.config().probe_interval());
    let loop_task = tokio::spawn(orchestrator.run(rx));

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Could not print event: {}", e),
            }
        }
    });

    shutdown_signal().await;

    let _ = commands.send(SyncCommand::Shutdown).await;
    probe.abort();
    let _ = background.shutdown();
    let _ = loop_task.await;
    let _ = background_task.await;
    printer.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping sync");
}
