//! CLI entrypoint and subcommand orchestration.

mod config;
mod daemon;
#[cfg(test)]
mod test_support;

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use proto::{CommandEnvelope, CommandId, ResponseMessage, number_value};
use worker::AuditEntry;

#[cfg(not(test))]
use std::sync::Arc;

#[cfg(not(test))]
use config::Config;
#[cfg(not(test))]
use gateway::{GatewayServer, WorkerLink};
#[cfg(not(test))]
use tokio::sync::watch;
#[cfg(not(test))]
use tracing::{info, warn};
#[cfg(not(test))]
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};
#[cfg(not(test))]
use worker::{
    AuditLog, AuditSink, AuditStore, Dispatcher, NoopAudit, ProcessRegistry, StreamingExecutor,
    WorkerServer,
};

/// Top-level command-line arguments for taskgate.
#[derive(Parser)]
#[command(name = "taskgate")]
#[command(about = "Command gateway and process worker", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Also write debug logs to ~/.taskgate/logs/
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker: accept gateway links and execute commands
    Worker {
        /// Override `worker.listen_addr`
        #[arg(long)]
        listen: Option<String>,
    },

    /// Run the WebSocket gateway against a running worker
    Gateway {
        /// Override `gateway.listen_addr`
        #[arg(long)]
        listen: Option<String>,
        /// Override `gateway.worker_addr`
        #[arg(long)]
        worker: Option<String>,
    },

    /// Run worker and gateway together in one process
    Start,

    /// Send a single command to a worker and print the responses
    Run {
        /// Kind of command to send
        #[arg(short = 't', long = "type", value_enum, default_value_t = RunKind::Os)]
        kind: RunKind,

        /// Worker address (defaults to `gateway.worker_addr`)
        #[arg(long)]
        worker: Option<String>,

        /// Explicit command id; for `stop` this is the id to terminate
        #[arg(long)]
        id: Option<String>,

        /// Command line or expression
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        body: Vec<String>,
    },

    /// Print the most recent entries of the audit log
    Audit {
        /// Number of entries to show, newest first
        #[arg(short = 'n', long, default_value_t = 20, value_parser = clap::value_parser!(i64).range(1..))]
        limit: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RunKind {
    Os,
    Math,
    Stop,
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>;

    if cli.debug {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let log_dir = std::path::PathBuf::from(home).join(".taskgate").join("logs");
        std::fs::create_dir_all(&log_dir).ok();
        let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _file_guard = Some(guard);

        let console = fmt::layer().with_target(false).with_filter(console_filter);
        let file = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .with_filter(EnvFilter::new(
                "debug,hyper=info,hyper_util=info,tungstenite=info,sqlx=info",
            ));
        tracing_subscriber::registry()
            .with(console)
            .with(file)
            .init();
    } else {
        _file_guard = None;
        fmt()
            .with_env_filter(console_filter)
            .with_target(false)
            .init();
    }

    if cli.debug {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            command = command_label(&cli.command),
            log_level = %cli.log_level,
            "========== taskgate session start =========="
        );
    }

    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Worker { listen } => {
            if let Some(addr) = listen {
                config.worker.listen_addr = addr;
            }
            cmd_worker(config).await
        }
        Commands::Gateway { listen, worker } => {
            if let Some(addr) = listen {
                config.gateway.listen_addr = addr;
            }
            if let Some(addr) = worker {
                config.gateway.worker_addr = addr;
            }
            cmd_gateway(config).await
        }
        Commands::Start => cmd_start(config).await,
        Commands::Run {
            kind,
            worker,
            id,
            body,
        } => {
            let addr = worker.unwrap_or_else(|| config.gateway.worker_addr.clone());
            let envelope = build_envelope(kind, &body, id)?;
            cmd_run(addr, envelope).await
        }
        Commands::Audit { limit } => cmd_audit(config, limit).await,
    }
}

#[cfg(not(test))]
fn command_label(command: &Commands) -> &'static str {
    match command {
        Commands::Worker { .. } => "worker",
        Commands::Gateway { .. } => "gateway",
        Commands::Start => "start",
        Commands::Run { .. } => "run",
        Commands::Audit { .. } => "audit",
    }
}

/// Worker pieces shared by `worker` and `start`.
#[cfg(not(test))]
struct WorkerRuntime {
    server: WorkerServer,
    audit: Option<Arc<AuditLog>>,
}

#[cfg(not(test))]
impl WorkerRuntime {
    async fn build(config: &Config) -> anyhow::Result<Self> {
        let audit = if config.audit.enabled {
            let log = AuditLog::open(&config.audit.database_url, config.audit.queue_capacity).await?;
            info!(path = %config.audit.database_url, "Audit log opened");
            Some(Arc::new(log))
        } else {
            info!("Audit log disabled");
            None
        };
        let sink: Arc<dyn AuditSink> = match &audit {
            Some(log) => log.clone(),
            None => Arc::new(NoopAudit),
        };

        let executor = StreamingExecutor::new(Arc::new(ProcessRegistry::new()))
            .with_shell(config.worker.shell.clone());
        let dispatcher = Dispatcher::new(executor, sink);
        let server = WorkerServer::bind(config.worker_listen_addr()?, dispatcher).await?;
        Ok(Self { server, audit })
    }

    async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let result = self.server.run(shutdown).await;
        if let Some(audit) = self.audit {
            audit.close().await;
        }
        result?;
        Ok(())
    }
}

#[cfg(not(test))]
async fn cmd_worker(config: Config) -> anyhow::Result<()> {
    let runtime = WorkerRuntime::build(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(runtime.run(shutdown_rx));

    daemon::wait_for_shutdown().await;
    shutdown_tx.send_replace(true);
    task.await??;
    info!("taskgate worker stopped");
    Ok(())
}

#[cfg(not(test))]
async fn cmd_gateway(config: Config) -> anyhow::Result<()> {
    let link = WorkerLink::connect(config.gateway.worker_addr.clone()).await?;
    let listener = tokio::net::TcpListener::bind(config.gateway_listen_addr()?).await?;
    let server = GatewayServer::new(link.clone(), config.gateway.token.clone());

    server
        .serve(listener, async move {
            tokio::select! {
                _ = daemon::wait_for_shutdown() => {}
                _ = link.closed() => warn!("Worker link lost, stopping gateway"),
            }
        })
        .await?;
    info!("taskgate gateway stopped");
    Ok(())
}

/// Starts worker and gateway in-process, linked over loopback TCP.
#[cfg(not(test))]
async fn cmd_start(config: Config) -> anyhow::Result<()> {
    info!("Starting taskgate daemon");

    let runtime = WorkerRuntime::build(&config).await?;
    let worker_addr = runtime.server.local_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_task = tokio::spawn(runtime.run(shutdown_rx.clone()));

    let link = WorkerLink::connect(worker_addr).await?;
    let listener = tokio::net::TcpListener::bind(config.gateway_listen_addr()?).await?;
    let server = GatewayServer::new(link.clone(), config.gateway.token.clone());
    let mut gateway_shutdown = shutdown_rx;
    let gateway_task = tokio::spawn(server.serve(listener, async move {
        let _ = gateway_shutdown.wait_for(|stop| *stop).await;
    }));

    let pid_file = daemon::PidFile::new(daemon::PidFile::default_path());
    pid_file.write().await?;

    tokio::select! {
        _ = daemon::wait_for_shutdown() => {}
        _ = link.closed() => warn!("Worker link lost, shutting down"),
    }
    shutdown_tx.send_replace(true);

    let gateway_result = gateway_task.await;
    let worker_result = worker_task.await;
    pid_file.remove().await;

    gateway_result??;
    worker_result??;
    info!("taskgate stopped");
    Ok(())
}

/// Sends one envelope straight to a worker and prints what comes back.
#[cfg(not(test))]
async fn cmd_run(worker_addr: String, envelope: CommandEnvelope) -> anyhow::Result<()> {
    let link = WorkerLink::connect(worker_addr).await?;
    let mut endpoint = link.open_endpoint()?;
    endpoint.send(&envelope).await?;

    let mut streaming = false;
    let outcome = loop {
        let Some(routed) = endpoint.recv().await else {
            bail!("worker closed the link before the command finished");
        };
        let response = routed.decode_response()?;
        if response == ResponseMessage::StreamStart {
            streaming = true;
        }
        if let Some(line) = format_response(&response) {
            match response {
                ResponseMessage::Error { .. } | ResponseMessage::Status { success: false, .. } => {
                    eprintln!("{line}")
                }
                _ => println!("{line}"),
            }
        }
        if is_terminal(&response, streaming) {
            break response;
        }
    };
    link.close();

    match outcome {
        ResponseMessage::Error { kind, message } => bail!("{kind}: {message}"),
        ResponseMessage::Status { success: false, .. } => bail!("stop failed"),
        _ => Ok(()),
    }
}

/// Prints the audit row count and the newest `limit` rows.
#[cfg(not(test))]
async fn cmd_audit(config: Config, limit: i64) -> anyhow::Result<()> {
    let store = AuditStore::open(&config.audit.database_url).await?;
    let total = store.count().await?;
    let entries = store.recent(limit).await?;
    store.close().await;

    println!("{total} messages in {}", config.audit.database_url);
    for entry in &entries {
        println!("{}", format_audit_entry(entry));
    }
    Ok(())
}

fn format_audit_entry(entry: &AuditEntry) -> String {
    format!(
        "{:>6}  {}  {}",
        entry.id,
        entry.received_at.format("%Y-%m-%d %H:%M:%S%.3f"),
        entry.raw_message
    )
}

fn build_envelope(
    kind: RunKind,
    body: &[String],
    id: Option<String>,
) -> anyhow::Result<CommandEnvelope> {
    let text = body.join(" ");
    let envelope = match kind {
        RunKind::Os | RunKind::Math if text.trim().is_empty() => {
            bail!("a command body is required")
        }
        RunKind::Os => CommandEnvelope::os(text, Vec::new()),
        RunKind::Math => CommandEnvelope::math(text, Vec::new()),
        RunKind::Stop => {
            let target = id.or_else(|| body.first().cloned());
            let Some(target) = target.filter(|t| !t.is_empty()) else {
                bail!("stop needs the command id to terminate");
            };
            return Ok(CommandEnvelope::stop(CommandId::from(target)));
        }
    };
    Ok(match id {
        Some(id) => envelope.with_command_id(CommandId::from(id)),
        None => envelope,
    })
}

/// Text printed for a response; stream markers print nothing.
fn format_response(response: &ResponseMessage) -> Option<String> {
    match response {
        ResponseMessage::StreamStart | ResponseMessage::StreamEnd => None,
        ResponseMessage::Output { line } => Some(line.clone()),
        ResponseMessage::Result { value } => Some(number_value(*value).to_string()),
        ResponseMessage::Status { message, .. } => Some(message.clone()),
        ResponseMessage::Error { kind, message } => Some(format!("error ({kind}): {message}")),
    }
}

/// Whether `response` is the last one a single command produces.
fn is_terminal(response: &ResponseMessage, streaming: bool) -> bool {
    match response {
        ResponseMessage::StreamEnd => true,
        ResponseMessage::StreamStart | ResponseMessage::Output { .. } => false,
        _ => !streaming,
    }
}
