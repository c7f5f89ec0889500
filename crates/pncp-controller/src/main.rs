use anyhow::{bail, Context};
use clap::Parser;
use pncp_controller::audit::AuditLog;
use pncp_controller::sink::{InfluxTransport, MetricsSink, SinkTransport};
use pncp_controller::{ControllerConfig, Engine};
use pncp_core::command::CommandOutcome;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pncp-controller")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:50023")]
    listen: String,
    /// File containing the shared secret; PNCP_SHARED_SECRET overrides.
    #[arg(long, default_value = "")]
    secret_file: String,
    /// Replay tolerance in seconds for the auth handshake.
    #[arg(long, default_value_t = 60)]
    replay_window: i64,
    #[arg(long, default_value_t = 10)]
    auth_timeout: u64,
    #[arg(long, default_value_t = 30)]
    liveness_timeout: u64,
    #[arg(long, default_value_t = 10)]
    command_deadline: u64,
    /// Comma-separated roster of permitted agent ids; empty allows any.
    #[arg(long, default_value = "")]
    agents: String,
    #[arg(long, default_value = "http://127.0.0.1:8086")]
    influx_url: String,
    #[arg(long, default_value = "pimetrics")]
    influx_db: String,
    #[arg(long, default_value = "pncp-audit.jsonl")]
    audit_log: PathBuf,
    #[arg(long, default_value_t = 64)]
    session_queue: usize,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 1024)]
    sink_queue: usize,
}

fn load_secret(secret_file: &str) -> anyhow::Result<Vec<u8>> {
    if let Ok(value) = std::env::var("PNCP_SHARED_SECRET") {
        if !value.trim().is_empty() {
            return Ok(value.trim().as_bytes().to_vec());
        }
    }
    if !secret_file.trim().is_empty() {
        let raw = std::fs::read_to_string(Path::new(secret_file))
            .with_context(|| format!("reading secret file {secret_file}"))?;
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.as_bytes().to_vec());
        }
    }
    bail!("no shared secret: set PNCP_SHARED_SECRET or --secret-file");
}

fn parse_roster(agents: &str) -> Option<HashSet<String>> {
    let roster = agents
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect::<HashSet<_>>();
    if roster.is_empty() {
        None
    } else {
        Some(roster)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let listen: SocketAddr = args
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", args.listen))?;
    let secret = load_secret(&args.secret_file)?;

    let mut config = ControllerConfig::new(secret);
    config.replay_window_secs = args.replay_window;
    config.auth_timeout = Duration::from_secs(args.auth_timeout);
    config.liveness_timeout = Duration::from_secs(args.liveness_timeout);
    config.command_deadline = Duration::from_secs(args.command_deadline);
    config.roster = parse_roster(&args.agents);
    config.session_queue_capacity = args.session_queue;
    config.write_timeout = Duration::from_secs(args.write_timeout);

    let audit = AuditLog::open(&args.audit_log)
        .with_context(|| format!("opening audit log {}", args.audit_log.display()))?;

    let transport: Arc<dyn SinkTransport> =
        Arc::new(InfluxTransport::new(&args.influx_url, &args.influx_db));
    if let Err(err) = transport.ensure_database().await {
        warn!(event = "sink_bootstrap_failed", error = %err);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sink, sink_task) = MetricsSink::start(transport, args.sink_queue, shutdown_rx.clone());

    let engine = Engine::new(config, audit, sink);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(event = "controller_start", listen = %listen, influx_db = %args.influx_db);

    let serve_task = tokio::spawn(engine.clone().serve(listener, shutdown_rx.clone()));
    engine.clone().spawn_stale_reaper(shutdown_rx.clone());
    engine.clone().spawn_sweeper(shutdown_rx.clone());

    operator_loop(&engine).await;

    info!(event = "controller_shutdown");
    let _ = shutdown_tx.send(true);
    engine.shutdown_sessions(Duration::from_secs(3)).await;
    let _ = serve_task.await;
    engine.audit().flush();
    if tokio::time::timeout(Duration::from_secs(5), sink_task)
        .await
        .is_err()
    {
        warn!(event = "sink_drain_timeout");
    }
    info!(event = "controller_stop");
    Ok(())
}

/// Interactive dispatch: a whitelisted key broadcasts to every active
/// session, `<key> <agent_id>` targets one agent, a blank line or EOF (or
/// ctrl-c) shuts the controller down.
async fn operator_loop(engine: &Arc<Engine>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(value)) => value,
                    Ok(None) => break,
                    Err(err) => {
                        error!(event = "stdin_error", error = %err);
                        break;
                    }
                };
                let line = line.trim().to_string();
                if line.is_empty() {
                    break;
                }
                handle_line(engine, &line).await;
            }
        }
    }
}

async fn handle_line(engine: &Arc<Engine>, line: &str) {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let target = parts.next();

    match target {
        Some(agent_id) => match engine.request(agent_id, command, Vec::new()).await {
            Ok(outcome) => print_outcome(agent_id, &outcome),
            Err(rejected) => println!("[-] {rejected}"),
        },
        None => match engine.request_all(command, Vec::new()).await {
            Ok(outcomes) if outcomes.is_empty() => {
                println!("[*] no active agents");
            }
            Ok(outcomes) => {
                for (agent_id, outcome) in &outcomes {
                    print_outcome(agent_id, outcome);
                }
            }
            Err(rejected) => println!("[-] {rejected}"),
        },
    }
}

fn print_outcome(agent_id: &str, outcome: &CommandOutcome) {
    match outcome {
        CommandOutcome::Success { output } => {
            println!("[{agent_id}] ok\n{output}");
        }
        CommandOutcome::Failure { exit_code, output } => {
            println!("[{agent_id}] failed rc={exit_code}\n{output}");
        }
        CommandOutcome::Timeout => {
            println!("[{agent_id}] timed out");
        }
    }
}
