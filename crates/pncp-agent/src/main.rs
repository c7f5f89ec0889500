mod metrics;
mod runner;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use pncp_core::auth;
use pncp_core::wire::{
    encode_frame, AuthResponse, CommandResult, FrameReader, Heartbeat, Message, MetricUpdate,
    DEFAULT_MAX_FRAME_BYTES,
};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pncp-agent")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:50023")]
    controller: String,
    /// Defaults to the host name.
    #[arg(long, default_value = "")]
    agent_id: String,
    /// File containing the shared secret; PNCP_SHARED_SECRET overrides.
    #[arg(long, default_value = "")]
    secret_file: String,
    #[arg(long, default_value_t = 10)]
    heartbeat_interval: u64,
    #[arg(long, default_value_t = 30)]
    metrics_interval: u64,
    #[arg(long, default_value_t = 5)]
    reconnect_interval: u64,
}

struct AgentConfig {
    controller: String,
    agent_id: String,
    secret: Vec<u8>,
    heartbeat_interval: Duration,
    metrics_interval: Duration,
}

enum SessionEnd {
    Disconnected,
    AuthRejected,
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let secret = load_secret(&args.secret_file)?;
    let agent_id = if args.agent_id.trim().is_empty() {
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_default()
    } else {
        args.agent_id.trim().to_string()
    };
    auth::validate_agent_id(&agent_id).map_err(|err| anyhow::anyhow!("agent id: {err}"))?;

    let config = AgentConfig {
        controller: args.controller.clone(),
        agent_id,
        secret,
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        metrics_interval: Duration::from_secs(args.metrics_interval),
    };
    let reconnect = Duration::from_secs(args.reconnect_interval);

    info!(event = "agent_start", agent_id = %config.agent_id, controller = %config.controller);
    loop {
        match run_session(&config).await {
            Ok(SessionEnd::AuthRejected) => {
                error!(event = "auth_rejected", controller = %config.controller);
                bail!("controller rejected authentication");
            }
            Ok(SessionEnd::Disconnected) => {
                info!(event = "controller_disconnected");
            }
            Err(err) => {
                warn!(event = "session_error", error = %err);
            }
        }
        info!(event = "reconnecting", delay_secs = reconnect.as_secs());
        sleep(reconnect).await;
    }
}

async fn run_session(config: &AgentConfig) -> anyhow::Result<SessionEnd> {
    let stream = TcpStream::connect(&config.controller)
        .await
        .with_context(|| format!("connecting to {}", config.controller))?;
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = write_half;

    let challenge = match timeout(Duration::from_secs(10), reader.next()).await {
        Err(_) => bail!("timed out waiting for auth challenge"),
        Ok(Err(err)) => return Err(err.into()),
        Ok(Ok(None)) => return Ok(SessionEnd::Disconnected),
        Ok(Ok(Some(Message::AuthChallenge(challenge)))) => challenge,
        Ok(Ok(Some(other))) => bail!("expected auth_challenge, got {}", other.tag()),
    };

    let mac = auth::sign(
        &config.secret,
        &challenge.nonce,
        challenge.issued_at,
        &config.agent_id,
    );
    send_frame(
        &mut writer,
        &Message::AuthResponse(AuthResponse {
            agent_id: config.agent_id.clone(),
            mac,
        }),
    )
    .await?;
    info!(event = "auth_sent", agent_id = %config.agent_id);

    let mut heartbeat = interval(config.heartbeat_interval);
    let mut metrics_tick = interval(config.metrics_interval);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let beat = Message::Heartbeat(Heartbeat {
                    agent_id: config.agent_id.clone(),
                    sent_at: Utc::now().timestamp(),
                });
                send_frame(&mut writer, &beat).await?;
                debug!(event = "heartbeat_sent");
            }
            _ = metrics_tick.tick() => {
                match metrics::collect() {
                    Ok(report) => {
                        let update = Message::Metric(MetricUpdate {
                            agent_id: config.agent_id.clone(),
                            collected_at: Utc::now().timestamp(),
                            report,
                        });
                        send_frame(&mut writer, &update).await?;
                        debug!(event = "metrics_sent");
                    }
                    Err(err) => {
                        warn!(event = "metrics_unavailable", error = %err);
                    }
                }
            }
            next = reader.next() => {
                match next {
                    Ok(Some(Message::Command(request))) => {
                        info!(
                            event = "command_received",
                            command = %request.command,
                            correlation_id = %request.correlation_id
                        );
                        let (exit_code, output) = runner::run(request.command).await;
                        send_frame(
                            &mut writer,
                            &Message::Result(CommandResult {
                                correlation_id: request.correlation_id,
                                exit_code,
                                output,
                            }),
                        )
                        .await?;
                    }
                    Ok(Some(Message::Error(notice))) => {
                        if notice.code == "auth_failed" {
                            return Ok(SessionEnd::AuthRejected);
                        }
                        warn!(event = "controller_error", code = %notice.code, message = %notice.message);
                    }
                    Ok(Some(other)) => {
                        warn!(event = "unexpected_message", tag = other.tag());
                    }
                    Ok(None) => return Ok(SessionEnd::Disconnected),
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
}

async fn send_frame(writer: &mut OwnedWriteHalf, message: &Message) -> anyhow::Result<()> {
    let frame = encode_frame(message, DEFAULT_MAX_FRAME_BYTES)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
