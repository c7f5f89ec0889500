//! Command dispatcher: the only path by which commands reach agents.
//! Whitelist enforcement happens at the string boundary, before any agent
//! contact; accepted requests get a fresh correlation id and a deadline and
//! are tracked in the pending table until exactly one terminal outcome.

use crate::audit::Direction;
use crate::sink::result_record;
use crate::Engine;
use futures_util::future::join_all;
use pncp_core::command::{CommandKey, CommandOutcome};
use pncp_core::wire::{CommandRequest, CommandResult, Message};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch, RwLock};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The command never became a request and nothing was sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("command rejected: {command}: {reason}")]
pub struct CommandRejected {
    pub command: String,
    pub reason: String,
}

pub(crate) struct Pending {
    pub(crate) agent_id: String,
    pub(crate) command: CommandKey,
    pub(crate) deadline: Instant,
    pub(crate) resolver: oneshot::Sender<CommandOutcome>,
}

/// Pending-request table keyed by correlation id. Correlation ids are v4
/// UUIDs, unique for the controller lifetime.
pub(crate) struct Dispatcher {
    pending: RwLock<HashMap<Uuid, Pending>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn insert(
        &self,
        agent_id: &str,
        command: CommandKey,
        deadline: Instant,
    ) -> (Uuid, oneshot::Receiver<CommandOutcome>) {
        let correlation_id = Uuid::new_v4();
        let (resolver, rx) = oneshot::channel();
        self.pending.write().await.insert(
            correlation_id,
            Pending {
                agent_id: agent_id.to_string(),
                command,
                deadline,
                resolver,
            },
        );
        (correlation_id, rx)
    }

    pub(crate) async fn remove(&self, correlation_id: &Uuid) -> Option<Pending> {
        self.pending.write().await.remove(correlation_id)
    }

    pub(crate) async fn reinsert(&self, correlation_id: Uuid, pending: Pending) {
        self.pending.write().await.insert(correlation_id, pending);
    }

    pub(crate) async fn remove_expired(&self, now: Instant) -> Vec<(Uuid, Pending)> {
        let mut table = self.pending.write().await;
        let expired = table
            .iter()
            .filter_map(|(id, entry)| (entry.deadline <= now).then_some(*id))
            .collect::<Vec<_>>();
        expired
            .into_iter()
            .filter_map(|id| table.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    pub(crate) async fn remove_agent(&self, agent_id: &str) -> Vec<(Uuid, Pending)> {
        let mut table = self.pending.write().await;
        let matching = table
            .iter()
            .filter_map(|(id, entry)| (entry.agent_id == agent_id).then_some(*id))
            .collect::<Vec<_>>();
        matching
            .into_iter()
            .filter_map(|id| table.remove(&id).map(|entry| (id, entry)))
            .collect()
    }
}

impl Engine {
    /// String boundary for operator input: parse, reject, or dispatch.
    pub async fn request(
        &self,
        agent_id: &str,
        command: &str,
        args: Vec<String>,
    ) -> Result<CommandOutcome, CommandRejected> {
        let key = self.parse_command(command)?;
        Ok(self.send_command(agent_id, key, args).await)
    }

    /// Parse once, then one independent request per active session.
    pub async fn request_all(
        &self,
        command: &str,
        args: Vec<String>,
    ) -> Result<Vec<(String, CommandOutcome)>, CommandRejected> {
        let key = self.parse_command(command)?;
        Ok(self.broadcast(key, args).await)
    }

    fn parse_command(&self, command: &str) -> Result<CommandKey, CommandRejected> {
        command.parse::<CommandKey>().map_err(|reason| {
            self.audit.append(
                "operator",
                Direction::Local,
                "command_rejected",
                &format!("{command}: {reason}"),
            );
            warn!(event = "command_rejected", command = command, reason = %reason);
            CommandRejected {
                command: command.to_string(),
                reason,
            }
        })
    }

    /// Issue one command and wait for its terminal outcome. The await
    /// resolves at the deadline, never before it.
    pub async fn send_command(
        &self,
        agent_id: &str,
        command: CommandKey,
        args: Vec<String>,
    ) -> CommandOutcome {
        let deadline = Instant::now() + self.config.command_deadline;
        let (correlation_id, mut rx) = self.dispatcher.insert(agent_id, command, deadline).await;
        self.audit.append(
            agent_id,
            Direction::Out,
            "command",
            &format!("{command} correlation={correlation_id}"),
        );

        let message = Message::Command(CommandRequest {
            correlation_id,
            command,
            args,
        });
        if !self.sessions.try_send(agent_id, message).await {
            self.dispatcher.remove(&correlation_id).await;
            self.audit.append(
                agent_id,
                Direction::Local,
                "command_failed",
                &format!("{command} correlation={correlation_id} no active session"),
            );
            warn!(event = "command_undeliverable", agent_id = agent_id, command = %command);
            return CommandOutcome::Failure {
                exit_code: -1,
                output: "agent not connected".to_string(),
            };
        }

        match time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => CommandOutcome::Failure {
                exit_code: -1,
                output: "request abandoned".to_string(),
            },
            Err(_) => {
                // A result racing the deadline may have resolved the entry
                // between the timer firing and this cleanup; honor it.
                if let Ok(outcome) = rx.try_recv() {
                    return outcome;
                }
                if self.dispatcher.remove(&correlation_id).await.is_some() {
                    self.audit.append(
                        agent_id,
                        Direction::Local,
                        "command_timeout",
                        &format!("{command} correlation={correlation_id}"),
                    );
                    info!(event = "command_timeout", agent_id = agent_id, command = %command);
                }
                CommandOutcome::Timeout
            }
        }
    }

    /// One independent request per active session; partial failure is
    /// normal and each agent's outcome stands alone.
    pub async fn broadcast(
        &self,
        command: CommandKey,
        args: Vec<String>,
    ) -> Vec<(String, CommandOutcome)> {
        let agents = self.sessions.list_active().await;
        let requests = agents.into_iter().map(|agent_id| {
            let args = args.clone();
            async move {
                let outcome = self.send_command(&agent_id, command, args).await;
                (agent_id, outcome)
            }
        });
        join_all(requests).await
    }

    /// Match an inbound result to its pending request. Unknown, late, or
    /// wrong-session correlation ids are discarded and logged, never
    /// applied.
    pub(crate) async fn apply_result(&self, session_agent: &str, result: CommandResult) {
        let Some(pending) = self.dispatcher.remove(&result.correlation_id).await else {
            self.audit.append(
                session_agent,
                Direction::In,
                "result_discarded",
                &format!("correlation={} unknown or already resolved", result.correlation_id),
            );
            warn!(
                event = "result_discarded",
                agent_id = session_agent,
                correlation_id = %result.correlation_id
            );
            return;
        };
        if pending.agent_id != session_agent {
            self.dispatcher.reinsert(result.correlation_id, pending).await;
            self.audit.append(
                session_agent,
                Direction::In,
                "result_discarded",
                &format!("correlation={} belongs to another agent", result.correlation_id),
            );
            warn!(
                event = "result_discarded",
                agent_id = session_agent,
                correlation_id = %result.correlation_id
            );
            return;
        }

        let outcome = if result.exit_code == 0 {
            CommandOutcome::Success {
                output: result.output.clone(),
            }
        } else {
            CommandOutcome::Failure {
                exit_code: result.exit_code,
                output: result.output.clone(),
            }
        };
        self.audit.append(
            session_agent,
            Direction::In,
            "result",
            &format!(
                "{} correlation={} status={}",
                pending.command,
                result.correlation_id,
                outcome.status()
            ),
        );
        debug!(
            event = "result_resolved",
            agent_id = session_agent,
            command = %pending.command,
            status = outcome.status()
        );
        self.sink.enqueue(result_record(
            session_agent,
            pending.command.as_str(),
            result.exit_code,
            &result.output,
        ));
        let _ = pending.resolver.send(outcome);
    }

    /// A closing session fails its in-flight requests instead of leaving
    /// them to dangle until the deadline.
    pub(crate) async fn fail_pending_for(&self, agent_id: &str, reason: &str) {
        for (correlation_id, pending) in self.dispatcher.remove_agent(agent_id).await {
            self.audit.append(
                agent_id,
                Direction::Local,
                "command_failed",
                &format!("{} correlation={correlation_id} {reason}", pending.command),
            );
            let _ = pending.resolver.send(CommandOutcome::Failure {
                exit_code: -1,
                output: format!("session closed: {reason}"),
            });
        }
    }

    /// Safety net for requests nobody is awaiting anymore: anything past
    /// its deadline resolves as a timeout.
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let engine = self;
        tokio::spawn(async move {
            let mut ticker = time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_ok() && *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        for (correlation_id, pending) in
                            engine.dispatcher.remove_expired(Instant::now()).await
                        {
                            engine.audit.append(
                                &pending.agent_id,
                                Direction::Local,
                                "command_timeout",
                                &format!("{} correlation={correlation_id} swept", pending.command),
                            );
                            let _ = pending.resolver.send(CommandOutcome::Timeout);
                        }
                    }
                }
            }
        });
    }
}
