pub mod audit;
pub mod dispatch;
pub mod session;
pub mod sink;

use crate::audit::AuditLog;
use crate::dispatch::Dispatcher;
use crate::session::Sessions;
use crate::sink::MetricsSink;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub shared_secret: Vec<u8>,
    /// Max tolerated skew between challenge timestamp and verification time.
    pub replay_window_secs: i64,
    pub auth_timeout: Duration,
    pub liveness_timeout: Duration,
    pub command_deadline: Duration,
    /// When set, only these agent ids may authenticate.
    pub roster: Option<HashSet<String>>,
    pub session_queue_capacity: usize,
    pub write_timeout: Duration,
}

impl ControllerConfig {
    pub fn new(shared_secret: Vec<u8>) -> Self {
        Self {
            shared_secret,
            replay_window_secs: 60,
            auth_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(30),
            command_deadline: Duration::from_secs(10),
            roster: None,
            session_queue_capacity: 64,
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// The one shared registry: session table, pending-command table, audit log
/// and sink handle, constructed once at startup and passed by `Arc` into
/// every task that needs it.
pub struct Engine {
    pub(crate) config: ControllerConfig,
    conn_counter: AtomicU64,
    pub(crate) sessions: Sessions,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) audit: AuditLog,
    pub(crate) sink: MetricsSink,
}

impl Engine {
    pub fn new(config: ControllerConfig, audit: AuditLog, sink: MetricsSink) -> Arc<Self> {
        Arc::new(Self {
            config,
            conn_counter: AtomicU64::new(0),
            sessions: Sessions::new(),
            dispatcher: Dispatcher::new(),
            audit,
            sink,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub(crate) fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    /// Snapshot of currently active agent ids; may be stale by the time it
    /// is used.
    pub async fn active_agents(&self) -> Vec<String> {
        self.sessions.list_active().await
    }
}
