//! Time-series sink client. Session handlers only ever `enqueue`, which is
//! synchronous and never blocks; a dedicated task renders line protocol and
//! delivers it. Sink trouble stays in here: a full queue rejects new
//! records, failed deliveries sit in a bounded retry buffer with oldest
//! records evicted first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pncp_core::wire::MetricUpdate;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BATCH_MAX: usize = 64;
const RETRY_BUFFER_MAX: usize = 4096;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Http(String),
    #[error("sink rejected write: http status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkRecord {
    pub measurement: String,
    pub agent: String,
    pub time: DateTime<Utc>,
    pub fields: Vec<(String, FieldValue)>,
}

/// Command results become one record per resolution, tagged by command name.
pub fn result_record(agent_id: &str, command: &str, exit_code: i32, output: &str) -> SinkRecord {
    SinkRecord {
        measurement: command.to_string(),
        agent: agent_id.to_string(),
        time: Utc::now(),
        fields: vec![
            ("output".to_string(), FieldValue::Text(output.to_string())),
            ("exit_code".to_string(), FieldValue::Integer(i64::from(exit_code))),
        ],
    }
}

/// Periodic telemetry becomes a `metrics` record with numeric fields only.
pub fn metric_record(agent_id: &str, update: &MetricUpdate) -> SinkRecord {
    let report = &update.report;
    SinkRecord {
        measurement: "metrics".to_string(),
        agent: agent_id.to_string(),
        time: DateTime::from_timestamp(update.collected_at, 0).unwrap_or_else(Utc::now),
        fields: vec![
            ("cpu_percent".to_string(), FieldValue::Float(report.cpu_percent)),
            ("memory_percent".to_string(), FieldValue::Float(report.memory.percent)),
            ("swap_percent".to_string(), FieldValue::Float(report.memory.swap_percent)),
            ("load_1".to_string(), FieldValue::Float(report.load_avg.one)),
            ("load_5".to_string(), FieldValue::Float(report.load_avg.five)),
            ("load_15".to_string(), FieldValue::Float(report.load_avg.fifteen)),
            ("disk_percent".to_string(), FieldValue::Float(report.disk.percent)),
        ],
    }
}

/// Connect/disconnect/supersede/stale transitions.
pub fn status_record(agent_id: &str, status: &str) -> SinkRecord {
    SinkRecord {
        measurement: "agent_status".to_string(),
        agent: agent_id.to_string(),
        time: Utc::now(),
        fields: vec![("status".to_string(), FieldValue::Text(status.to_string()))],
    }
}

fn escape_name(value: &str) -> String {
    value.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(value: &str) -> String {
    value.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn escape_text(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn render_line(record: &SinkRecord) -> String {
    let mut line = format!(
        "{},agent={} ",
        escape_name(&record.measurement),
        escape_tag(&record.agent)
    );
    for (idx, (name, value)) in record.fields.iter().enumerate() {
        if idx > 0 {
            line.push(',');
        }
        line.push_str(&escape_name(name));
        line.push('=');
        match value {
            FieldValue::Float(v) => line.push_str(&v.to_string()),
            FieldValue::Integer(v) => line.push_str(&format!("{v}i")),
            FieldValue::Text(v) => line.push_str(&format!("\"{}\"", escape_text(v))),
        }
    }
    line.push(' ');
    line.push_str(
        &record
            .time
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string(),
    );
    line
}

#[async_trait]
pub trait SinkTransport: Send + Sync {
    async fn ensure_database(&self) -> Result<(), SinkError>;
    async fn write_lines(&self, body: String) -> Result<(), SinkError>;
}

/// Line-protocol writes against an InfluxDB 1.x HTTP endpoint.
pub struct InfluxTransport {
    client: reqwest::Client,
    write_url: String,
    query_url: String,
    database: String,
}

impl InfluxTransport {
    pub fn new(base_url: &str, database: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            client: reqwest::Client::new(),
            write_url: format!("{base}/write?db={database}&precision=ns"),
            query_url: format!("{base}/query"),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl SinkTransport for InfluxTransport {
    async fn ensure_database(&self) -> Result<(), SinkError> {
        let query = format!("CREATE DATABASE \"{}\"", self.database);
        let response = self
            .client
            .post(&self.query_url)
            .form(&[("q", query.as_str())])
            .send()
            .await
            .map_err(|err| SinkError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn write_lines(&self, body: String) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.write_url)
            .body(body)
            .send()
            .await
            .map_err(|err| SinkError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MetricsSink {
    tx: mpsc::Sender<SinkRecord>,
}

impl MetricsSink {
    /// Spawns the delivery task and hands back the enqueue side.
    pub fn start(
        transport: Arc<dyn SinkTransport>,
        capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let task = tokio::spawn(deliver_loop(transport, rx, shutdown));
        (Self { tx }, task)
    }

    /// Never blocks. A full queue means the sink is behind; the new record
    /// is dropped and counted against the sink, not the session.
    pub fn enqueue(&self, record: SinkRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(event = "sink_queue_full", measurement = %record.measurement);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(event = "sink_closed");
            }
        }
    }
}

async fn deliver_loop(
    transport: Arc<dyn SinkTransport>,
    mut rx: mpsc::Receiver<SinkRecord>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut retry: VecDeque<String> = VecDeque::new();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    break;
                }
            }
            received = rx.recv() => {
                let Some(first) = received else { break };
                let mut batch = vec![first];
                while batch.len() < BATCH_MAX {
                    match rx.try_recv() {
                        Ok(record) => batch.push(record),
                        Err(_) => break,
                    }
                }
                for record in &batch {
                    if retry.len() == RETRY_BUFFER_MAX {
                        retry.pop_front();
                        warn!(event = "sink_retry_evicted");
                    }
                    retry.push_back(render_line(record));
                }
                attempt_flush(transport.as_ref(), &mut retry).await;
            }
        }
    }
    // Final drain: whatever is still queued gets one delivery attempt.
    while let Ok(record) = rx.try_recv() {
        if retry.len() == RETRY_BUFFER_MAX {
            retry.pop_front();
        }
        retry.push_back(render_line(&record));
    }
    attempt_flush(transport.as_ref(), &mut retry).await;
    info!(event = "sink_stopped", undelivered = retry.len());
}

async fn attempt_flush(transport: &dyn SinkTransport, retry: &mut VecDeque<String>) {
    if retry.is_empty() {
        return;
    }
    let mut body = retry.iter().cloned().collect::<Vec<_>>().join("\n");
    body.push('\n');
    match transport.write_lines(body).await {
        Ok(()) => {
            debug!(event = "sink_delivered", lines = retry.len());
            retry.clear();
        }
        Err(err) => {
            warn!(event = "sink_write_failed", error = %err, buffered = retry.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingTransport {
        bodies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SinkTransport for RecordingTransport {
        async fn ensure_database(&self) -> Result<(), SinkError> {
            Ok(())
        }

        async fn write_lines(&self, body: String) -> Result<(), SinkError> {
            self.bodies.lock().unwrap().push(body);
            Ok(())
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl SinkTransport for FailingTransport {
        async fn ensure_database(&self) -> Result<(), SinkError> {
            Err(SinkError::Http("unreachable".to_string()))
        }

        async fn write_lines(&self, _body: String) -> Result<(), SinkError> {
            Err(SinkError::Http("unreachable".to_string()))
        }
    }

    #[test]
    fn line_protocol_escapes_tags_and_text_fields() {
        let record = SinkRecord {
            measurement: "agent status".to_string(),
            agent: "pi 1,rack=a".to_string(),
            time: DateTime::from_timestamp(1_700_000_000, 0).expect("ts"),
            fields: vec![
                ("output".to_string(), FieldValue::Text("say \"hi\"".to_string())),
                ("exit_code".to_string(), FieldValue::Integer(0)),
                ("load".to_string(), FieldValue::Float(0.5)),
            ],
        };
        assert_eq!(
            render_line(&record),
            "agent\\ status,agent=pi\\ 1\\,rack\\=a output=\"say \\\"hi\\\"\",exit_code=0i,load=0.5 1700000000000000000"
        );
    }

    #[tokio::test]
    async fn records_are_delivered_as_line_batches() {
        let transport = Arc::new(RecordingTransport {
            bodies: Mutex::new(Vec::new()),
        });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (sink, task) = MetricsSink::start(transport.clone(), 16, shutdown_rx);

        sink.enqueue(result_record("pi-1", "uptime", 0, "up 3 days"));
        sink.enqueue(status_record("pi-1", "connected"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(sink);
        task.await.expect("delivery task");

        let bodies = transport.bodies.lock().unwrap().join("");
        assert!(bodies.contains("uptime,agent=pi-1"));
        assert!(bodies.contains("agent_status,agent=pi-1"));
        assert!(bodies.contains("\"connected\""));
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let transport = Arc::new(FailingTransport);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        // Capacity 1 and a transport that never succeeds: the queue jams
        // almost immediately, and every enqueue must still return.
        let (sink, task) = MetricsSink::start(transport, 1, shutdown_rx);
        for i in 0..100 {
            sink.enqueue(result_record("pi-1", "uptime", 0, &format!("row {i}")));
        }
        drop(sink);
        task.await.expect("delivery task");
    }

    #[tokio::test]
    async fn failed_deliveries_are_retried_on_the_next_batch() {
        struct FlakyTransport {
            calls: Mutex<u32>,
            bodies: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl SinkTransport for FlakyTransport {
            async fn ensure_database(&self) -> Result<(), SinkError> {
                Ok(())
            }

            async fn write_lines(&self, body: String) -> Result<(), SinkError> {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                if *calls == 1 {
                    return Err(SinkError::Status(503));
                }
                self.bodies.lock().unwrap().push(body);
                Ok(())
            }
        }

        let transport = Arc::new(FlakyTransport {
            calls: Mutex::new(0),
            bodies: Mutex::new(Vec::new()),
        });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (sink, task) = MetricsSink::start(transport.clone(), 16, shutdown_rx);

        sink.enqueue(result_record("pi-1", "uptime", 0, "first"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        sink.enqueue(result_record("pi-1", "uptime", 0, "second"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(sink);
        task.await.expect("delivery task");

        let bodies = transport.bodies.lock().unwrap().join("");
        // The failed first record rides along with the later batch.
        assert!(bodies.contains("first"));
        assert!(bodies.contains("second"));
    }
}
