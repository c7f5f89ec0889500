//! Append-only protocol audit log: one JSON line per event, totally ordered
//! by a monotonic sequence number. Write-only from the engine's point of
//! view — nothing in the controller reads it back.

use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Message received from an agent.
    In,
    /// Message sent to an agent.
    Out,
    /// Lifecycle event originating inside the controller.
    Local,
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    seq: u64,
    ts: String,
    session: &'a str,
    direction: Direction,
    tag: &'a str,
    summary: &'a str,
}

struct Inner {
    writer: BufWriter<File>,
    seq: u64,
}

pub struct AuditLog {
    inner: Mutex<Inner>,
}

impl AuditLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                writer: BufWriter::new(file),
                seq: 0,
            }),
        })
    }

    /// Sequence assignment and the write happen under one lock, so records
    /// from concurrent sessions never interleave and seq order matches
    /// write order. Failures degrade to a warning; the log is advisory.
    pub fn append(&self, session: &str, direction: Direction, tag: &str, summary: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        let record = AuditRecord {
            seq: inner.seq,
            ts: Utc::now().to_rfc3339(),
            session,
            direction,
            tag,
            summary,
        };
        let line = match serde_json::to_string(&record) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "audit_encode_error", error = %err);
                return;
            }
        };
        if writeln!(inner.writer, "{line}").and_then(|()| inner.writer.flush()).is_err() {
            warn!(event = "audit_write_error", tag = tag);
        }
    }

    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.writer.flush().is_err() {
            warn!(event = "audit_flush_error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn seq_is_strictly_increasing_in_write_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).expect("open");
        log.append("conn-1", Direction::Local, "connection_accepted", "127.0.0.1:9");
        log.append("pi-1", Direction::Out, "command", "uptime");
        log.append("pi-1", Direction::In, "result", "success");
        log.flush();

        let contents = std::fs::read_to_string(&path).expect("read");
        let seqs = contents
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).expect("json line");
                value["seq"].as_u64().expect("seq")
            })
            .collect::<Vec<_>>();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn concurrent_appends_never_interleave_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let log = Arc::new(AuditLog::open(&path).expect("open"));

        let handles = (0..8)
            .map(|worker| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let session = format!("pi-{worker}");
                        log.append(&session, Direction::In, "heartbeat", &format!("beat {i}"));
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join");
        }
        log.flush();

        let contents = std::fs::read_to_string(&path).expect("read");
        let mut previous = 0;
        let mut count = 0;
        for line in contents.lines() {
            let value: serde_json::Value = serde_json::from_str(line).expect("intact record");
            let seq = value["seq"].as_u64().expect("seq");
            assert!(seq > previous);
            previous = seq;
            count += 1;
        }
        assert_eq!(count, 8 * 50);
    }
}
