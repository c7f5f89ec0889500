//! Command execution. Each whitelisted key has a fixed effect; arguments
//! from the wire are not spliced into anything the host runs.

use crate::metrics;
use pncp_core::command::CommandKey;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit code reported when a subprocess outlives its window.
pub const TIMEOUT_EXIT_CODE: i32 = -124;

pub async fn run(command: CommandKey) -> (i32, String) {
    match command {
        CommandKey::Uptime => exec("uptime", &[], SUBPROCESS_TIMEOUT).await,
        CommandKey::Hostname => host_name(),
        CommandKey::Disk => disk_summary(),
        CommandKey::Metrics => metrics_json(),
        CommandKey::Lslogs => exec("/usr/bin/ls", &["/var/log"], SUBPROCESS_TIMEOUT).await,
        CommandKey::Network => network_summary(),
    }
}

fn host_name() -> (i32, String) {
    match hostname::get() {
        Ok(name) => (0, name.to_string_lossy().into_owned()),
        Err(err) => (-1, err.to_string()),
    }
}

fn disk_summary() -> (i32, String) {
    match sys_info::disk_info() {
        Ok(disk) => {
            let total = disk.total * 1024;
            let free = disk.free * 1024;
            let used = total.saturating_sub(free);
            let percent = if total == 0 {
                0.0
            } else {
                used as f64 / total as f64 * 100.0
            };
            (
                0,
                format!("total={total} used={used} free={free} percent={percent:.1}"),
            )
        }
        Err(err) => (-1, err.to_string()),
    }
}

fn metrics_json() -> (i32, String) {
    match metrics::collect() {
        Ok(report) => match serde_json::to_string(&report) {
            Ok(rendered) => (0, rendered),
            Err(err) => (-1, err.to_string()),
        },
        Err(err) => (-1, err),
    }
}

fn network_summary() -> (i32, String) {
    let counters = metrics::net_counters();
    if counters.is_empty() {
        return (0, "no interface counters available".to_string());
    }
    let rendered = counters
        .iter()
        .map(|(iface, stats)| {
            format!(
                "{iface}: sent={} recv={}",
                stats.bytes_sent, stats.bytes_recv
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    (0, rendered)
}

async fn exec(program: &str, args: &[&str], window: Duration) -> (i32, String) {
    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();
    match timeout(window, child).await {
        Err(_) => (TIMEOUT_EXIT_CODE, "command timed out".to_string()),
        Ok(Err(err)) => (-1, err.to_string()),
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            (output.status.code().unwrap_or(-1), text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_reports_the_timeout_exit_code() {
        let (exit_code, output) = exec("sleep", &["5"], Duration::from_millis(50)).await;
        assert_eq!(exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(output, "command timed out");
    }

    #[tokio::test]
    async fn exec_surfaces_spawn_failures() {
        let (exit_code, output) =
            exec("/nonexistent/binary", &[], Duration::from_secs(1)).await;
        assert_eq!(exit_code, -1);
        assert!(!output.is_empty());
    }

    #[tokio::test]
    async fn exec_captures_exit_code_and_output() {
        let (exit_code, output) = exec("sh", &["-c", "echo hi; exit 3"], Duration::from_secs(5)).await;
        assert_eq!(exit_code, 3);
        assert_eq!(output.trim(), "hi");
    }

    #[test]
    fn hostname_resolves_on_this_host() {
        let (exit_code, output) = host_name();
        assert_eq!(exit_code, 0);
        assert!(!output.is_empty());
    }
}
