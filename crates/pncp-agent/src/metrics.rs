//! Host telemetry collection. Everything here leans on platform facilities
//! (`sys-info`, `/proc/net/dev`); the report schema itself lives in
//! `pncp_core::wire`.

use pncp_core::wire::{DiskStats, InterfaceCounters, LoadAvg, MemoryStats, MetricsReport};
use std::collections::BTreeMap;

pub fn collect() -> Result<MetricsReport, String> {
    let mem = sys_info::mem_info().map_err(|err| format!("mem_info: {err}"))?;
    let load = sys_info::loadavg().map_err(|err| format!("loadavg: {err}"))?;
    let disk = sys_info::disk_info().map_err(|err| format!("disk_info: {err}"))?;

    let cores = num_cpus::get() as f64;
    let cpu_percent = (load.one / cores) * 100.0;

    // sys-info reports KiB; the wire schema is bytes.
    let mem_total = mem.total * 1024;
    let mem_free = mem.avail * 1024;
    let mem_used = mem_total.saturating_sub(mem_free);
    let swap_total = mem.swap_total * 1024;
    let swap_free = mem.swap_free * 1024;
    let swap_used = swap_total.saturating_sub(swap_free);

    let disk_total = disk.total * 1024;
    let disk_free = disk.free * 1024;
    let disk_used = disk_total.saturating_sub(disk_free);

    Ok(MetricsReport {
        cpu_percent,
        memory: MemoryStats {
            total: mem_total,
            used: mem_used,
            free: mem_free,
            percent: percent_of(mem_used, mem_total),
            swap_total,
            swap_used,
            swap_free,
            swap_percent: percent_of(swap_used, swap_total),
        },
        load_avg: LoadAvg {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        },
        disk: DiskStats {
            total: disk_total,
            used: disk_used,
            free: disk_free,
            percent: percent_of(disk_used, disk_total),
        },
        net: net_counters(),
    })
}

fn percent_of(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

#[cfg(target_os = "linux")]
pub fn net_counters() -> BTreeMap<String, InterfaceCounters> {
    match std::fs::read_to_string("/proc/net/dev") {
        Ok(raw) => parse_net_dev(&raw),
        Err(_) => BTreeMap::new(),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn net_counters() -> BTreeMap<String, InterfaceCounters> {
    BTreeMap::new()
}

/// `/proc/net/dev`: two header lines, then
/// `iface: rx_bytes rx_packets ... (8 cols) tx_bytes ...` per interface.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_net_dev(raw: &str) -> BTreeMap<String, InterfaceCounters> {
    raw.lines()
        .skip(2)
        .filter_map(|line| {
            let (iface, counters) = line.split_once(':')?;
            let fields = counters.split_whitespace().collect::<Vec<_>>();
            let bytes_recv = fields.first()?.parse().ok()?;
            let bytes_sent = fields.get(8)?.parse().ok()?;
            Some((
                iface.trim().to_string(),
                InterfaceCounters {
                    bytes_sent,
                    bytes_recv,
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_net_dev_counters() {
        let raw = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:   40444     472    0    0    0     0          0         0    40444     472    0    0    0     0       0          0
  eth0: 9204518    9913    0    0    0     0          0         0  1230127    6951    0    0    0     0       0          0
";
        let counters = parse_net_dev(raw);
        assert_eq!(counters.len(), 2);
        assert_eq!(counters["eth0"].bytes_recv, 9_204_518);
        assert_eq!(counters["eth0"].bytes_sent, 1_230_127);
        assert_eq!(counters["lo"].bytes_sent, 40_444);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let raw = "header\nheader\nnot a counter line\n";
        assert!(parse_net_dev(raw).is_empty());
    }

    #[test]
    fn percent_handles_zero_totals() {
        assert_eq!(percent_of(10, 0), 0.0);
        assert!((percent_of(1, 4) - 25.0).abs() < f64::EPSILON);
    }
}
