use crate::worker::WorkerReport;
use forge::stats::{OpKind, Stats};
use std::fmt::Write as FmtWrite;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Renders the end-of-run summary: final counter values, per-kind latency
/// and the latency percentiles.
pub fn render(stats: &Stats, elapsed: Duration, reports: &[WorkerReport]) -> String {
    let mut out = String::new();
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);

    let completed: u64 = reports.iter().map(|report| report.completed_ops).sum();
    let lost: u64 = reports.iter().map(|report| report.lost_ops).sum();
    let cmd_get = stats.cmd_get.load(Ordering::Relaxed);
    let cmd_set = stats.cmd_set.load(Ordering::Relaxed);

    writeln!(out, "run time: {:.2}s", elapsed.as_secs_f64()).unwrap();
    writeln!(out, "ops: {} ({:.0}/s)", completed, completed as f64 / secs).unwrap();
    writeln!(out, "cmd_get: {}", cmd_get).unwrap();
    writeln!(out, "cmd_set: {}", cmd_set).unwrap();
    writeln!(
        out,
        "get_misses: {}",
        stats.get_misses.load(Ordering::Relaxed)
    )
    .unwrap();
    writeln!(out, "written_bytes: {}", stats.bytes_out.load(Ordering::Relaxed)).unwrap();
    writeln!(out, "read_bytes: {}", stats.bytes_in.load(Ordering::Relaxed)).unwrap();
    writeln!(out, "object_bytes_set: {}", stats.vset.load(Ordering::Relaxed)).unwrap();
    writeln!(out, "object_bytes_get: {}", stats.vget.load(Ordering::Relaxed)).unwrap();
    writeln!(out, "packet_drop: {}", stats.pkt_drop.load(Ordering::Relaxed)).unwrap();
    writeln!(out, "udp_timeout: {}", stats.udp_timeout.load(Ordering::Relaxed)).unwrap();
    writeln!(out, "lost_ops: {}", lost).unwrap();

    for (label, kind) in &[
        ("get", OpKind::Get),
        ("set", OpKind::Set),
        ("incr/decr", OpKind::Delta),
    ] {
        let latency = stats.latency(*kind);
        if latency.count == 0 {
            continue;
        }
        writeln!(
            out,
            "{} latency (us): count {} min {} max {} avg {:.1} stddev {:.1}",
            label, latency.count, latency.min, latency.max, latency.mean, latency.stddev()
        )
        .unwrap();
    }

    writeln!(
        out,
        "latency percentiles (us): p50 {} p90 {} p95 {} p99 {}",
        stats.percentile(0.50),
        stats.percentile(0.90),
        stats.percentile(0.95),
        stats.percentile(0.99)
    )
    .unwrap();

    out
}

/// Writes the rendered summary to the `-F` stats file.
pub fn write_file<P: AsRef<Path>>(path: P, content: &str) -> io::Result<()> {
    fs::write(path, content)
}
