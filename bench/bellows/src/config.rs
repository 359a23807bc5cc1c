use forge::config::{ClientConfig, Protocol};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// Workload synthesis knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Workload {
    /// Fraction of operations that are stores.
    pub set_ratio: f64,
    /// Number of distinct keys cycled through.
    pub window_size: u64,
    /// Fixed value size in bytes.
    pub value_size: usize,
    /// Keys fetched per retrieval; above 1 each get becomes a multi-get.
    pub mget_batch: usize,
}

impl Default for Workload {
    fn default() -> Workload {
        Workload {
            set_ratio: 0.1,
            window_size: 10_000,
            value_size: 1_024,
            mget_batch: 1,
        }
    }
}

/// Full benchmark settings: load-generator shape plus the client behaviors
/// carried by every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub threads: usize,
    pub concurrency: usize,
    /// Total operations across the whole run; 0 means unbounded.
    pub exec_num: u64,
    /// Wall-clock run time in seconds; 0 means unbounded.
    pub run_time: u64,
    /// Target transactions per second across all connections; 0 disables
    /// pacing.
    pub expected_tps: u64,
    pub udp: bool,
    pub reconnect: bool,
    pub verbose: bool,

    pub workload: Workload,
    pub client: ClientConfig,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            threads: 1,
            concurrency: 16,
            exec_num: 10_000,
            run_time: 0,
            expected_tps: 0,
            udp: false,
            reconnect: true,
            verbose: false,
            workload: Workload::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Settings {
        serdeconv::from_toml_file(path).expect("Error loading benchmark configuration file")
    }

    pub fn binary_protocol(&self) -> bool {
        self.client.protocol == Protocol::Binary
    }

    /// Connections per worker thread. The remainder lands on the first
    /// workers so the sum always equals the configured concurrency.
    pub fn conns_for_worker(&self, worker: usize) -> usize {
        let base = self.concurrency / self.threads;
        let extra = self.concurrency % self.threads;
        base + usize::from(worker < extra)
    }

    /// Per-connection transactions-per-second quota.
    pub fn tps_per_conn(&self) -> u64 {
        if self.expected_tps == 0 || self.concurrency == 0 {
            0
        } else {
            (self.expected_tps / self.concurrency as u64).max(1)
        }
    }

    /// Per-connection exec budget; 0 means unbounded.
    pub fn execs_per_conn(&self) -> u64 {
        if self.exec_num == 0 || self.concurrency == 0 {
            0
        } else {
            (self.exec_num / self.concurrency as u64).max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_split_sums_to_concurrency() {
        let mut settings = Settings::default();
        settings.threads = 3;
        settings.concurrency = 16;

        let total: usize = (0..settings.threads)
            .map(|worker| settings.conns_for_worker(worker))
            .sum();
        assert_eq!(total, 16);

        // The split is as even as possible.
        assert_eq!(settings.conns_for_worker(0), 6);
        assert_eq!(settings.conns_for_worker(1), 5);
        assert_eq!(settings.conns_for_worker(2), 5);
    }

    #[test]
    fn test_budget_division() {
        let mut settings = Settings::default();
        settings.concurrency = 8;
        settings.exec_num = 1000;
        settings.expected_tps = 4000;

        assert_eq!(settings.execs_per_conn(), 125);
        assert_eq!(settings.tps_per_conn(), 500);

        settings.exec_num = 0;
        assert_eq!(settings.execs_per_conn(), 0);
        settings.expected_tps = 0;
        assert_eq!(settings.tps_per_conn(), 0);
    }

    #[test]
    fn test_toml_roundtrip() {
        let settings: Settings = serdeconv::from_toml_str(
            r#"
threads = 4
concurrency = 64
exec_num = 500000

[workload]
set_ratio = 0.25
value_size = 64

[client]
protocol = "binary"
"#,
        )
        .unwrap();

        assert_eq!(settings.threads, 4);
        assert_eq!(settings.concurrency, 64);
        assert!((settings.workload.set_ratio - 0.25).abs() < 1e-9);
        assert_eq!(settings.workload.value_size, 64);
        assert!(settings.binary_protocol());
        // Untouched sections keep their defaults.
        assert_eq!(settings.workload.window_size, 10_000);
        assert!(settings.reconnect);
    }
}
