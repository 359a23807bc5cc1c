use crate::hash::{HashFn, HashKind};
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

/// Longest accepted key prefix, in bytes.
pub const MAX_PREFIX_LEN: usize = 128;

pub const DEFAULT_CONNECT_TIMEOUT_MILLIS: u64 = 4_000;
pub const DEFAULT_POLL_TIMEOUT_MILLIS: u64 = 1_000;
pub const DEFAULT_RETRY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_UDP_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Wire protocol selector.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Ascii,
    Binary,
}

/// Key distribution policy across the server list.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    Modula,
    Consistent,
    ConsistentWeighted,
}

/// Behavior and tuning knobs for a client handle. Deserializable so benchmark
/// config files can carry a `[client]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub protocol: Protocol,
    pub distribution: Distribution,
    pub hash: HashKind,
    #[serde(skip)]
    pub custom_hash: Option<HashFn>,

    /// Logical prefix prepended to every key on the wire. At most
    /// `MAX_PREFIX_LEN` bytes.
    pub prefix: String,
    pub hash_with_prefix_key: bool,

    pub verify_key: bool,
    pub no_reply: bool,
    pub tcp_nodelay: bool,
    pub buffer_requests: bool,
    pub support_cas: bool,

    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,

    pub connect_timeout_millis: u64,
    pub poll_timeout_millis: u64,
    /// Seconds a server stays dead after crossing the failure limit, and the
    /// linear reconnect backoff unit.
    pub retry_timeout_secs: u64,
    pub udp_request_timeout_secs: u64,
    /// Consecutive failures before a server is marked dead. 0 disables
    /// dead-marking entirely.
    pub server_failure_limit: u32,

    /// Opaque per-instance credential, reserved for authentication.
    #[serde(skip)]
    pub credential: Vec<u8>,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            protocol: Protocol::Ascii,
            distribution: Distribution::Modula,
            hash: HashKind::OneAtATime,
            custom_hash: None,
            prefix: String::new(),
            hash_with_prefix_key: false,
            verify_key: false,
            no_reply: false,
            tcp_nodelay: false,
            buffer_requests: false,
            support_cas: false,
            send_buffer_size: None,
            recv_buffer_size: None,
            connect_timeout_millis: DEFAULT_CONNECT_TIMEOUT_MILLIS,
            poll_timeout_millis: DEFAULT_POLL_TIMEOUT_MILLIS,
            retry_timeout_secs: DEFAULT_RETRY_TIMEOUT_SECS,
            udp_request_timeout_secs: DEFAULT_UDP_REQUEST_TIMEOUT_SECS,
            server_failure_limit: 0,
            credential: Vec::new(),
        }
    }
}

impl ClientConfig {
    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis)
    }

    #[inline]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_millis)
    }

    /// Hashes `bytes` through the configured capability, preferring an
    /// injected custom function.
    #[inline]
    pub fn hash_bytes(&self, bytes: &[u8]) -> u32 {
        match self.custom_hash {
            Some(func) => func(bytes),
            None => self.hash.hash(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();

        assert_eq!(config.protocol, Protocol::Ascii);
        assert_eq!(config.distribution, Distribution::Modula);
        assert_eq!(config.connect_timeout(), Duration::from_secs(4));
        assert_eq!(config.retry_timeout_secs, 30);
        assert_eq!(config.server_failure_limit, 0);
    }

    #[test]
    fn test_custom_hash_takes_precedence() {
        fn fixed(_: &[u8]) -> u32 {
            7
        }

        let mut config = ClientConfig::default();
        assert_ne!(config.hash_bytes(b"key"), 7);

        config.custom_hash = Some(fixed);
        assert_eq!(config.hash_bytes(b"key"), 7);
    }

    #[test]
    fn test_deserialize_section() {
        let config: ClientConfig = serdeconv::from_toml_str(
            r#"
protocol = "binary"
distribution = "consistent"
hash = "fnv1a_32"
verify_key = true
"#,
        )
        .unwrap();

        assert_eq!(config.protocol, Protocol::Binary);
        assert_eq!(config.distribution, Distribution::Consistent);
        assert_eq!(config.hash, HashKind::Fnv1a_32);
        assert!(config.verify_key);
        assert_eq!(config.retry_timeout_secs, DEFAULT_RETRY_TIMEOUT_SECS);
    }
}
