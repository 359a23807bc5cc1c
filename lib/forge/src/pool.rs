use crate::config::{ClientConfig, Distribution};
use crate::error::Status;
use crate::net::connection::{Connection, SocketOpts};
use crate::proto::ascii::AsciiParser;
use crate::proto::udp::Reassembly;
use crate::ring::Ring;
use flint::logging;
use indexmap::IndexSet;
use std::net::{SocketAddr, ToSocketAddrs};

pub const DEFAULT_PORT: u16 = 11211;

/// One backend endpoint as configured: `host:port[:weight]`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerSpec {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub udp: bool,
}

impl ServerSpec {
    pub fn new(host: &str, port: u16) -> ServerSpec {
        ServerSpec {
            host: host.to_owned(),
            port,
            weight: 1,
            udp: false,
        }
    }

    /// Parses `host[:port[:weight]]`.
    pub fn parse(text: &str, udp: bool) -> Result<ServerSpec, Status> {
        let mut parts = text.split(':');
        let host = parts
            .next()
            .filter(|host| !host.is_empty())
            .ok_or(Status::NoServers)?;

        let port = match parts.next() {
            Some(port) => port.parse::<u16>().map_err(|_| Status::NoServers)?,
            None => DEFAULT_PORT,
        };
        let weight = match parts.next() {
            Some(weight) => weight.parse::<u32>().map_err(|_| Status::NoServers)?,
            None => 1,
        };

        Ok(ServerSpec {
            host: host.to_owned(),
            port,
            weight: weight.max(1),
            udp,
        })
    }

    /// Parses a comma-separated server list.
    pub fn parse_list(text: &str, udp: bool) -> Result<Vec<ServerSpec>, Status> {
        text.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| ServerSpec::parse(part, udp))
            .collect()
    }

    /// The identity hashed onto the ring.
    pub fn name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn resolve(&self) -> Result<SocketAddr, Status> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| Status::ConnectionFailure)?
            .next()
            .ok_or(Status::ConnectionFailure)
    }
}

/// One backend with its connection and per-server protocol state.
pub struct Server {
    pub spec: ServerSpec,
    pub conn: Connection,
    pub parser: AsciiParser,
    pub reassembly: Reassembly,
    pub udp_request_id: u16,

    /// Consecutive failures since the last success.
    pub failures: u32,
    /// Unix seconds until which the server is considered dead.
    pub retry_at: u64,
}

impl Server {
    fn new(spec: ServerSpec, addr: SocketAddr, opts: SocketOpts, log: &logging::Logger) -> Server {
        Server {
            conn: Connection::new(addr, spec.udp, opts, log),
            spec,
            parser: AsciiParser::new(),
            reassembly: Reassembly::new(),
            udp_request_id: 0,
            failures: 0,
            retry_at: 0,
        }
    }

    /// Request ids distinguish in-flight UDP requests; wrapping is fine.
    pub fn next_udp_request_id(&mut self) -> u16 {
        self.udp_request_id = self.udp_request_id.wrapping_add(1);
        self.udp_request_id
    }
}

/// The ordered server set with its distribution structure. Treated as
/// immutable once operations are in flight; `add_server` rebuilds the ring.
pub struct Pool {
    servers: Vec<Server>,
    live: IndexSet<usize>,
    ring: Ring,

    distribution: Distribution,
    failure_limit: u32,
    retry_timeout: u64,
    opts: SocketOpts,
    hash_with_prefix_key: bool,
    prefix: Vec<u8>,
    config: ClientConfig,

    log: logging::Logger,
}

impl Pool {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: &ClientConfig,
        specs: Vec<ServerSpec>,
        log: L,
    ) -> Result<Pool, Status> {
        let pool_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        let opts = SocketOpts {
            send_buffer_size: config.send_buffer_size,
            recv_buffer_size: config.recv_buffer_size,
            tcp_nodelay: config.tcp_nodelay,
        };

        let mut pool = Pool {
            servers: Vec::new(),
            live: IndexSet::new(),
            ring: Ring::empty(),
            distribution: config.distribution,
            failure_limit: config.server_failure_limit,
            retry_timeout: config.retry_timeout_secs,
            opts,
            hash_with_prefix_key: config.hash_with_prefix_key,
            prefix: config.prefix.clone().into_bytes(),
            config: config.clone(),
            log: pool_log,
        };

        for spec in specs {
            pool.push_server(spec)?;
        }
        pool.rebuild();

        Ok(pool)
    }

    fn push_server(&mut self, spec: ServerSpec) -> Result<(), Status> {
        let addr = spec.resolve()?;
        let index = self.servers.len();

        logging::debug!(self.log, "adding server";
                        "context" => "add_server",
                        "server" => spec.name(),
                        "weight" => spec.weight);

        self.servers.push(Server::new(spec, addr, self.opts, &self.log));
        self.live.insert(index);
        Ok(())
    }

    /// Appends a server and rebuilds the distribution structure. Only legal
    /// before operations are in flight.
    pub fn add_server(&mut self, spec: ServerSpec) -> Result<(), Status> {
        self.push_server(spec)?;
        self.rebuild();
        Ok(())
    }

    fn rebuild(&mut self) {
        let named: Vec<(String, u32)> = self
            .servers
            .iter()
            .map(|server| (server.spec.name(), server.spec.weight))
            .collect();

        let config = &self.config;
        self.ring = Ring::build(
            &named,
            |bytes| config.hash_bytes(bytes),
            self.distribution == Distribution::ConsistentWeighted,
        );
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    #[inline]
    pub fn server(&self, index: usize) -> &Server {
        &self.servers[index]
    }

    #[inline]
    pub fn server_mut(&mut self, index: usize) -> &mut Server {
        &mut self.servers[index]
    }

    #[inline]
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    fn hash_key(&self, key: &[u8]) -> u32 {
        if self.hash_with_prefix_key && !self.prefix.is_empty() {
            let mut prefixed = Vec::with_capacity(self.prefix.len() + key.len());
            prefixed.extend_from_slice(&self.prefix);
            prefixed.extend_from_slice(key);
            self.config.hash_bytes(&prefixed)
        } else {
            self.config.hash_bytes(key)
        }
    }

    /// Deterministic key-to-server resolution on the unchanged pool.
    pub fn route(&self, key: &[u8]) -> Result<usize, Status> {
        if self.servers.is_empty() {
            return Err(Status::NoServers);
        }

        let hash = self.hash_key(key);
        match self.distribution {
            Distribution::Modula => Ok(hash as usize % self.servers.len()),
            Distribution::Consistent | Distribution::ConsistentWeighted => {
                self.ring.lookup(hash).ok_or(Status::NoServers)
            }
        }
    }

    /// Routing that probes past dead servers, up to one attempt per server.
    pub fn route_live(&self, key: &[u8], now_secs: u64) -> Result<usize, Status> {
        let base = self.route(key)?;
        if !self.is_dead(base, now_secs) {
            return Ok(base);
        }

        let hash = self.hash_key(key);
        for attempt in 1..=self.servers.len() {
            let candidate = match self.distribution {
                Distribution::Modula => (hash as usize + attempt) % self.servers.len(),
                Distribution::Consistent | Distribution::ConsistentWeighted => {
                    match self.ring.lookup_offset(hash, attempt) {
                        Some(candidate) => candidate,
                        None => return Err(Status::NoServers),
                    }
                }
            };

            if !self.is_dead(candidate, now_secs) {
                logging::debug!(self.log, "redistributed key past dead server";
                                "context" => "route",
                                "from" => base,
                                "to" => candidate,
                                "attempt" => attempt);
                return Ok(candidate);
            }
        }

        Err(Status::NoServers)
    }

    /// A server is dead once it crosses the failure limit, until its retry
    /// window opens again. Limit 0 disables dead-marking.
    pub fn is_dead(&self, index: usize, now_secs: u64) -> bool {
        if self.failure_limit == 0 {
            return false;
        }

        let server = &self.servers[index];
        server.failures >= self.failure_limit && now_secs < server.retry_at
    }

    pub fn record_failure(&mut self, index: usize, now_secs: u64) {
        let failure_limit = self.failure_limit;
        let retry_timeout = self.retry_timeout;
        let server = &mut self.servers[index];

        server.failures += 1;
        if failure_limit > 0 && server.failures >= failure_limit {
            server.retry_at = now_secs + retry_timeout;
            self.live.swap_remove(&index);

            logging::warn!(self.log, "server marked dead";
                           "context" => "record_failure",
                           "server" => server.spec.name(),
                           "failures" => server.failures,
                           "retry_at" => server.retry_at);
        }
    }

    pub fn record_success(&mut self, index: usize) {
        let server = &mut self.servers[index];
        server.failures = 0;
        server.retry_at = 0;
        self.live.insert(index);
    }

    /// Live servers in insertion order, for broadcast operations.
    pub fn live_indices(&self) -> Vec<usize> {
        self.live.iter().copied().collect()
    }
}
