use crate::config::{ClientConfig, Protocol};
use crate::error::{FailureKind, Status, TransportError};
use crate::net::connection::ConnState;
use crate::pool::{Pool, ServerSpec};
use crate::proto;
use crate::proto::ascii::{self, AsciiEvent, StorageVerb};
use crate::proto::binary::{self, Extras, Opcode, Request};
use crate::proto::udp;
use crate::stats::{OpKind, Stats};
use byteorder::{BigEndian, ByteOrder};
use flint::logging;
use flint::time::timestamp_secs;
use hashbrown::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One retrieved item. The configured prefix is stripped from the reported
/// key.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Fetched {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas: Option<u64>,
}

/// Per-server stats as returned by the `stats` broadcast.
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub server: String,
    pub entries: HashMap<String, String>,
}

struct FetchState {
    servers: Vec<usize>,
    current: usize,
    requested: u64,
    returned: u64,
}

/// The client handle. Owns the server pool, a poll to drive its sockets and
/// the per-instance statistics block. Operations are serialized per
/// connection; only a multi-get pipelines requests, and only within a single
/// connection.
pub struct Client {
    config: ClientConfig,
    prefix: Vec<u8>,
    pool: Pool,
    poll: mio::Poll,
    events: mio::Events,
    stats: Arc<Stats>,
    fetch: Option<FetchState>,
    last_error: Option<Status>,
    opaque: u32,
    log: logging::Logger,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(config: ClientConfig, specs: Vec<ServerSpec>) -> Result<Client, Status> {
        Client::with_logger(config, specs, None)
    }

    pub fn with_logger<'a, L: Into<Option<&'a logging::Logger>>>(
        config: ClientConfig,
        specs: Vec<ServerSpec>,
        log: L,
    ) -> Result<Client, Status> {
        let client_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        let prefix = config.prefix.clone().into_bytes();
        if prefix.len() > crate::config::MAX_PREFIX_LEN
            || prefix
                .iter()
                .any(|&byte| byte == 0x00 || byte == b' ' || byte == b'\r' || byte == b'\n')
        {
            return Err(Status::BadKey);
        }

        if config.protocol == Protocol::Binary && specs.iter().any(|spec| spec.udp) {
            return Err(Status::NotSupported);
        }

        let pool = Pool::new(&config, specs, &client_log)?;
        let poll = mio::Poll::new().map_err(|_| Status::ConnectionSocketCreateFailure)?;

        Ok(Client {
            config,
            prefix,
            pool,
            poll,
            events: mio::Events::with_capacity(256),
            stats: Arc::new(Stats::new()),
            fetch: None,
            last_error: None,
            opaque: 0,
            log: client_log,
        })
    }

    /// Builds a client over a `host:port[:weight]` comma-separated list.
    pub fn from_server_list(config: ClientConfig, list: &str, udp: bool) -> Result<Client, Status> {
        let specs = ServerSpec::parse_list(list, udp)?;
        Client::new(config, specs)
    }

    #[inline]
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Shares an external statistics block, replacing the private one.
    pub fn set_stats(&mut self, stats: Arc<Stats>) {
        self.stats = stats;
    }

    #[inline]
    pub fn last_error(&self) -> Option<&Status> {
        self.last_error.as_ref()
    }

    #[inline]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Deterministic key-to-server resolution on the unchanged pool.
    #[inline]
    pub fn route(&self, key: &[u8]) -> Result<usize, Status> {
        self.pool.route(key)
    }

    // ---- storage ----------------------------------------------------------

    pub fn set(&mut self, key: &[u8], value: &[u8], flags: u32, expiration: u32) -> Status {
        self.store(StorageVerb::Set, key, key, value, flags, expiration, 0)
    }

    pub fn set_by_key(
        &mut self,
        master_key: &[u8],
        key: &[u8],
        value: &[u8],
        flags: u32,
        expiration: u32,
    ) -> Status {
        self.store(StorageVerb::Set, master_key, key, value, flags, expiration, 0)
    }

    pub fn add(&mut self, key: &[u8], value: &[u8], flags: u32, expiration: u32) -> Status {
        self.store(StorageVerb::Add, key, key, value, flags, expiration, 0)
    }

    pub fn replace(&mut self, key: &[u8], value: &[u8], flags: u32, expiration: u32) -> Status {
        self.store(StorageVerb::Replace, key, key, value, flags, expiration, 0)
    }

    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Status {
        self.store(StorageVerb::Append, key, key, value, 0, 0, 0)
    }

    pub fn prepend(&mut self, key: &[u8], value: &[u8]) -> Status {
        self.store(StorageVerb::Prepend, key, key, value, 0, 0, 0)
    }

    /// Conditional set; `Exists` when the token no longer matches.
    pub fn cas(
        &mut self,
        key: &[u8],
        value: &[u8],
        flags: u32,
        expiration: u32,
        cas: u64,
    ) -> Status {
        self.store(StorageVerb::Cas, key, key, value, flags, expiration, cas)
    }

    #[allow(clippy::too_many_arguments)]
    fn store(
        &mut self,
        verb: StorageVerb,
        master_key: &[u8],
        key: &[u8],
        value: &[u8],
        flags: u32,
        expiration: u32,
        cas: u64,
    ) -> Status {
        let started = Instant::now();

        let index = match self.begin_op(master_key, key) {
            Ok(index) => index,
            Err(status) => return status,
        };

        let noreply = self.config.no_reply;
        let encode = {
            let prefix = self.prefix.clone();
            let opaque = self.next_opaque();
            let protocol = self.config.protocol;
            let server = self.pool.server_mut(index);
            let buffer = server.conn.write_buffer_mut();

            match protocol {
                Protocol::Ascii => ascii::write_storage(
                    buffer,
                    verb,
                    key,
                    &prefix,
                    flags,
                    expiration,
                    value,
                    if verb == StorageVerb::Cas { Some(cas) } else { None },
                    noreply,
                ),
                Protocol::Binary => {
                    let opcode = match verb {
                        StorageVerb::Set | StorageVerb::Cas => Opcode::Set,
                        StorageVerb::Add => Opcode::Add,
                        StorageVerb::Replace => Opcode::Replace,
                        StorageVerb::Append => Opcode::Append,
                        StorageVerb::Prepend => Opcode::Prepend,
                    };
                    let opcode = if noreply { opcode.quiet() } else { opcode };
                    let extras = match verb {
                        StorageVerb::Append | StorageVerb::Prepend => Extras::None,
                        _ => Extras::Storage { flags, expiration },
                    };
                    binary::write_request(
                        buffer,
                        &Request {
                            opcode,
                            key,
                            prefix: &prefix,
                            extras,
                            value,
                            opaque,
                            cas,
                        },
                    )
                }
            }
        };

        if let Err(err) = encode {
            return self.encode_failed(index, err);
        }

        Stats::add(&self.stats.cmd_set, 1);
        Stats::add(&self.stats.vset, value.len() as u64);

        let status = if noreply {
            self.deliver_buffered(index)
        } else {
            self.exchange_simple(index, cas)
        };

        self.stats.record_op(OpKind::Set, elapsed_micros(started));
        status
    }

    /// Flush-or-defer path for `no_reply` requests.
    fn deliver_buffered(&mut self, index: usize) -> Status {
        let buffered = {
            let server = self.pool.server(index);
            self.config.buffer_requests
                && !server.conn.is_udp()
                && server.conn.write_buffer_len() < crate::net::buffer::TCP_COALESCE_CAP
        };

        if buffered {
            return Status::Buffered;
        }

        let deadline = self.op_deadline(index);
        {
            let server = self.pool.server_mut(index);
            if server.conn.state() == ConnState::Idle {
                server.conn.begin_request();
            }
        }
        match self.flush_request(index, deadline) {
            Ok(()) => {
                self.finish_op(index);
                Status::Buffered
            }
            Err(status) => status,
        }
    }

    fn exchange_simple(&mut self, index: usize, cas: u64) -> Status {
        let deadline = self.op_deadline(index);
        self.pool.server_mut(index).conn.begin_request();

        if let Err(status) = self.flush_request(index, deadline) {
            return status;
        }

        match self.config.protocol {
            Protocol::Ascii => match self.next_ascii_event(index, deadline) {
                Ok(event) => {
                    let status = match command_status(&event, cas) {
                        Some(status) => status,
                        None => return self.fail_op(index, FailureKind::Protocol),
                    };
                    self.finish_op(index);
                    status
                }
                Err(status) => status,
            },
            Protocol::Binary => match self.next_binary_response(index, deadline) {
                Ok(response) => {
                    self.finish_op(index);
                    Status::from_binary(response.status, response.cas)
                }
                Err(status) => status,
            },
        }
    }

    // ---- retrieval --------------------------------------------------------

    pub fn get(&mut self, key: &[u8]) -> Result<Fetched, Status> {
        self.get_by_key(key, key)
    }

    /// Routes on `master_key`, retrieves `key`.
    pub fn get_by_key(&mut self, master_key: &[u8], key: &[u8]) -> Result<Fetched, Status> {
        let started = Instant::now();
        let index = self.begin_op(master_key, key)?;

        let encode = {
            let prefix = self.prefix.clone();
            let opaque = self.next_opaque();
            let support_cas = self.config.support_cas;
            let protocol = self.config.protocol;
            let server = self.pool.server_mut(index);
            let buffer = server.conn.write_buffer_mut();

            match protocol {
                Protocol::Ascii => ascii::write_get(buffer, &[key], &prefix, support_cas),
                Protocol::Binary => binary::write_request(
                    buffer,
                    &Request {
                        opcode: Opcode::GetK,
                        key,
                        prefix: &prefix,
                        extras: Extras::None,
                        value: &[],
                        opaque,
                        cas: 0,
                    },
                ),
            }
        };
        if let Err(err) = encode {
            return Err(self.encode_failed(index, err));
        }

        Stats::add(&self.stats.cmd_get, 1);

        let deadline = self.op_deadline(index);
        self.pool.server_mut(index).conn.begin_request();
        self.flush_request(index, deadline)?;

        let result = match self.config.protocol {
            Protocol::Ascii => self.read_single_get_ascii(index, deadline),
            Protocol::Binary => self.read_single_get_binary(index, deadline),
        };

        match &result {
            Ok(fetched) => Stats::add(&self.stats.vget, fetched.value.len() as u64),
            Err(Status::NotFound) => Stats::add(&self.stats.get_misses, 1),
            Err(_) => {}
        }
        self.stats.record_op(OpKind::Get, elapsed_micros(started));

        result
    }

    fn read_single_get_ascii(&mut self, index: usize, deadline: Instant) -> Result<Fetched, Status> {
        let mut found = None;

        loop {
            match self.next_ascii_event(index, deadline)? {
                AsciiEvent::Value {
                    key,
                    flags,
                    cas,
                    data,
                } => found = Some(self.make_fetched(key, flags, cas, data)),
                AsciiEvent::End => {
                    self.finish_op(index);
                    return found.ok_or(Status::NotFound);
                }
                AsciiEvent::ServerError(msg) => {
                    self.finish_op(index);
                    return Err(Status::ServerError(msg));
                }
                AsciiEvent::ClientError(msg) => {
                    self.finish_op(index);
                    return Err(Status::ClientError(msg));
                }
                _ => return Err(self.fail_op(index, FailureKind::Protocol)),
            }
        }
    }

    fn read_single_get_binary(&mut self, index: usize, deadline: Instant) -> Result<Fetched, Status> {
        let response = self.next_binary_response(index, deadline)?;
        self.finish_op(index);

        match Status::from_binary(response.status, response.cas) {
            Status::Success => Ok(self.make_fetched(
                response.key,
                response.flags,
                Some(response.cas),
                response.value,
            )),
            status => Err(status),
        }
    }

    // ---- multi-get --------------------------------------------------------

    /// Dispatches a pipelined multi-key GET. Results are streamed through
    /// `fetch` until it returns `None`.
    pub fn mget(&mut self, keys: &[&[u8]]) -> Status {
        if self.fetch.is_some() {
            return Status::FetchNotFinished;
        }
        if self.pool.is_empty() {
            return Status::NoServers;
        }

        for key in keys {
            if let Err(status) = self.check_key(key) {
                return status;
            }
        }

        if keys.is_empty() {
            self.fetch = Some(FetchState {
                servers: Vec::new(),
                current: 0,
                requested: 0,
                returned: 0,
            });
            return Status::Success;
        }

        // Group keys per target server; pipelining never crosses connections.
        let now = timestamp_secs();
        let mut grouped: Vec<(usize, Vec<&[u8]>)> = Vec::new();
        for key in keys {
            let index = match self.pool.route_live(key, now) {
                Ok(index) => index,
                Err(status) => return status,
            };
            match grouped.iter_mut().find(|(server, _)| *server == index) {
                Some((_, bucket)) => bucket.push(*key),
                None => grouped.push((index, vec![*key])),
            }
        }

        let mut dispatched = Vec::new();
        let mut requested = 0u64;
        let mut first_error = None;

        for (index, bucket) in grouped {
            let status = self.dispatch_mget(index, &bucket);
            if status.is_success() {
                requested += bucket.len() as u64;
                dispatched.push(index);
            } else if first_error.is_none() {
                first_error = Some(status);
            }
        }

        if dispatched.is_empty() {
            return first_error.unwrap_or(Status::NoServers);
        }

        Stats::add(&self.stats.cmd_get, keys.len() as u64);
        self.fetch = Some(FetchState {
            servers: dispatched,
            current: 0,
            requested,
            returned: 0,
        });

        Status::Success
    }

    fn dispatch_mget(&mut self, index: usize, keys: &[&[u8]]) -> Status {
        if let Err(status) = self.ensure_connected(index) {
            return status;
        }

        let encode = {
            let prefix = self.prefix.clone();
            let opaque = self.next_opaque();
            let support_cas = self.config.support_cas;
            let protocol = self.config.protocol;
            let server = self.pool.server_mut(index);
            let buffer = server.conn.write_buffer_mut();

            match protocol {
                Protocol::Ascii => ascii::write_get(buffer, keys, &prefix, support_cas),
                Protocol::Binary => binary::write_mget(buffer, keys, &prefix, opaque),
            }
        };
        if let Err(err) = encode {
            return self.encode_failed(index, err);
        }

        let deadline = self.op_deadline(index);
        self.pool.server_mut(index).conn.begin_request();
        match self.flush_request(index, deadline) {
            Ok(()) => Status::Success,
            Err(status) => status,
        }
    }

    /// Pulls the next result of the active multi-get. `Ok(None)` once the
    /// stream has ended.
    pub fn fetch(&mut self) -> Result<Option<Fetched>, Status> {
        let mut state = match self.fetch.take() {
            Some(state) => state,
            None => return Ok(None),
        };

        loop {
            if state.current >= state.servers.len() {
                if state.requested > state.returned {
                    Stats::add(&self.stats.get_misses, state.requested - state.returned);
                }
                return Ok(None);
            }

            let index = state.servers[state.current];
            let deadline = self.op_deadline(index);
            match self.read_fetch_item(index, deadline) {
                Ok(Some(fetched)) => {
                    state.returned += 1;
                    Stats::add(&self.stats.vget, fetched.value.len() as u64);
                    self.fetch = Some(state);
                    return Ok(Some(fetched));
                }
                Ok(None) => {
                    self.finish_op(index);
                    state.current += 1;
                }
                Err(status) => {
                    // The failed server's remainder is lost; keep streaming
                    // from the others.
                    logging::debug!(self.log, "multi-get stream lost";
                                    "context" => "fetch",
                                    "server" => index,
                                    "status" => %status);
                    state.current += 1;
                    if state.current >= state.servers.len() && state.returned == 0 {
                        return Err(status);
                    }
                }
            }
        }
    }

    fn read_fetch_item(
        &mut self,
        index: usize,
        deadline: Instant,
    ) -> Result<Option<Fetched>, Status> {
        match self.config.protocol {
            Protocol::Ascii => loop {
                match self.next_ascii_event(index, deadline)? {
                    AsciiEvent::Value {
                        key,
                        flags,
                        cas,
                        data,
                    } => return Ok(Some(self.make_fetched(key, flags, cas, data))),
                    AsciiEvent::End => return Ok(None),
                    AsciiEvent::ServerError(msg) => return Err(Status::ServerError(msg)),
                    AsciiEvent::ClientError(msg) => return Err(Status::ClientError(msg)),
                    _ => return Err(self.fail_op(index, FailureKind::Protocol)),
                }
            },
            Protocol::Binary => loop {
                let response = self.next_binary_response(index, deadline)?;
                match response.opcode {
                    Opcode::NoOp => return Ok(None),
                    Opcode::GetK | Opcode::GetKQ => {
                        if response.status == 0 {
                            return Ok(Some(self.make_fetched(
                                response.key,
                                response.flags,
                                Some(response.cas),
                                response.value,
                            )));
                        }
                        // A miss on the terminal GetK; keep waiting for the
                        // barrier.
                    }
                    _ => return Err(self.fail_op(index, FailureKind::Protocol)),
                }
            },
        }
    }

    // ---- mutators ---------------------------------------------------------

    pub fn incr(&mut self, key: &[u8], delta: u64) -> Result<u64, Status> {
        self.delta(ascii::DeltaVerb::Incr, Opcode::Increment, key, delta)
    }

    pub fn decr(&mut self, key: &[u8], delta: u64) -> Result<u64, Status> {
        self.delta(ascii::DeltaVerb::Decr, Opcode::Decrement, key, delta)
    }

    fn delta(
        &mut self,
        verb: ascii::DeltaVerb,
        opcode: Opcode,
        key: &[u8],
        delta: u64,
    ) -> Result<u64, Status> {
        let started = Instant::now();
        let index = self.begin_op(key, key)?;

        let encode = {
            let prefix = self.prefix.clone();
            let opaque = self.next_opaque();
            let protocol = self.config.protocol;
            let server = self.pool.server_mut(index);
            let buffer = server.conn.write_buffer_mut();

            match protocol {
                Protocol::Ascii => ascii::write_delta(buffer, verb, key, &prefix, delta, false),
                Protocol::Binary => binary::write_request(
                    buffer,
                    &Request {
                        opcode,
                        key,
                        prefix: &prefix,
                        // Expiration 0xffffffff: fail on missing keys rather
                        // than seeding an initial value.
                        extras: Extras::Delta {
                            delta,
                            initial: 0,
                            expiration: 0xffff_ffff,
                        },
                        value: &[],
                        opaque,
                        cas: 0,
                    },
                ),
            }
        };
        if let Err(err) = encode {
            return Err(self.encode_failed(index, err));
        }

        let deadline = self.op_deadline(index);
        self.pool.server_mut(index).conn.begin_request();
        self.flush_request(index, deadline)?;

        let result = match self.config.protocol {
            Protocol::Ascii => match self.next_ascii_event(index, deadline) {
                Ok(AsciiEvent::Number(value)) => {
                    self.finish_op(index);
                    Ok(value)
                }
                Ok(AsciiEvent::NotFound) => {
                    self.finish_op(index);
                    Err(Status::NotFound)
                }
                Ok(AsciiEvent::ClientError(msg)) => {
                    self.finish_op(index);
                    Err(Status::ClientError(msg))
                }
                Ok(AsciiEvent::ServerError(msg)) => {
                    self.finish_op(index);
                    Err(Status::ServerError(msg))
                }
                Ok(_) => Err(self.fail_op(index, FailureKind::Protocol)),
                Err(status) => Err(status),
            },
            Protocol::Binary => match self.next_binary_response(index, deadline) {
                Ok(response) => {
                    self.finish_op(index);
                    match Status::from_binary(response.status, response.cas) {
                        Status::Success => {
                            if response.value.len() == 8 {
                                Ok(BigEndian::read_u64(&response.value))
                            } else {
                                Err(Status::ProtocolError)
                            }
                        }
                        status => Err(status),
                    }
                }
                Err(status) => Err(status),
            },
        };

        self.stats.record_op(OpKind::Delta, elapsed_micros(started));
        result
    }

    // ---- delete / touch ---------------------------------------------------

    /// Deletes `key`. A non-zero expiration uses the legacy defer-delete form
    /// on the ASCII protocol; the server's verdict is surfaced verbatim.
    pub fn delete(&mut self, key: &[u8], expiration: u32) -> Status {
        self.delete_by_key(key, key, expiration)
    }

    /// Routes on `master_key`, deletes `key`.
    pub fn delete_by_key(&mut self, master_key: &[u8], key: &[u8], expiration: u32) -> Status {
        let started = Instant::now();

        if self.config.protocol == Protocol::Binary && expiration > 0 {
            return Status::NotSupported;
        }

        let index = match self.begin_op(master_key, key) {
            Ok(index) => index,
            Err(status) => return status,
        };

        let noreply = self.config.no_reply;
        let encode = {
            let prefix = self.prefix.clone();
            let opaque = self.next_opaque();
            let protocol = self.config.protocol;
            let server = self.pool.server_mut(index);
            let buffer = server.conn.write_buffer_mut();

            match protocol {
                Protocol::Ascii => ascii::write_delete(buffer, key, &prefix, expiration, noreply),
                Protocol::Binary => {
                    let opcode = if noreply { Opcode::DeleteQ } else { Opcode::Delete };
                    binary::write_request(
                        buffer,
                        &Request {
                            opcode,
                            key,
                            prefix: &prefix,
                            extras: Extras::None,
                            value: &[],
                            opaque,
                            cas: 0,
                        },
                    )
                }
            }
        };
        if let Err(err) = encode {
            return self.encode_failed(index, err);
        }

        let status = if noreply {
            self.deliver_buffered(index)
        } else {
            self.exchange_simple(index, 0)
        };

        self.stats.record_op(OpKind::Delete, elapsed_micros(started));
        status
    }

    pub fn touch(&mut self, key: &[u8], expiration: u32) -> Status {
        self.touch_by_key(key, key, expiration)
    }

    /// Adjusts the expiration of an existing key. Binary protocol only; on
    /// ASCII this returns `NotSupported` without touching the wire.
    pub fn touch_by_key(&mut self, master_key: &[u8], key: &[u8], expiration: u32) -> Status {
        if self.config.protocol != Protocol::Binary {
            return Status::NotSupported;
        }

        let started = Instant::now();
        let index = match self.begin_op(master_key, key) {
            Ok(index) => index,
            Err(status) => return status,
        };

        let encode = {
            let prefix = self.prefix.clone();
            let opaque = self.next_opaque();
            let server = self.pool.server_mut(index);
            binary::write_request(
                server.conn.write_buffer_mut(),
                &Request {
                    opcode: Opcode::Touch,
                    key,
                    prefix: &prefix,
                    extras: Extras::Expiration(expiration),
                    value: &[],
                    opaque,
                    cas: 0,
                },
            )
        };
        if let Err(err) = encode {
            return self.encode_failed(index, err);
        }

        let status = self.exchange_simple(index, 0);
        self.stats.record_op(OpKind::Touch, elapsed_micros(started));
        status
    }

    // ---- broadcasts -------------------------------------------------------

    /// Flushes every live server. All servers are attempted; the aggregate is
    /// `Success` iff every server succeeded, else the first failure.
    pub fn flush(&mut self, expiration: Option<u32>) -> Status {
        self.broadcast(|client, index| {
            if let Err(status) = client.ensure_connected(index) {
                return status;
            }

            let encode = {
                let protocol = client.config.protocol;
                let opaque = client.next_opaque();
                let server = client.pool.server_mut(index);
                let buffer = server.conn.write_buffer_mut();

                match protocol {
                    Protocol::Ascii => ascii::write_flush(buffer, expiration, false),
                    Protocol::Binary => {
                        let extras = match expiration {
                            Some(expiration) => Extras::Expiration(expiration),
                            None => Extras::None,
                        };
                        binary::write_request(
                            buffer,
                            &Request {
                                opcode: Opcode::Flush,
                                key: &[],
                                prefix: &[],
                                extras,
                                value: &[],
                                opaque,
                                cas: 0,
                            },
                        )
                    }
                }
            };
            if let Err(err) = encode {
                return client.encode_failed(index, err);
            }

            client.exchange_simple(index, 0)
        })
    }

    /// Per-server statistics fan-out. Every server is attempted; the second
    /// element aggregates like the other broadcasts.
    pub fn server_stats(&mut self, name: Option<&str>) -> (Vec<ServerStats>, Status) {
        let mut collected = Vec::new();

        let aggregate = self.broadcast(|client, index| {
            if let Err(status) = client.ensure_connected(index) {
                return status;
            }

            let encode = {
                let protocol = client.config.protocol;
                let opaque = client.next_opaque();
                let server = client.pool.server_mut(index);
                let buffer = server.conn.write_buffer_mut();

                match protocol {
                    Protocol::Ascii => {
                        ascii::write_stats(buffer, name.map(|name| name.as_bytes()))
                    }
                    Protocol::Binary => binary::write_request(
                        buffer,
                        &Request {
                            opcode: Opcode::Stat,
                            key: name.map(|name| name.as_bytes()).unwrap_or(&[]),
                            prefix: &[],
                            extras: Extras::None,
                            value: &[],
                            opaque,
                            cas: 0,
                        },
                    ),
                }
            };
            if let Err(err) = encode {
                return client.encode_failed(index, err);
            }

            let deadline = client.op_deadline(index);
            client.pool.server_mut(index).conn.begin_request();
            if let Err(status) = client.flush_request(index, deadline) {
                return status;
            }

            let mut entries = HashMap::new();
            let status = match client.config.protocol {
                Protocol::Ascii => loop {
                    match client.next_ascii_event(index, deadline) {
                        Ok(AsciiEvent::Stat { key, value }) => {
                            entries.insert(
                                String::from_utf8_lossy(&key).into_owned(),
                                String::from_utf8_lossy(&value).into_owned(),
                            );
                        }
                        Ok(AsciiEvent::End) => {
                            client.finish_op(index);
                            break Status::Success;
                        }
                        Ok(AsciiEvent::ServerError(msg)) => {
                            client.finish_op(index);
                            break Status::ServerError(msg);
                        }
                        Ok(_) => break client.fail_op(index, FailureKind::Protocol),
                        Err(status) => break status,
                    }
                },
                Protocol::Binary => loop {
                    match client.next_binary_response(index, deadline) {
                        Ok(response) => {
                            if response.status != 0 {
                                client.finish_op(index);
                                break Status::from_binary(response.status, response.cas);
                            }
                            // The terminal packet carries an empty key.
                            if response.key.is_empty() {
                                client.finish_op(index);
                                break Status::Success;
                            }
                            entries.insert(
                                String::from_utf8_lossy(&response.key).into_owned(),
                                String::from_utf8_lossy(&response.value).into_owned(),
                            );
                        }
                        Err(status) => break status,
                    }
                },
            };

            if status.is_success() {
                collected.push(ServerStats {
                    server: client.pool.server(index).spec.name(),
                    entries: std::mem::take(&mut entries),
                });
            }
            status
        });

        (collected, aggregate)
    }

    /// Per-server version fan-out.
    pub fn version(&mut self) -> (Vec<(String, String)>, Status) {
        let mut collected = Vec::new();

        let aggregate = self.broadcast(|client, index| {
            if let Err(status) = client.ensure_connected(index) {
                return status;
            }

            let encode = {
                let protocol = client.config.protocol;
                let opaque = client.next_opaque();
                let server = client.pool.server_mut(index);
                let buffer = server.conn.write_buffer_mut();

                match protocol {
                    Protocol::Ascii => ascii::write_version(buffer),
                    Protocol::Binary => {
                        binary::write_request(buffer, &Request::bare(Opcode::Version, opaque))
                    }
                }
            };
            if let Err(err) = encode {
                return client.encode_failed(index, err);
            }

            let deadline = client.op_deadline(index);
            client.pool.server_mut(index).conn.begin_request();
            if let Err(status) = client.flush_request(index, deadline) {
                return status;
            }

            let version = match client.config.protocol {
                Protocol::Ascii => match client.next_ascii_event(index, deadline) {
                    Ok(AsciiEvent::Version(version)) => version,
                    Ok(_) => return client.fail_op(index, FailureKind::Protocol),
                    Err(status) => return status,
                },
                Protocol::Binary => match client.next_binary_response(index, deadline) {
                    Ok(response) => String::from_utf8_lossy(&response.value).into_owned(),
                    Err(status) => return status,
                },
            };

            client.finish_op(index);
            collected.push((client.pool.server(index).spec.name(), version));
            Status::Success
        });

        (collected, aggregate)
    }

    /// Sends `quit` everywhere and closes every connection.
    pub fn quit(&mut self) -> Status {
        for index in 0..self.pool.len() {
            let open = self.pool.server(index).conn.is_open();
            if open {
                let encode = {
                    let protocol = self.config.protocol;
                    let opaque = self.next_opaque();
                    let server = self.pool.server_mut(index);
                    let buffer = server.conn.write_buffer_mut();
                    match protocol {
                        Protocol::Ascii => ascii::write_quit(buffer),
                        Protocol::Binary => {
                            binary::write_request(buffer, &Request::bare(Opcode::Quit, opaque))
                        }
                    }
                };

                if encode.is_ok() {
                    let deadline = Instant::now() + Duration::from_millis(100);
                    drop(self.flush_request(index, deadline));
                }
            }
            self.pool.server_mut(index).conn.close();
        }

        Status::Success
    }

    /// Round-trip liveness probe against one server.
    pub fn noop(&mut self, index: usize) -> Status {
        if index >= self.pool.len() {
            return Status::NoServers;
        }
        if let Err(status) = self.ensure_connected(index) {
            return status;
        }

        let encode = {
            let protocol = self.config.protocol;
            let opaque = self.next_opaque();
            let server = self.pool.server_mut(index);
            let buffer = server.conn.write_buffer_mut();
            match protocol {
                // The text protocol has no dedicated no-op; a version
                // round-trip serves the same purpose.
                Protocol::Ascii => ascii::write_version(buffer),
                Protocol::Binary => {
                    binary::write_request(buffer, &Request::bare(Opcode::NoOp, opaque))
                }
            }
        };
        if let Err(err) = encode {
            return self.encode_failed(index, err);
        }

        let deadline = self.op_deadline(index);
        self.pool.server_mut(index).conn.begin_request();
        if let Err(status) = self.flush_request(index, deadline) {
            return status;
        }

        match self.config.protocol {
            Protocol::Ascii => match self.next_ascii_event(index, deadline) {
                Ok(AsciiEvent::Version(_)) => {
                    self.finish_op(index);
                    Status::Success
                }
                Ok(_) => self.fail_op(index, FailureKind::Protocol),
                Err(status) => status,
            },
            Protocol::Binary => match self.next_binary_response(index, deadline) {
                Ok(response) => {
                    self.finish_op(index);
                    Status::from_binary(response.status, response.cas)
                }
                Err(status) => status,
            },
        }
    }

    fn broadcast<F: FnMut(&mut Client, usize) -> Status>(&mut self, mut op: F) -> Status {
        if self.pool.is_empty() {
            return Status::NoServers;
        }
        if self.fetch.is_some() {
            return Status::FetchNotFinished;
        }

        let now = timestamp_secs();
        let mut aggregate = Status::Success;

        for index in 0..self.pool.len() {
            if self.pool.is_dead(index, now) {
                continue;
            }

            let status = op(self, index);
            if !status.is_success() && aggregate.is_success() {
                aggregate = status;
            }
        }

        aggregate
    }

    // ---- shared plumbing --------------------------------------------------

    fn check_key(&self, key: &[u8]) -> Result<(), Status> {
        if proto::key_is_valid(key, self.prefix.len(), self.config.verify_key) {
            Ok(())
        } else {
            Err(Status::BadKey)
        }
    }

    /// Validates inputs, resolves the target server and makes sure its
    /// connection is usable.
    fn begin_op(&mut self, master_key: &[u8], key: &[u8]) -> Result<usize, Status> {
        if self.fetch.is_some() {
            return Err(Status::FetchNotFinished);
        }

        self.check_key(key)?;
        if master_key != key {
            self.check_key(master_key)?;
        }

        let index = self.pool.route_live(master_key, timestamp_secs())?;
        self.ensure_connected(index)?;
        Ok(index)
    }

    fn ensure_connected(&mut self, index: usize) -> Result<(), Status> {
        let now = timestamp_secs();

        match self.pool.server(index).conn.state() {
            ConnState::Idle | ConnState::Writing | ConnState::Reading => Ok(()),
            ConnState::Connecting => self.await_connect(index),
            ConnState::Init => self.start_connect(index),
            ConnState::Failed => {
                if self.pool.server(index).conn.retry_due(now) {
                    self.start_connect(index)
                } else {
                    let status = Status::ConnectionFailure;
                    self.last_error = Some(status.clone());
                    Err(status)
                }
            }
        }
    }

    fn start_connect(&mut self, index: usize) -> Result<(), Status> {
        let connect = {
            let server = self.pool.server_mut(index);
            server.conn.connect()
        };
        if let Err(TransportError::Fatal(kind)) = connect {
            return Err(self.fail_op(index, kind));
        }

        let register = {
            let registry = self.poll.registry();
            self.pool
                .server_mut(index)
                .conn
                .register(registry, mio::Token(index))
        };
        if let Err(TransportError::Fatal(kind)) = register {
            return Err(self.fail_op(index, kind));
        }

        self.await_connect(index)
    }

    fn await_connect(&mut self, index: usize) -> Result<(), Status> {
        let deadline = Instant::now() + self.config.connect_timeout();

        loop {
            match self.pool.server(index).conn.state() {
                ConnState::Idle => return Ok(()),
                ConnState::Connecting => {}
                _ => return Err(self.fail_op(index, FailureKind::Connect)),
            }

            let finished = {
                let server = self.pool.server_mut(index);
                server.conn.finish_connect()
            };
            match finished {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(TransportError::Fatal(kind)) => return Err(self.fail_op(index, kind)),
                Err(TransportError::Wait) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.fail_op(index, FailureKind::Timeout));
            }
            self.poll_wait(self.wait_slice(deadline, now))?;
        }
    }

    fn flush_request(&mut self, index: usize, deadline: Instant) -> Result<(), Status> {
        if self.pool.server(index).conn.is_udp() {
            return self.flush_request_udp(index, deadline);
        }

        loop {
            let now = Instant::now();
            let drained = {
                let server = self.pool.server_mut(index);
                match server.conn.send(now) {
                    Ok(sent) => {
                        if sent > 0 {
                            Stats::add(&self.stats.bytes_out, sent as u64);
                        }
                        !server.conn.has_egress()
                    }
                    Err(TransportError::Wait) => false,
                    Err(TransportError::Fatal(kind)) => return Err(self.fail_op(index, kind)),
                }
            };
            if drained {
                return Ok(());
            }

            if now >= deadline {
                return Err(self.fail_op(index, FailureKind::Timeout));
            }
            self.poll_wait(self.wait_slice(deadline, now))?;
        }
    }

    fn flush_request_udp(&mut self, index: usize, deadline: Instant) -> Result<(), Status> {
        let (request_id, payload) = {
            let server = self.pool.server_mut(index);
            let request_id = server.next_udp_request_id();
            let buffer = server.conn.write_buffer_mut();
            let payload = buffer.read_slice().to_vec();
            buffer.clear();
            (request_id, payload)
        };

        for datagram in udp::write_datagrams(request_id, &payload) {
            loop {
                let sent = {
                    let server = self.pool.server_mut(index);
                    server.conn.send_datagram(&datagram)
                };
                match sent {
                    Ok(()) => {
                        Stats::add(&self.stats.bytes_out, datagram.len() as u64);
                        break;
                    }
                    Err(TransportError::Wait) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(self.fail_op(index, FailureKind::Timeout));
                        }
                        self.poll_wait(self.wait_slice(deadline, now))?;
                    }
                    Err(TransportError::Fatal(kind)) => return Err(self.fail_op(index, kind)),
                }
            }
        }

        self.pool.server_mut(index).conn.request_sent();
        Ok(())
    }

    fn next_ascii_event(&mut self, index: usize, deadline: Instant) -> Result<AsciiEvent, Status> {
        loop {
            let parsed = {
                let server = self.pool.server_mut(index);
                server.parser.parse(server.conn.read_buffer_mut())
            };
            match parsed {
                Ok(event) => return Ok(event),
                Err(TransportError::Wait) => {}
                Err(TransportError::Fatal(kind)) => return Err(self.fail_op(index, kind)),
            }

            self.fill_read_buffer(index, deadline)?;
        }
    }

    fn next_binary_response(
        &mut self,
        index: usize,
        deadline: Instant,
    ) -> Result<binary::Response, Status> {
        loop {
            let decoded = {
                let server = self.pool.server_mut(index);
                let buffer = server.conn.read_buffer_mut();
                match binary::decode_response(buffer.read_slice()) {
                    Ok((response, consumed)) => {
                        buffer.consume(consumed);
                        Some(response)
                    }
                    Err(TransportError::Wait) => None,
                    Err(TransportError::Fatal(kind)) => {
                        return Err(self.fail_op(index, kind));
                    }
                }
            };
            if let Some(response) = decoded {
                return Ok(response);
            }

            self.fill_read_buffer(index, deadline)?;
        }
    }

    /// Reads whatever the socket has; waits for readiness when it has
    /// nothing. The deadline turns into a `Timeout` failure.
    fn fill_read_buffer(&mut self, index: usize, deadline: Instant) -> Result<(), Status> {
        if self.pool.server(index).conn.is_udp() {
            return self.fill_read_buffer_udp(index, deadline);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(self.fail_op(index, FailureKind::Timeout));
        }

        let received = {
            let server = self.pool.server_mut(index);
            match server.conn.receive(now) {
                Ok(received) => received,
                Err(TransportError::Wait) => 0,
                Err(TransportError::Fatal(kind)) => return Err(self.fail_op(index, kind)),
            }
        };
        if received > 0 {
            Stats::add(&self.stats.bytes_in, received as u64);
            return Ok(());
        }

        self.poll_wait(self.wait_slice(deadline, now))
    }

    fn fill_read_buffer_udp(&mut self, index: usize, deadline: Instant) -> Result<(), Status> {
        let now = Instant::now();
        let now_secs = timestamp_secs();

        let (progress, failure) = {
            let server = self.pool.server_mut(index);
            let mut scratch = [0u8; 65_507];
            let mut progress = 0u64;

            let failure = loop {
                match server.conn.recv_datagram(&mut scratch) {
                    Ok(count) => {
                        progress += count as u64;
                        match server.reassembly.push(&scratch[..count], now_secs) {
                            Ok(Some((_, payload))) => {
                                if server.conn.read_buffer_mut().extend(&payload).is_err() {
                                    break Some(FailureKind::Memory);
                                }
                            }
                            Ok(None) => {}
                            Err(TransportError::Fatal(kind)) => break Some(kind),
                            Err(TransportError::Wait) => {}
                        }
                    }
                    Err(TransportError::Wait) => break None,
                    Err(TransportError::Fatal(kind)) => break Some(kind),
                }
            };

            (progress, failure)
        };

        if let Some(kind) = failure {
            return Err(self.fail_op(index, kind));
        }

        if progress > 0 {
            Stats::add(&self.stats.bytes_in, progress);
            return Ok(());
        }

        if now >= deadline {
            // The in-flight request is evicted and counted as dropped.
            let report = {
                let server = self.pool.server_mut(index);
                let report = server.reassembly.evict_expired(now_secs + 1, 0);
                server.conn.reset();
                server.parser.reset();
                report
            };
            Stats::add(&self.stats.pkt_drop, report.dropped_fragments);
            Stats::add(&self.stats.udp_timeout, 1);

            let status = Status::Timeout { server: index };
            self.last_error = Some(status.clone());
            return Err(status);
        }

        self.poll_wait(self.wait_slice(deadline, now))
    }

    fn poll_wait(&mut self, wait: Duration) -> Result<(), Status> {
        self.poll
            .poll(&mut self.events, Some(wait))
            .map_err(|_| Status::UnknownReadFailure)
    }

    fn wait_slice(&self, deadline: Instant, now: Instant) -> Duration {
        self.config
            .poll_timeout()
            .min(deadline.saturating_duration_since(now))
            .max(Duration::from_millis(1))
    }

    fn op_deadline(&self, index: usize) -> Instant {
        let window = if self.pool.server(index).conn.is_udp() {
            Duration::from_secs(self.config.udp_request_timeout_secs)
        } else {
            self.config.poll_timeout()
        };
        Instant::now() + window
    }

    /// Fails the server's connection and records the failure against the
    /// pool; the mapped status becomes the last error.
    fn fail_op(&mut self, index: usize, kind: FailureKind) -> Status {
        let now = timestamp_secs();
        let retry = self.config.retry_timeout_secs;
        {
            let server = self.pool.server_mut(index);
            server.conn.fail(now, retry);
            server.parser.reset();
            server.reassembly.clear();
        }
        self.pool.record_failure(index, now);

        let status = Status::from_failure(kind, index);
        logging::debug!(self.log, "operation failed";
                        "context" => "fail_op",
                        "server" => index,
                        "status" => %status);
        self.last_error = Some(status.clone());
        status
    }

    /// Encode-stage failures leave the connection untouched; the partially
    /// written request is discarded.
    fn encode_failed(&mut self, index: usize, err: TransportError) -> Status {
        self.pool.server_mut(index).conn.write_buffer_mut().clear();

        let status = match err {
            TransportError::Fatal(FailureKind::Memory) => Status::MemoryAllocationFailure,
            TransportError::Fatal(kind) => Status::from_failure(kind, index),
            TransportError::Wait => Status::PartialRead,
        };
        self.last_error = Some(status.clone());
        status
    }

    fn finish_op(&mut self, index: usize) {
        self.pool.server_mut(index).conn.complete_response();
        self.pool.record_success(index);
    }

    fn make_fetched(
        &self,
        key: Vec<u8>,
        flags: u32,
        cas: Option<u64>,
        value: Vec<u8>,
    ) -> Fetched {
        let key = if !self.prefix.is_empty() && key.starts_with(&self.prefix) {
            key[self.prefix.len()..].to_vec()
        } else {
            key
        };

        Fetched {
            key,
            value,
            flags,
            cas,
        }
    }

    fn next_opaque(&mut self) -> u32 {
        self.opaque = self.opaque.wrapping_add(1);
        self.opaque
    }
}

fn elapsed_micros(started: Instant) -> u64 {
    started.elapsed().as_micros() as u64
}

/// Maps a simple-command reply line onto the public taxonomy. `None` for
/// replies that cannot follow a storage-class command.
fn command_status(event: &AsciiEvent, cas: u64) -> Option<Status> {
    let status = match event {
        AsciiEvent::Stored | AsciiEvent::Deleted | AsciiEvent::Touched | AsciiEvent::Ok => {
            Status::Success
        }
        AsciiEvent::NotStored => Status::NotStored,
        AsciiEvent::Exists => Status::Exists { cas },
        AsciiEvent::NotFound => Status::NotFound,
        AsciiEvent::ClientError(msg) => Status::ClientError(msg.clone()),
        AsciiEvent::ServerError(msg) => Status::ServerError(msg.clone()),
        AsciiEvent::Error => Status::ClientError("unknown command".to_owned()),
        _ => return None,
    };

    Some(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Distribution;

    fn client_with(count: usize, mut config: ClientConfig) -> Client {
        // Ports in the reserved test range; no traffic flows in these tests.
        config.connect_timeout_millis = 50;
        let specs = (0..count)
            .map(|index| ServerSpec {
                host: "127.0.0.1".to_owned(),
                port: 25_000 + index as u16,
                weight: 1,
                udp: false,
            })
            .collect();

        Client::new(config, specs).unwrap()
    }

    #[test]
    fn test_empty_pool_rejects_everything() {
        let mut client = Client::new(ClientConfig::default(), Vec::new()).unwrap();

        assert_eq!(client.set(b"k", b"v", 0, 0), Status::NoServers);
        assert_eq!(client.get(b"k").unwrap_err(), Status::NoServers);
        assert_eq!(client.delete(b"k", 0), Status::NoServers);
        assert_eq!(client.incr(b"k", 1).unwrap_err(), Status::NoServers);
        assert_eq!(client.flush(None), Status::NoServers);
        assert_eq!(client.mget(&[b"k"]), Status::NoServers);
        assert_eq!(client.noop(0), Status::NoServers);
    }

    #[test]
    fn test_key_validation_before_io() {
        let mut config = ClientConfig::default();
        config.verify_key = true;
        let mut client = client_with(1, config);

        assert_eq!(client.set(b"", b"v", 0, 0), Status::BadKey);
        assert_eq!(client.set(&[b'k'; 251], b"v", 0, 0), Status::BadKey);
        assert_eq!(client.set(b"with space", b"v", 0, 0), Status::BadKey);
        assert_eq!(client.get(b"with\r\n").unwrap_err(), Status::BadKey);

        // Length 250 passes validation; the op then fails on connect, not on
        // the key.
        let long = [b'k'; 250];
        assert_ne!(client.set(&long, b"v", 0, 0), Status::BadKey);
    }

    #[test]
    fn test_unverified_keys_skip_byte_checks() {
        let mut client = client_with(1, ClientConfig::default());

        // Connection will fail, but the key itself is let through.
        assert_ne!(client.set(b"with space", b"v", 0, 0), Status::BadKey);
    }

    #[test]
    fn test_touch_on_ascii_is_rejected_without_io() {
        let mut client = client_with(1, ClientConfig::default());

        assert_eq!(client.touch(b"k", 100), Status::NotSupported);
        // No connection attempt happened.
        assert_eq!(client.pool().server(0).conn.state(), ConnState::Init);
    }

    #[test]
    fn test_binary_delete_with_expiration_is_rejected() {
        let mut config = ClientConfig::default();
        config.protocol = Protocol::Binary;
        let mut client = client_with(1, config);

        assert_eq!(client.delete(b"k", 10), Status::NotSupported);
        assert_eq!(client.pool().server(0).conn.state(), ConnState::Init);
    }

    #[test]
    fn test_prefix_length_enforced() {
        let mut config = ClientConfig::default();
        config.prefix = "p".repeat(crate::config::MAX_PREFIX_LEN + 1);

        assert_eq!(
            Client::new(config, Vec::new()).unwrap_err(),
            Status::BadKey
        );
    }

    #[test]
    fn test_binary_over_udp_is_rejected() {
        let mut config = ClientConfig::default();
        config.protocol = Protocol::Binary;
        let specs = vec![ServerSpec {
            host: "127.0.0.1".to_owned(),
            port: 25_900,
            weight: 1,
            udp: true,
        }];

        assert_eq!(Client::new(config, specs).unwrap_err(), Status::NotSupported);
    }

    #[test]
    fn test_fetch_guard_blocks_new_ops() {
        let mut client = client_with(1, ClientConfig::default());
        client.fetch = Some(FetchState {
            servers: Vec::new(),
            current: 0,
            requested: 0,
            returned: 0,
        });

        assert_eq!(client.set(b"k", b"v", 0, 0), Status::FetchNotFinished);
        assert_eq!(client.mget(&[b"k"]), Status::FetchNotFinished);
        assert_eq!(client.flush(None), Status::FetchNotFinished);

        // Draining the (empty) stream clears the guard.
        assert_eq!(client.fetch().unwrap(), None);
        assert_ne!(client.set(b"k", b"v", 0, 0), Status::FetchNotFinished);
    }

    #[test]
    fn test_route_matches_pool_distribution() {
        let mut config = ClientConfig::default();
        config.distribution = Distribution::Consistent;
        let client = client_with(3, config);

        for key in &[&b"a"[..], b"b", b"c"] {
            assert_eq!(
                client.route(key).unwrap(),
                client.pool().route(key).unwrap()
            );
        }
    }

    #[test]
    fn test_failed_connect_records_last_error() {
        let mut config = ClientConfig::default();
        config.server_failure_limit = 1;
        let mut client = client_with(1, config);

        let status = client.set(b"k", b"v", 0, 0);
        assert!(status.is_fatal(), "unexpected status {:?}", status);
        assert_eq!(client.last_error(), Some(&status));

        // The server is now dead; the next op reports no live servers.
        assert_eq!(client.set(b"k", b"v", 0, 0), Status::NoServers);
    }

    #[test]
    fn test_command_status_mapping() {
        assert_eq!(
            command_status(&AsciiEvent::Stored, 0),
            Some(Status::Success)
        );
        assert_eq!(
            command_status(&AsciiEvent::Exists, 9),
            Some(Status::Exists { cas: 9 })
        );
        assert_eq!(
            command_status(&AsciiEvent::NotStored, 0),
            Some(Status::NotStored)
        );
        assert_eq!(command_status(&AsciiEvent::End, 0), None);
    }
}
