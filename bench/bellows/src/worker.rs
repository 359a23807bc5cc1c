use crate::config::Settings;
use crate::workload::{OpChoice, Workload};
use flint::logging;
use flint::time::timestamp_secs;
use forge::error::{FailureKind, TransportError};
use forge::net::connection::{ConnState, Connection, SocketOpts};
use forge::proto::ascii::{self, AsciiEvent, AsciiParser, StorageVerb};
use forge::proto::binary::{self, Extras, Opcode, Request};
use forge::proto::udp::{self, Reassembly};
use forge::stats::{OpKind, Pacer, Stats};
use hashbrown::HashMap;
use mio::{Events, Poll, Token};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_secs(1);

/// What the connection is waiting for.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Expect {
    Nothing,
    /// One terminal reply line or one binary response.
    Simple,
    /// A retrieval stream up to `END` / the NOOP barrier.
    Get { requested: u64, returned: u64 },
}

/// One pre-allocated benchmark slot. Owned by its worker for the whole run.
struct BenchConn {
    conn: Connection,
    parser: AsciiParser,
    reassembly: Reassembly,
    workload: Workload,
    pacer: Pacer,

    expect: Expect,
    op_kind: OpKind,
    started: Instant,
    started_secs: u64,
    udp_request_id: u16,

    /// Remaining exec budget; `None` is unbounded.
    remaining: Option<u64>,
    exhausted: bool,
}

impl BenchConn {
    fn in_flight(&self) -> bool {
        self.expect != Expect::Nothing
    }
}

/// Outcome of one worker's run.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerReport {
    pub completed_ops: u64,
    pub lost_ops: u64,
    pub failed_conns: usize,
    pub conns: usize,
}

/// Prints at most one line per failure kind per second; every failure still
/// lands in the statistics.
struct ErrorGate {
    printed: HashMap<&'static str, u64>,
}

impl ErrorGate {
    fn new() -> ErrorGate {
        ErrorGate {
            printed: HashMap::new(),
        }
    }

    fn should_print(&mut self, kind: &'static str, now_secs: u64) -> bool {
        match self.printed.get(kind) {
            Some(&second) if second == now_secs => false,
            _ => {
                self.printed.insert(kind, now_secs);
                true
            }
        }
    }
}

/// One benchmark thread: a reactor over its own slice of the connection
/// array, with a 1-second housekeeping tick.
pub struct Worker {
    index: usize,
    settings: Arc<Settings>,
    addr: SocketAddr,

    poll: Poll,
    events: Events,
    conns: Vec<BenchConn>,

    stats: Arc<Stats>,
    stop: Arc<AtomicBool>,
    active_conns: Arc<AtomicUsize>,

    gate: ErrorGate,
    report: WorkerReport,
    log: logging::Logger,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        settings: Arc<Settings>,
        addrs: &[SocketAddr],
        stats: Arc<Stats>,
        stop: Arc<AtomicBool>,
        active_conns: Arc<AtomicUsize>,
        log: &logging::Logger,
    ) -> Worker {
        let worker_log = log.new(logging::o!("worker" => index));

        // One backend per worker, distributed round-robin across the list.
        let addr = addrs[index % addrs.len()];
        let conn_count = settings.conns_for_worker(index);

        let opts = SocketOpts {
            send_buffer_size: settings.client.send_buffer_size,
            recv_buffer_size: settings.client.recv_buffer_size,
            tcp_nodelay: settings.client.tcp_nodelay,
        };
        let exec_budget = settings.execs_per_conn();
        let tps_budget = settings.tps_per_conn();

        let conns = (0..conn_count)
            .map(|slot| BenchConn {
                conn: Connection::new(addr, settings.udp, opts, &worker_log),
                parser: AsciiParser::new(),
                reassembly: Reassembly::new(),
                workload: Workload::new(
                    &settings.workload,
                    (index as u64) << 32 | slot as u64,
                ),
                pacer: Pacer::new(tps_budget),
                expect: Expect::Nothing,
                op_kind: OpKind::Other,
                started: Instant::now(),
                started_secs: 0,
                udp_request_id: 0,
                remaining: if exec_budget == 0 {
                    None
                } else {
                    Some(exec_budget)
                },
                exhausted: false,
            })
            .collect();

        Worker {
            index,
            settings,
            addr,
            poll: Poll::new().expect("Error creating worker poll"),
            events: Events::with_capacity(1024),
            conns,
            stats,
            stop,
            active_conns,
            gate: ErrorGate::new(),
            report: WorkerReport::default(),
            log: worker_log,
        }
    }

    pub fn run(&mut self) -> WorkerReport {
        pin_to_cpu(self.index, &self.log);

        logging::debug!(self.log, "worker starting";
                        "context" => "run",
                        "server" => %self.addr,
                        "conns" => self.conns.len());

        for index in 0..self.conns.len() {
            self.try_connect(index);
        }

        let mut last_tick = Instant::now();

        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            if self.conns.iter().all(|conn| conn.exhausted) {
                break;
            }

            let wait = TICK
                .checked_sub(last_tick.elapsed())
                .unwrap_or_default()
                .max(Duration::from_millis(1));
            drop(self.poll.poll(&mut self.events, Some(wait)));

            let now = Instant::now();
            let tokens: Vec<usize> = self.events.iter().map(|event| event.token().0).collect();
            for token in tokens {
                if token < self.conns.len() {
                    self.drive(token, now);
                }
            }

            for index in 0..self.conns.len() {
                self.pump(index, now);
            }

            if last_tick.elapsed() >= TICK {
                self.tick();
                last_tick = Instant::now();
            }
        }

        self.shutdown()
    }

    /// Readiness arrived (or may have); resume the connection's state
    /// machine.
    fn drive(&mut self, index: usize, now: Instant) {
        match self.conns[index].conn.state() {
            ConnState::Connecting => self.drive_connect(index, now),
            ConnState::Writing => self.drive_write(index, now),
            ConnState::Reading => self.drive_read(index, now),
            ConnState::Init | ConnState::Idle | ConnState::Failed => {}
        }
    }

    fn drive_connect(&mut self, index: usize, now: Instant) {
        let finished = self.conns[index].conn.finish_connect();
        match finished {
            Ok(true) => self.pump(index, now),
            Ok(false) => {
                let timeout = self.settings.client.connect_timeout();
                if self.conns[index].conn.connect_elapsed(now) > timeout {
                    self.fail_conn(index, FailureKind::Timeout);
                }
            }
            Err(TransportError::Wait) => {}
            Err(TransportError::Fatal(kind)) => self.fail_conn(index, kind),
        }
    }

    fn drive_write(&mut self, index: usize, now: Instant) {
        if self.conns[index].conn.is_udp() {
            self.drive_write_udp(index);
            return;
        }

        let sent = self.conns[index].conn.send(now);
        match sent {
            Ok(count) => {
                if count > 0 {
                    Stats::add(&self.stats.bytes_out, count as u64);
                }
            }
            Err(TransportError::Wait) => {}
            Err(TransportError::Fatal(kind)) => self.fail_conn(index, kind),
        }
    }

    /// Ships the whole framed request as datagrams. On a would-block the
    /// request stays buffered and the send is retried wholesale.
    fn drive_write_udp(&mut self, index: usize) {
        let (request_id, payload) = {
            let slot = &mut self.conns[index];
            (slot.udp_request_id, slot.conn.write_buffer_mut().read_slice().to_vec())
        };

        for datagram in udp::write_datagrams(request_id, &payload) {
            match self.conns[index].conn.send_datagram(&datagram) {
                Ok(()) => Stats::add(&self.stats.bytes_out, datagram.len() as u64),
                Err(TransportError::Wait) => return,
                Err(TransportError::Fatal(kind)) => {
                    self.fail_conn(index, kind);
                    return;
                }
            }
        }

        let slot = &mut self.conns[index];
        slot.conn.write_buffer_mut().clear();
        slot.conn.request_sent();
    }

    fn drive_read(&mut self, index: usize, now: Instant) {
        if self.conns[index].conn.is_udp() {
            if !self.pump_udp_datagrams(index) {
                return;
            }
        } else {
            let received = self.conns[index].conn.receive(now);
            match received {
                Ok(count) => {
                    if count > 0 {
                        Stats::add(&self.stats.bytes_in, count as u64);
                    } else {
                        return;
                    }
                }
                Err(TransportError::Wait) => return,
                Err(TransportError::Fatal(kind)) => {
                    self.fail_conn(index, kind);
                    return;
                }
            }
        }

        if self.settings.binary_protocol() {
            self.parse_binary(index, now);
        } else {
            self.parse_ascii(index, now);
        }
    }

    /// Drains queued datagrams into the read buffer. Returns true when a
    /// parse attempt is worthwhile.
    fn pump_udp_datagrams(&mut self, index: usize) -> bool {
        let now_secs = timestamp_secs();
        let slot = &mut self.conns[index];
        let mut scratch = [0u8; 65_507];
        let mut progress = 0u64;

        let failure = loop {
            match slot.conn.recv_datagram(&mut scratch) {
                Ok(count) => {
                    progress += count as u64;
                    match slot.reassembly.push(&scratch[..count], now_secs) {
                        Ok(Some((_, payload))) => {
                            if slot.conn.read_buffer_mut().extend(&payload).is_err() {
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

        if progress > 0 {
            Stats::add(&self.stats.bytes_in, progress);
        }
        if let Some(kind) = failure {
            self.fail_conn(index, kind);
            return false;
        }

        progress > 0
    }

    fn parse_ascii(&mut self, index: usize, now: Instant) {
        loop {
            let parsed = {
                let slot = &mut self.conns[index];
                slot.parser.parse(slot.conn.read_buffer_mut())
            };

            let event = match parsed {
                Ok(event) => event,
                Err(TransportError::Wait) => return,
                Err(TransportError::Fatal(kind)) => {
                    self.fail_conn(index, kind);
                    return;
                }
            };

            match self.conns[index].expect {
                Expect::Nothing => {
                    self.fail_conn(index, FailureKind::Protocol);
                    return;
                }
                Expect::Simple => match event {
                    AsciiEvent::Value { .. } | AsciiEvent::Stat { .. } | AsciiEvent::End => {
                        self.fail_conn(index, FailureKind::Protocol);
                        return;
                    }
                    AsciiEvent::ClientError(_) | AsciiEvent::ServerError(_) | AsciiEvent::Error => {
                        self.note_error("server_reply");
                        self.complete_op(index, now);
                    }
                    _ => self.complete_op(index, now),
                },
                Expect::Get { requested, returned } => match event {
                    AsciiEvent::Value { data, .. } => {
                        Stats::add(&self.stats.vget, data.len() as u64);
                        self.conns[index].expect = Expect::Get {
                            requested,
                            returned: returned + 1,
                        };
                    }
                    AsciiEvent::End => {
                        if requested > returned {
                            Stats::add(&self.stats.get_misses, requested - returned);
                        }
                        self.complete_op(index, now);
                    }
                    AsciiEvent::ServerError(_) | AsciiEvent::ClientError(_) => {
                        self.note_error("server_reply");
                        self.complete_op(index, now);
                    }
                    _ => {
                        self.fail_conn(index, FailureKind::Protocol);
                        return;
                    }
                },
            }

            if !self.conns[index].in_flight() {
                return;
            }
        }
    }

    fn parse_binary(&mut self, index: usize, now: Instant) {
        loop {
            let decoded = {
                let slot = &mut self.conns[index];
                let buffer = slot.conn.read_buffer_mut();
                match binary::decode_response(buffer.read_slice()) {
                    Ok((response, consumed)) => {
                        buffer.consume(consumed);
                        Some(response)
                    }
                    Err(TransportError::Wait) => None,
                    Err(TransportError::Fatal(kind)) => {
                        self.fail_conn(index, kind);
                        return;
                    }
                }
            };

            let response = match decoded {
                Some(response) => response,
                None => return,
            };

            match self.conns[index].expect {
                Expect::Nothing => {
                    self.fail_conn(index, FailureKind::Protocol);
                    return;
                }
                Expect::Simple => {
                    if response.status != 0 {
                        self.note_error("server_status");
                    }
                    self.complete_op(index, now);
                }
                Expect::Get { requested, returned } => match response.opcode {
                    Opcode::NoOp => {
                        if requested > returned {
                            Stats::add(&self.stats.get_misses, requested - returned);
                        }
                        self.complete_op(index, now);
                    }
                    Opcode::GetK | Opcode::GetKQ => {
                        if response.status == 0 {
                            Stats::add(&self.stats.vget, response.value.len() as u64);
                            self.conns[index].expect = Expect::Get {
                                requested,
                                returned: returned + 1,
                            };
                        }
                    }
                    _ => {
                        self.fail_conn(index, FailureKind::Protocol);
                        return;
                    }
                },
            }

            if !self.conns[index].in_flight() {
                return;
            }
        }
    }

    /// Issues the next operation on an idle connection, within its exec and
    /// TPS budgets.
    fn pump(&mut self, index: usize, now: Instant) {
        if self.stop.load(Ordering::Relaxed) {
            return;
        }

        let remaining = {
            let slot = &self.conns[index];
            if slot.exhausted || slot.conn.state() != ConnState::Idle || slot.in_flight() {
                return;
            }
            slot.remaining
        };
        if remaining == Some(0) {
            self.mark_exhausted(index);
            return;
        }

        // TPS pacing stalls the connection for the rest of the second.
        if !self.conns[index].pacer.ready(timestamp_secs()) {
            return;
        }

        let op = self.conns[index].workload.next_op();
        if let Err(kind) = self.encode_op(index, &op) {
            let slot = &mut self.conns[index];
            slot.conn.write_buffer_mut().clear();
            self.note_error("encode");
            logging::warn!(self.log, "failed to encode request";
                           "context" => "pump", "kind" => ?kind);
            return;
        }

        {
            let slot = &mut self.conns[index];
            slot.pacer.consume();
            if let Some(remaining) = slot.remaining.as_mut() {
                *remaining -= 1;
            }
            slot.started = now;
            slot.started_secs = timestamp_secs();
            slot.conn.begin_request();
        }

        self.drive_write(index, now);
    }

    fn encode_op(&mut self, index: usize, op: &OpChoice) -> Result<(), FailureKind> {
        let binary_protocol = self.settings.binary_protocol();
        let prefix = self.settings.client.prefix.clone().into_bytes();
        let stats = self.stats.clone();
        let slot = &mut self.conns[index];

        if slot.conn.is_udp() {
            slot.udp_request_id = slot.udp_request_id.wrapping_add(1);
        }

        let result: Result<Expect, TransportError> = match op {
            OpChoice::Set { key, value } => {
                let buffer = slot.conn.write_buffer_mut();
                let encoded = if binary_protocol {
                    binary::write_request(
                        buffer,
                        &Request {
                            opcode: Opcode::Set,
                            key,
                            prefix: &prefix,
                            extras: Extras::Storage {
                                flags: 0,
                                expiration: 0,
                            },
                            value,
                            opaque: 0,
                            cas: 0,
                        },
                    )
                } else {
                    ascii::write_storage(
                        buffer,
                        StorageVerb::Set,
                        key,
                        &prefix,
                        0,
                        0,
                        value,
                        None,
                        false,
                    )
                };
                match encoded {
                    Ok(()) => {
                        Stats::add(&stats.cmd_set, 1);
                        Stats::add(&stats.vset, value.len() as u64);
                        slot.op_kind = OpKind::Set;
                        Ok(Expect::Simple)
                    }
                    Err(err) => Err(err),
                }
            }
            OpChoice::Get { keys } => {
                let refs: Vec<&[u8]> = keys.iter().map(|key| key.as_slice()).collect();
                let buffer = slot.conn.write_buffer_mut();
                let encoded = if binary_protocol {
                    binary::write_mget(buffer, &refs, &prefix, 0)
                } else {
                    ascii::write_get(buffer, &refs, &prefix, false)
                };
                match encoded {
                    Ok(()) => {
                        Stats::add(&stats.cmd_get, keys.len() as u64);
                        slot.op_kind = OpKind::Get;
                        Ok(Expect::Get {
                            requested: keys.len() as u64,
                            returned: 0,
                        })
                    }
                    Err(err) => Err(err),
                }
            }
        };

        match result {
            Ok(expect) => {
                slot.expect = expect;
                Ok(())
            }
            Err(TransportError::Fatal(kind)) => Err(kind),
            Err(TransportError::Wait) => Err(FailureKind::Write),
        }
    }

    fn complete_op(&mut self, index: usize, now: Instant) {
        let (kind, elapsed) = {
            let slot = &mut self.conns[index];
            slot.expect = Expect::Nothing;
            slot.conn.complete_response();
            let elapsed = now.duration_since(slot.started).as_micros() as u64;
            (slot.op_kind, elapsed)
        };

        self.stats.record_op(kind, elapsed);
        self.report.completed_ops += 1;

        self.pump(index, now);
    }

    /// Housekeeping on the 1-second timer: UDP request timeouts, hung
    /// connects and failed connection retries.
    fn tick(&mut self) {
        let now_secs = timestamp_secs();
        let now = Instant::now();
        let udp_timeout = self.settings.client.udp_request_timeout_secs;
        let connect_timeout = self.settings.client.connect_timeout();

        for index in 0..self.conns.len() {
            let connect_hung = {
                let slot = &self.conns[index];
                slot.conn.state() == ConnState::Connecting
                    && slot.conn.connect_elapsed(now) > connect_timeout
            };
            if connect_hung {
                self.fail_conn(index, FailureKind::Timeout);
            }
            let timed_out = {
                let slot = &self.conns[index];
                slot.conn.is_udp()
                    && slot.in_flight()
                    && now_secs.saturating_sub(slot.started_secs) > udp_timeout
            };
            if timed_out {
                let report = {
                    let slot = &mut self.conns[index];
                    let report = slot.reassembly.evict_expired(now_secs + 1, 0);
                    slot.conn.reset();
                    slot.parser.reset();
                    slot.expect = Expect::Nothing;
                    report
                };
                Stats::add(&self.stats.pkt_drop, report.dropped_fragments);
                Stats::add(&self.stats.udp_timeout, 1);
                self.report.lost_ops += 1;
                self.note_error("udp_timeout");
            }

            let retry = {
                let slot = &self.conns[index];
                !slot.exhausted
                    && slot.conn.state() == ConnState::Failed
                    && slot.conn.retry_due(now_secs)
            };
            if retry {
                self.try_connect(index);
            }
        }
    }

    fn try_connect(&mut self, index: usize) {
        let connect = self.conns[index].conn.connect();
        if let Err(TransportError::Fatal(kind)) = connect {
            self.fail_conn(index, kind);
            return;
        }

        let register = {
            let registry = self.poll.registry();
            self.conns[index].conn.register(registry, Token(index))
        };
        if let Err(TransportError::Fatal(kind)) = register {
            self.fail_conn(index, kind);
        }
    }

    fn fail_conn(&mut self, index: usize, kind: FailureKind) {
        let now_secs = timestamp_secs();
        let retry_timeout = self.settings.client.retry_timeout_secs;

        let lost = {
            let slot = &mut self.conns[index];
            let lost = slot.in_flight();
            slot.conn.fail(now_secs, retry_timeout);
            slot.parser.reset();
            slot.reassembly.clear();
            slot.expect = Expect::Nothing;
            lost
        };
        if lost {
            self.report.lost_ops += 1;
        }

        if self.gate.should_print(failure_label(kind), now_secs) {
            logging::warn!(self.log, "connection failure";
                           "context" => "fail_conn",
                           "conn" => index,
                           "server" => %self.addr,
                           "kind" => ?kind);
        }

        if !self.settings.reconnect {
            self.mark_exhausted(index);
        }
    }

    fn mark_exhausted(&mut self, index: usize) {
        let slot = &mut self.conns[index];
        if slot.exhausted {
            return;
        }
        slot.exhausted = true;
        if slot.conn.is_open() {
            slot.conn.close();
        }

        // The run stops once every connection process-wide is done.
        if self.active_conns.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stop.store(true, Ordering::Relaxed);
        }
    }

    fn note_error(&mut self, label: &'static str) {
        let now_secs = timestamp_secs();
        if self.gate.should_print(label, now_secs) {
            logging::warn!(self.log, "operation error"; "context" => "reply", "kind" => label);
        }
    }

    fn shutdown(&mut self) -> WorkerReport {
        // Drain whatever responses are already queued, then close.
        let now = Instant::now();
        for index in 0..self.conns.len() {
            if self.conns[index].conn.state() == ConnState::Reading {
                self.drive_read(index, now);
            }
        }

        let mut failed = 0;
        for slot in &mut self.conns {
            if slot.conn.state() == ConnState::Failed {
                failed += 1;
            }
            if slot.conn.is_open() {
                slot.conn.close();
            }
        }

        self.report.failed_conns = failed;
        self.report.conns = self.conns.len();

        logging::debug!(self.log, "worker finished";
                        "context" => "shutdown",
                        "completed" => self.report.completed_ops,
                        "lost" => self.report.lost_ops,
                        "failed_conns" => failed);

        self.report
    }
}

fn failure_label(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::Write => "write",
        FailureKind::Read => "read",
        FailureKind::UnknownRead => "unknown_read",
        FailureKind::Connect => "connect",
        FailureKind::Bind => "bind",
        FailureKind::SocketCreate => "socket_create",
        FailureKind::Protocol => "protocol",
        FailureKind::Timeout => "timeout",
        FailureKind::Memory => "memory",
        FailureKind::Io(_) => "io",
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(worker: usize, log: &logging::Logger) {
    let ncpu = std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1);
    if ncpu <= 1 {
        return;
    }

    let cpu = worker % ncpu;
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            logging::warn!(log, "could not set cpu affinity, continuing";
                           "context" => "pin", "cpu" => cpu);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_worker: usize, _log: &logging::Logger) {}
