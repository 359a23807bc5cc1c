use crate::error::{FailureKind, TransportError, TransportResult};
use crate::net::buffer::{Buffer, UDP_BUFFER_MAX};
use flint::logging;
use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

/// Per-connection finite state machine.
///
/// ```text
///  Init ──connect()──▶ Connecting ──writable + SO_ERROR == 0──▶ Idle
///  Idle ──begin_request──▶ Writing ──drained──▶ Reading ──response──▶ Idle
///  any ──error──▶ Failed ──retry due──▶ Connecting
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnState {
    Init,
    Connecting,
    Idle,
    Writing,
    Reading,
    Failed,
}

/// Socket options applied before the descriptor is handed to the poll.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOpts {
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
    pub tcp_nodelay: bool,
}

enum Transport {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// One socket to one backend. Owned exclusively by a single driver (the
/// facade's poll loop or one benchmark worker) for its whole life.
pub struct Connection {
    addr: SocketAddr,
    udp: bool,
    opts: SocketOpts,

    transport: Option<Transport>,
    state: ConnState,

    read_buffer: Buffer,
    write_buffer: Buffer,

    connect_started: Option<Instant>,
    last_ingress: Option<Instant>,
    last_egress: Option<Instant>,

    /// Consecutive failed connect/IO cycles since the last success.
    pub retries: u32,
    /// Unix seconds at which a failed connection may be retried.
    pub retry_at: u64,

    /// UDP datagram counters for the in-flight request.
    pub sent_packets: u64,
    pub recv_packets: u64,

    log: logging::Logger,
}

impl Connection {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        addr: SocketAddr,
        udp: bool,
        opts: SocketOpts,
        log: L,
    ) -> Connection {
        let conn_log = match log.into() {
            Some(log) => log.new(logging::o!("peer" => addr.to_string())),
            None => logging::discard(),
        };

        let (read_buffer, write_buffer) = if udp {
            (Buffer::new(UDP_BUFFER_MAX), Buffer::new(UDP_BUFFER_MAX))
        } else {
            (Buffer::unbounded(), Buffer::unbounded())
        };

        Connection {
            addr,
            udp,
            opts,
            transport: None,
            state: ConnState::Init,
            read_buffer,
            write_buffer,
            connect_started: None,
            last_ingress: None,
            last_egress: None,
            retries: 0,
            retry_at: 0,
            sent_packets: 0,
            recv_packets: 0,
            log: conn_log,
        }
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[inline]
    pub fn is_udp(&self) -> bool {
        self.udp
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    #[inline]
    pub fn read_buffer_mut(&mut self) -> &mut Buffer {
        &mut self.read_buffer
    }

    #[inline]
    pub fn write_buffer_mut(&mut self) -> &mut Buffer {
        &mut self.write_buffer
    }

    /// True if there is unsent request data.
    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    #[inline]
    pub fn write_buffer_len(&self) -> usize {
        self.write_buffer.len()
    }

    /// Advances `Writing` to `Reading` for transports that flush outside
    /// `send` (UDP datagrams).
    #[inline]
    pub fn request_sent(&mut self) {
        if self.state == ConnState::Writing {
            self.state = ConnState::Reading;
        }
    }

    /// Starts a non-blocking connect. TCP lands in `Connecting` until the
    /// poll reports the socket writable; UDP has no connect phase and the
    /// logical connection is usable immediately.
    pub fn connect(&mut self) -> TransportResult<()> {
        debug_assert!(self.transport.is_none());

        logging::debug!(self.log, "connecting"; "context" => "connect", "udp" => self.udp);

        if self.udp {
            self.transport = Some(Transport::Udp(self.open_udp()?));
            self.state = ConnState::Idle;
        } else {
            self.transport = Some(Transport::Tcp(self.open_tcp()?));
            self.state = ConnState::Connecting;
            self.connect_started = Some(Instant::now());
        }

        Ok(())
    }

    fn open_tcp(&self) -> TransportResult<TcpStream> {
        let socket = Socket::new(
            Domain::for_address(self.addr),
            Type::STREAM,
            Some(SocketProtocol::TCP),
        )
        .map_err(|_| TransportError::Fatal(FailureKind::SocketCreate))?;

        self.apply_buffer_sizes(&socket);
        socket
            .set_nonblocking(true)
            .map_err(|_| TransportError::Fatal(FailureKind::SocketCreate))?;

        match socket.connect(&self.addr.into()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                logging::debug!(self.log, "connect failed";
                                "context" => "connect",
                                "error" => %err);
                return Err(TransportError::Fatal(FailureKind::Connect));
            }
        }

        Ok(TcpStream::from_std(socket.into()))
    }

    fn open_udp(&self) -> TransportResult<UdpSocket> {
        let socket = Socket::new(
            Domain::for_address(self.addr),
            Type::DGRAM,
            Some(SocketProtocol::UDP),
        )
        .map_err(|_| TransportError::Fatal(FailureKind::SocketCreate))?;

        self.apply_buffer_sizes(&socket);
        socket
            .set_nonblocking(true)
            .map_err(|_| TransportError::Fatal(FailureKind::SocketCreate))?;

        let bind_addr: SocketAddr = match self.addr.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        socket
            .bind(&bind_addr.into())
            .map_err(|_| TransportError::Fatal(FailureKind::Bind))?;
        socket
            .connect(&self.addr.into())
            .map_err(|_| TransportError::Fatal(FailureKind::Connect))?;

        Ok(UdpSocket::from_std(socket.into()))
    }

    /// Buffer-size options are advisory; a refusal is logged and ignored.
    fn apply_buffer_sizes(&self, socket: &Socket) {
        if let Some(size) = self.opts.send_buffer_size {
            if let Err(err) = socket.set_send_buffer_size(size) {
                logging::warn!(self.log, "could not set send buffer size";
                               "context" => "connect", "size" => size, "error" => %err);
            }
        }
        if let Some(size) = self.opts.recv_buffer_size {
            if let Err(err) = socket.set_recv_buffer_size(size) {
                logging::warn!(self.log, "could not set recv buffer size";
                               "context" => "connect", "size" => size, "error" => %err);
            }
        }
    }

    /// Resolves a pending TCP connect after a writable readiness event.
    /// `Ok(true)` once established, `Ok(false)` while still in flight.
    pub fn finish_connect(&mut self) -> TransportResult<bool> {
        debug_assert_eq!(self.state, ConnState::Connecting);

        let stream = match &self.transport {
            Some(Transport::Tcp(stream)) => stream,
            _ => return Err(TransportError::Fatal(FailureKind::Connect)),
        };

        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(err)) => {
                logging::debug!(self.log, "connect completed with error";
                                "context" => "finish_connect", "error" => %err);
                return Err(TransportError::Fatal(FailureKind::Connect));
            }
            Err(_) => return Err(TransportError::Fatal(FailureKind::Connect)),
        }

        match stream.peer_addr() {
            Ok(_) => {
                if self.opts.tcp_nodelay {
                    // Advisory, same as the buffer sizes.
                    drop(stream.set_nodelay(true));
                }
                self.state = ConnState::Idle;
                self.retries = 0;
                self.connect_started = None;

                logging::debug!(self.log, "connection established"; "context" => "finish_connect");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(_) => Err(TransportError::Fatal(FailureKind::Connect)),
        }
    }

    /// Time spent in `Connecting`, for connect-timeout enforcement.
    pub fn connect_elapsed(&self, now: Instant) -> Duration {
        self.connect_started
            .map(|started| now.duration_since(started))
            .unwrap_or_default()
    }

    /// Time since the last bytes arrived, if any have.
    pub fn last_ingress_elapsed(&self, now: Instant) -> Option<Duration> {
        self.last_ingress.map(|at| now.duration_since(at))
    }

    /// Time since the last bytes left, if any have.
    pub fn last_egress_elapsed(&self, now: Instant) -> Option<Duration> {
        self.last_egress.map(|at| now.duration_since(at))
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> TransportResult<()> {
        let interest = Interest::READABLE | Interest::WRITABLE;
        let result = match self.transport.as_mut() {
            Some(Transport::Tcp(stream)) => registry.register(stream, token, interest),
            Some(Transport::Udp(socket)) => registry.register(socket, token, interest),
            None => return Err(TransportError::Fatal(FailureKind::Connect)),
        };

        logging::trace!(self.log, "registered on poll";
                        "context" => "register", "token" => token.0);
        result.map_err(Into::into)
    }

    pub fn deregister(&mut self, registry: &Registry) -> TransportResult<()> {
        let result = match self.transport.as_mut() {
            Some(Transport::Tcp(stream)) => registry.deregister(stream),
            Some(Transport::Udp(socket)) => registry.deregister(socket),
            None => return Ok(()),
        };

        result.map_err(Into::into)
    }

    /// Marks the idle connection as carrying a framed request.
    #[inline]
    pub fn begin_request(&mut self) {
        debug_assert_eq!(self.state, ConnState::Idle);
        self.state = ConnState::Writing;
    }

    /// Marks the pending response as fully consumed.
    #[inline]
    pub fn complete_response(&mut self) {
        self.state = ConnState::Idle;
    }

    /// Flushes buffered request bytes. On a drain the state advances from
    /// `Writing` to `Reading`; a partial write stays in `Writing`.
    pub fn send(&mut self, now: Instant) -> TransportResult<usize> {
        let sent = match self.transport.as_mut() {
            Some(Transport::Tcp(stream)) => match self.write_buffer.egress(stream) {
                Ok(count) => count,
                Err(err) if err.kind() == io::ErrorKind::WriteZero => {
                    return Err(TransportError::Fatal(FailureKind::Write));
                }
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    return Err(TransportError::Fatal(FailureKind::Write));
                }
                Err(err) => return Err(err.into()),
            },
            Some(Transport::Udp(_)) => {
                // UDP requests leave through send_datagram.
                return Err(TransportError::Fatal(FailureKind::Write));
            }
            None => return Err(TransportError::Fatal(FailureKind::Write)),
        };

        if sent > 0 {
            self.last_egress = Some(now);
        }

        if self.state == ConnState::Writing && self.write_buffer.is_empty() {
            self.state = ConnState::Reading;
        }

        Ok(sent)
    }

    /// Reads all available response bytes into the read buffer.
    pub fn receive(&mut self, now: Instant) -> TransportResult<usize> {
        let received = match self.transport.as_mut() {
            Some(Transport::Tcp(stream)) => match self.read_buffer.ingress(stream) {
                Ok(count) => count,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(TransportError::Fatal(FailureKind::Read));
                }
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {
                    return Err(TransportError::Fatal(FailureKind::Read));
                }
                Err(err) if err.kind() == io::ErrorKind::OutOfMemory => {
                    return Err(TransportError::Fatal(FailureKind::Memory));
                }
                Err(err) => return Err(err.into()),
            },
            Some(Transport::Udp(_)) => return Err(TransportError::Fatal(FailureKind::UnknownRead)),
            None => return Err(TransportError::Fatal(FailureKind::Read)),
        };

        if received > 0 {
            self.last_ingress = Some(now);
        }

        Ok(received)
    }

    /// Sends one framed datagram. `Wait` when the socket would block.
    pub fn send_datagram(&mut self, datagram: &[u8]) -> TransportResult<()> {
        let socket = match self.transport.as_ref() {
            Some(Transport::Udp(socket)) => socket,
            _ => return Err(TransportError::Fatal(FailureKind::Write)),
        };

        match socket.send(datagram) {
            Ok(_) => {
                self.sent_packets += 1;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Receives one datagram into `scratch`, returning its length. `Wait`
    /// when no datagram is queued.
    pub fn recv_datagram(&mut self, scratch: &mut [u8]) -> TransportResult<usize> {
        let socket = match self.transport.as_ref() {
            Some(Transport::Udp(socket)) => socket,
            _ => return Err(TransportError::Fatal(FailureKind::UnknownRead)),
        };

        match socket.recv(scratch) {
            Ok(count) => {
                self.recv_packets += 1;
                Ok(count)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fails the connection: the socket is dropped, buffers are cleared and a
    /// reconnect is scheduled `retry_timeout` seconds out.
    pub fn fail(&mut self, now_secs: u64, retry_timeout: u64) {
        logging::debug!(self.log, "connection failed";
                        "context" => "fail",
                        "state" => ?self.state,
                        "retries" => self.retries,
                        "read_size" => self.read_buffer.len(),
                        "write_size" => self.write_buffer.len());

        self.drop_socket();
        self.state = ConnState::Failed;
        self.retries += 1;
        self.retry_at = now_secs + retry_timeout;
    }

    /// True once a failed connection has served out its backoff.
    #[inline]
    pub fn retry_due(&self, now_secs: u64) -> bool {
        self.state == ConnState::Failed && now_secs >= self.retry_at
    }

    /// Orderly close; the connection can be reconnected later.
    pub fn close(&mut self) {
        logging::debug!(self.log, "closing connection"; "context" => "close");
        self.drop_socket();
        self.state = ConnState::Init;
    }

    /// Discards the in-flight request but keeps the socket. Used when a UDP
    /// request times out and its slot is reissued.
    pub fn reset(&mut self) {
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.sent_packets = 0;
        self.recv_packets = 0;
        if self.state == ConnState::Writing || self.state == ConnState::Reading {
            self.state = ConnState::Idle;
        }
    }

    fn drop_socket(&mut self) {
        if let Some(Transport::Tcp(stream)) = self.transport.take() {
            drop(stream.shutdown(std::net::Shutdown::Both));
        }
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.sent_packets = 0;
        self.recv_packets = 0;
        self.connect_started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Instant;

    fn opts() -> SocketOpts {
        SocketOpts {
            send_buffer_size: Some(64 * 1024),
            recv_buffer_size: Some(64 * 1024),
            tcp_nodelay: true,
        }
    }

    fn poll_until<F: FnMut(&mut Connection) -> bool>(
        poll: &mut mio::Poll,
        conn: &mut Connection,
        mut done: F,
    ) {
        let mut events = mio::Events::with_capacity(16);
        let deadline = Instant::now() + Duration::from_secs(5);

        while !done(conn) {
            assert!(Instant::now() < deadline, "test deadline exceeded");
            poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
        }
    }

    #[test]
    fn test_tcp_connect_write_read_cycle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").unwrap();
        });

        let mut conn = Connection::new(addr, false, opts(), None);
        assert_eq!(conn.state(), ConnState::Init);

        conn.connect().unwrap();
        assert_eq!(conn.state(), ConnState::Connecting);

        let mut poll = mio::Poll::new().unwrap();
        conn.register(poll.registry(), Token(1)).unwrap();

        poll_until(&mut poll, &mut conn, |conn| match conn.state() {
            ConnState::Idle => true,
            ConnState::Connecting => {
                conn.finish_connect().unwrap();
                false
            }
            state => panic!("Unexpected state {:?}", state),
        });

        conn.write_buffer_mut().extend(b"hello").unwrap();
        conn.begin_request();
        assert_eq!(conn.state(), ConnState::Writing);

        poll_until(&mut poll, &mut conn, |conn| {
            conn.send(Instant::now()).unwrap();
            conn.state() == ConnState::Reading
        });

        poll_until(&mut poll, &mut conn, |conn| {
            drop(conn.receive(Instant::now()));
            conn.read_buffer_mut().len() == 5
        });

        assert_eq!(conn.read_buffer_mut().read_slice(), b"world");
        conn.complete_response();
        assert_eq!(conn.state(), ConnState::Idle);

        server.join().unwrap();
    }

    #[test]
    fn test_failed_connection_retry_schedule() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut conn = Connection::new(addr, false, SocketOpts::default(), None);

        conn.fail(1000, 30);

        assert_eq!(conn.state(), ConnState::Failed);
        assert!(!conn.is_open());
        assert_eq!(conn.retries, 1);
        assert!(!conn.retry_due(1029));
        assert!(conn.retry_due(1030));
    }

    #[test]
    fn test_udp_logical_connection_roundtrip() {
        let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let mut conn = Connection::new(addr, true, SocketOpts::default(), None);
        conn.connect().unwrap();
        // No connect phase for UDP.
        assert_eq!(conn.state(), ConnState::Idle);

        conn.send_datagram(b"ping").unwrap();
        assert_eq!(conn.sent_packets, 1);

        let mut buf = [0u8; 16];
        let (count, peer) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..count], b"ping");
        server.send_to(b"pong", peer).unwrap();

        let mut scratch = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match conn.recv_datagram(&mut scratch) {
                Ok(count) => {
                    assert_eq!(&scratch[..count], b"pong");
                    break;
                }
                Err(TransportError::Wait) => {
                    assert!(Instant::now() < deadline, "test deadline exceeded");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("Unexpected error {:?}", err),
            }
        }

        assert_eq!(conn.recv_packets, 1);
    }

    #[test]
    fn test_reset_discards_in_flight_request() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut conn = Connection::new(addr, true, SocketOpts::default(), None);

        conn.write_buffer_mut().extend(b"request").unwrap();
        conn.read_buffer_mut().extend(b"partial").unwrap();
        conn.sent_packets = 3;
        conn.recv_packets = 1;
        conn.state = ConnState::Reading;

        conn.reset();

        assert!(conn.write_buffer_mut().is_empty());
        assert!(conn.read_buffer_mut().is_empty());
        assert_eq!(conn.sent_packets, 0);
        assert_eq!(conn.state(), ConnState::Idle);
    }
}
