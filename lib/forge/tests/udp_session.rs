//! Facade tests over UDP framing against a scripted datagram server that
//! fragments its replies and delivers them out of order.

use forge::client::Client;
use forge::config::ClientConfig;
use forge::error::Status;
use forge::pool::ServerSpec;
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::thread;

const UDP_HEADER_SIZE: usize = 8;

fn read_header(datagram: &[u8]) -> (u16, &[u8]) {
    let request_id = u16::from_be_bytes([datagram[0], datagram[1]]);
    (request_id, &datagram[UDP_HEADER_SIZE..])
}

fn frame(request_id: u16, sequence: u16, total: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(UDP_HEADER_SIZE + payload.len());
    out.extend_from_slice(&request_id.to_be_bytes());
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(payload);
    out
}

/// Replies to `get`, `set` and `version` over the UDP frame header. Replies
/// are split in two datagrams sent highest-sequence first.
fn spawn_udp_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();

    thread::spawn(move || {
        let mut store: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        let mut buf = [0u8; 65_507];

        loop {
            let (count, peer) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(_) => return,
            };
            let (request_id, payload) = read_header(&buf[..count]);

            let text = String::from_utf8_lossy(payload).into_owned();
            let mut lines = text.split("\r\n");
            let command = lines.next().unwrap_or("");
            let tokens: Vec<&str> = command.split_whitespace().collect();

            let reply: Vec<u8> = match tokens.first() {
                Some(&"set") => {
                    let key = tokens[1].as_bytes().to_vec();
                    let value = lines.next().unwrap_or("").as_bytes().to_vec();
                    store.insert(key, value);
                    b"STORED\r\n".to_vec()
                }
                Some(&"get") => {
                    let mut reply = Vec::new();
                    for key in &tokens[1..] {
                        if let Some(value) = store.get(key.as_bytes()) {
                            reply.extend_from_slice(
                                format!("VALUE {} 0 {}\r\n", key, value.len()).as_bytes(),
                            );
                            reply.extend_from_slice(value);
                            reply.extend_from_slice(b"\r\n");
                        }
                    }
                    reply.extend_from_slice(b"END\r\n");
                    reply
                }
                Some(&"version") => b"VERSION 1.6.0-mini\r\n".to_vec(),
                _ => b"ERROR\r\n".to_vec(),
            };

            // Fragment the reply and send the tail first.
            let middle = reply.len() / 2;
            let first = frame(request_id, 0, 2, &reply[..middle]);
            let second = frame(request_id, 1, 2, &reply[middle..]);
            drop(socket.send_to(&second, peer));
            drop(socket.send_to(&first, peer));
        }
    });

    addr
}

fn udp_client(addr: SocketAddr) -> Client {
    let mut config = ClientConfig::default();
    config.poll_timeout_millis = 5_000;
    config.udp_request_timeout_secs = 5;

    let spec = ServerSpec {
        host: addr.ip().to_string(),
        port: addr.port(),
        weight: 1,
        udp: true,
    };

    Client::new(config, vec![spec]).unwrap()
}

#[test]
fn test_udp_set_and_get_with_reordered_fragments() {
    let addr = spawn_udp_server();
    let mut client = udp_client(addr);

    assert_eq!(client.set(b"foo", b"bar", 0, 0), Status::Success);

    let fetched = client.get(b"foo").unwrap();
    assert_eq!(fetched.value, b"bar");

    assert_eq!(client.get(b"missing").unwrap_err(), Status::NotFound);
    assert_eq!(client.stats().get_misses.load(Ordering::Relaxed), 1);
}

#[test]
fn test_udp_timeout_counts_drop() {
    // Nothing listens here; the request times out and is counted.
    let blackhole = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = blackhole.local_addr().unwrap();

    let mut client = {
        let mut config = ClientConfig::default();
        config.poll_timeout_millis = 200;
        config.udp_request_timeout_secs = 1;
        let spec = ServerSpec {
            host: addr.ip().to_string(),
            port: addr.port(),
            weight: 1,
            udp: true,
        };
        Client::new(config, vec![spec]).unwrap()
    };

    match client.get(b"void") {
        Err(Status::Timeout { server: 0 }) => {}
        other => panic!("Unexpected result {:?}", other),
    }

    assert_eq!(client.stats().udp_timeout.load(Ordering::Relaxed), 1);
}
