use crate::error::{FailureKind, TransportError, TransportResult};
use crate::net::buffer::Buffer;
use std::io::Write;

/// Lines longer than this cannot be legal replies.
const MAX_LINE: usize = 8192;

const CRLF: &[u8] = b"\r\n";

/// Storage-class verbs sharing the `<cmd> <key> <flags> <exp> <bytes>` form.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StorageVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

impl StorageVerb {
    fn token(self) -> &'static str {
        match self {
            StorageVerb::Set => "set",
            StorageVerb::Add => "add",
            StorageVerb::Replace => "replace",
            StorageVerb::Append => "append",
            StorageVerb::Prepend => "prepend",
            StorageVerb::Cas => "cas",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeltaVerb {
    Incr,
    Decr,
}

impl DeltaVerb {
    fn token(self) -> &'static str {
        match self {
            DeltaVerb::Incr => "incr",
            DeltaVerb::Decr => "decr",
        }
    }
}

/// `<cmd> <key> <flags> <exp> <bytes> [<cas>] [noreply]\r\n<data>\r\n`
#[allow(clippy::too_many_arguments)]
pub fn write_storage(
    buffer: &mut Buffer,
    verb: StorageVerb,
    key: &[u8],
    prefix: &[u8],
    flags: u32,
    expiration: u32,
    value: &[u8],
    cas: Option<u64>,
    noreply: bool,
) -> TransportResult<()> {
    let mut line = Vec::with_capacity(64 + prefix.len() + key.len());
    line.extend_from_slice(verb.token().as_bytes());
    line.push(b' ');
    line.extend_from_slice(prefix);
    line.extend_from_slice(key);
    write!(line, " {} {} {}", flags, expiration, value.len())?;
    if let Some(cas) = cas {
        write!(line, " {}", cas)?;
    }
    if noreply {
        line.extend_from_slice(b" noreply");
    }
    line.extend_from_slice(CRLF);

    buffer.extend_vectored(&[&line, value, CRLF])
}

/// `get|gets <key>*\r\n`
pub fn write_get(
    buffer: &mut Buffer,
    keys: &[&[u8]],
    prefix: &[u8],
    with_cas: bool,
) -> TransportResult<()> {
    let mut line = Vec::with_capacity(8 + keys.len() * (prefix.len() + 16));
    line.extend_from_slice(if with_cas { b"gets" } else { b"get" });
    for key in keys {
        line.push(b' ');
        line.extend_from_slice(prefix);
        line.extend_from_slice(key);
    }
    line.extend_from_slice(CRLF);

    buffer.extend(&line)
}

pub fn write_delta(
    buffer: &mut Buffer,
    verb: DeltaVerb,
    key: &[u8],
    prefix: &[u8],
    delta: u64,
    noreply: bool,
) -> TransportResult<()> {
    let mut line = Vec::with_capacity(32 + prefix.len() + key.len());
    line.extend_from_slice(verb.token().as_bytes());
    line.push(b' ');
    line.extend_from_slice(prefix);
    line.extend_from_slice(key);
    write!(line, " {}", delta)?;
    if noreply {
        line.extend_from_slice(b" noreply");
    }
    line.extend_from_slice(CRLF);

    buffer.extend(&line)
}

/// `delete <key> [<exp>] [noreply]`. The expiration form is the legacy
/// defer-delete; the value is forwarded verbatim and the server's verdict is
/// surfaced unmodified.
pub fn write_delete(
    buffer: &mut Buffer,
    key: &[u8],
    prefix: &[u8],
    expiration: u32,
    noreply: bool,
) -> TransportResult<()> {
    let mut line = Vec::with_capacity(32 + prefix.len() + key.len());
    line.extend_from_slice(b"delete ");
    line.extend_from_slice(prefix);
    line.extend_from_slice(key);
    if expiration > 0 {
        write!(line, " {}", expiration)?;
    }
    if noreply {
        line.extend_from_slice(b" noreply");
    }
    line.extend_from_slice(CRLF);

    buffer.extend(&line)
}

pub fn write_flush(buffer: &mut Buffer, expiration: Option<u32>, noreply: bool) -> TransportResult<()> {
    let mut line = Vec::with_capacity(32);
    line.extend_from_slice(b"flush_all");
    if let Some(expiration) = expiration {
        write!(line, " {}", expiration)?;
    }
    if noreply {
        line.extend_from_slice(b" noreply");
    }
    line.extend_from_slice(CRLF);

    buffer.extend(&line)
}

pub fn write_stats(buffer: &mut Buffer, name: Option<&[u8]>) -> TransportResult<()> {
    let mut line = Vec::with_capacity(16);
    line.extend_from_slice(b"stats");
    if let Some(name) = name {
        line.push(b' ');
        line.extend_from_slice(name);
    }
    line.extend_from_slice(CRLF);

    buffer.extend(&line)
}

pub fn write_version(buffer: &mut Buffer) -> TransportResult<()> {
    buffer.extend(b"version\r\n")
}

pub fn write_quit(buffer: &mut Buffer) -> TransportResult<()> {
    buffer.extend(b"quit\r\n")
}

/// One parsed server reply.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AsciiEvent {
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Touched,
    Ok,
    End,
    Error,
    Value {
        key: Vec<u8>,
        flags: u32,
        cas: Option<u64>,
        data: Vec<u8>,
    },
    Stat {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Number(u64),
    Version(String),
    ClientError(String),
    ServerError(String),
}

struct PendingValue {
    key: Vec<u8>,
    flags: u32,
    cas: Option<u64>,
    len: usize,
}

/// Line-driven reply parser. One parser per connection; the only state
/// carried between calls is a `VALUE` header whose data block has not fully
/// arrived yet.
pub struct AsciiParser {
    pending: Option<PendingValue>,
}

impl AsciiParser {
    pub fn new() -> AsciiParser {
        AsciiParser { pending: None }
    }

    /// Drops any half-parsed state. Called when the connection resets.
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Parses one event out of `buffer`, consuming exactly the bytes that
    /// formed it. `Wait` until a full line (and data block) has arrived.
    pub fn parse(&mut self, buffer: &mut Buffer) -> TransportResult<AsciiEvent> {
        if let Some(pending) = self.pending.take() {
            return self.finish_value(buffer, pending);
        }

        let line = match take_line(buffer)? {
            Some(line) => line,
            None => return Err(TransportError::Wait),
        };

        let mut tokens = line.split(|&byte| byte == b' ').filter(|t| !t.is_empty());
        let verb = tokens.next().unwrap_or(&[]);

        match verb {
            b"STORED" => Ok(AsciiEvent::Stored),
            b"NOT_STORED" => Ok(AsciiEvent::NotStored),
            b"EXISTS" => Ok(AsciiEvent::Exists),
            b"NOT_FOUND" => Ok(AsciiEvent::NotFound),
            b"DELETED" => Ok(AsciiEvent::Deleted),
            b"TOUCHED" => Ok(AsciiEvent::Touched),
            b"OK" => Ok(AsciiEvent::Ok),
            b"END" => Ok(AsciiEvent::End),
            b"ERROR" => Ok(AsciiEvent::Error),
            b"CLIENT_ERROR" => Ok(AsciiEvent::ClientError(rest_of(&line, verb.len()))),
            b"SERVER_ERROR" => Ok(AsciiEvent::ServerError(rest_of(&line, verb.len()))),
            b"VERSION" => Ok(AsciiEvent::Version(rest_of(&line, verb.len()))),
            b"STAT" => {
                let key = tokens
                    .next()
                    .ok_or(TransportError::Fatal(FailureKind::Protocol))?
                    .to_vec();
                let offset = line.len() - rest_after_tokens(&line, 2).len();
                Ok(AsciiEvent::Stat {
                    key,
                    value: line[offset..].to_vec(),
                })
            }
            b"VALUE" => {
                let key = tokens
                    .next()
                    .ok_or(TransportError::Fatal(FailureKind::Protocol))?
                    .to_vec();
                let flags = parse_u64(tokens.next())? as u32;
                let len = parse_u64(tokens.next())? as usize;
                let cas = match tokens.next() {
                    Some(token) => Some(parse_u64(Some(token))?),
                    None => None,
                };

                self.finish_value(buffer, PendingValue { key, flags, cas, len })
            }
            digits if !digits.is_empty() && digits.iter().all(|b| b.is_ascii_digit()) => {
                Ok(AsciiEvent::Number(parse_u64(Some(digits))?))
            }
            _ => Err(TransportError::Fatal(FailureKind::Protocol)),
        }
    }

    fn finish_value(
        &mut self,
        buffer: &mut Buffer,
        pending: PendingValue,
    ) -> TransportResult<AsciiEvent> {
        if buffer.len() < pending.len + CRLF.len() {
            self.pending = Some(pending);
            return Err(TransportError::Wait);
        }

        let bytes = buffer.read_slice();
        if &bytes[pending.len..pending.len + 2] != CRLF {
            return Err(TransportError::Fatal(FailureKind::Protocol));
        }

        let data = bytes[..pending.len].to_vec();
        buffer.consume(pending.len + 2);

        Ok(AsciiEvent::Value {
            key: pending.key,
            flags: pending.flags,
            cas: pending.cas,
            data,
        })
    }
}

/// Takes one CRLF-terminated line off the buffer, excluding the terminator.
fn take_line(buffer: &mut Buffer) -> TransportResult<Option<Vec<u8>>> {
    let bytes = buffer.read_slice();

    match bytes.windows(2).position(|window| window == CRLF) {
        Some(position) => {
            let line = bytes[..position].to_vec();
            buffer.consume(position + 2);
            Ok(Some(line))
        }
        None => {
            if bytes.len() > MAX_LINE {
                return Err(TransportError::Fatal(FailureKind::Protocol));
            }
            Ok(None)
        }
    }
}

/// Everything after the verb, trimmed of the separating space.
fn rest_of(line: &[u8], verb_len: usize) -> String {
    let rest = &line[verb_len.min(line.len())..];
    let rest = rest.strip_prefix(b" ").unwrap_or(rest);
    String::from_utf8_lossy(rest).into_owned()
}

/// The tail of the line after `skip` space-separated tokens.
fn rest_after_tokens(line: &[u8], skip: usize) -> &[u8] {
    let mut rest = line;
    for _ in 0..skip {
        match rest.iter().position(|&byte| byte == b' ') {
            Some(position) => rest = &rest[position + 1..],
            None => return &[],
        }
    }
    rest
}

fn parse_u64(token: Option<&[u8]>) -> TransportResult<u64> {
    let token = token.ok_or(TransportError::Fatal(FailureKind::Protocol))?;
    std::str::from_utf8(token)
        .ok()
        .and_then(|text| text.parse::<u64>().ok())
        .ok_or(TransportError::Fatal(FailureKind::Protocol))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(bytes: &[u8]) -> Buffer {
        let mut buffer = Buffer::unbounded();
        buffer.extend(bytes).unwrap();
        buffer
    }

    #[test]
    fn test_storage_line() {
        let mut buffer = Buffer::unbounded();
        write_storage(
            &mut buffer,
            StorageVerb::Set,
            b"foo",
            b"",
            13,
            300,
            b"bar",
            None,
            false,
        )
        .unwrap();

        assert_eq!(buffer.read_slice(), b"set foo 13 300 3\r\nbar\r\n");
    }

    #[test]
    fn test_cas_line_carries_token_and_noreply() {
        let mut buffer = Buffer::unbounded();
        write_storage(
            &mut buffer,
            StorageVerb::Cas,
            b"foo",
            b"pre:",
            0,
            0,
            b"x",
            Some(42),
            true,
        )
        .unwrap();

        assert_eq!(buffer.read_slice(), b"cas pre:foo 0 0 1 42 noreply\r\nx\r\n");
    }

    #[test]
    fn test_get_lines() {
        let mut buffer = Buffer::unbounded();
        write_get(&mut buffer, &[b"a", b"b"], b"", false).unwrap();
        assert_eq!(buffer.read_slice(), b"get a b\r\n");

        let mut buffer = Buffer::unbounded();
        write_get(&mut buffer, &[b"a"], b"p-", true).unwrap();
        assert_eq!(buffer.read_slice(), b"gets p-a\r\n");
    }

    #[test]
    fn test_delete_lines() {
        let mut buffer = Buffer::unbounded();
        write_delete(&mut buffer, b"k", b"", 0, false).unwrap();
        assert_eq!(buffer.read_slice(), b"delete k\r\n");

        let mut buffer = Buffer::unbounded();
        write_delete(&mut buffer, b"k", b"", 77, false).unwrap();
        assert_eq!(buffer.read_slice(), b"delete k 77\r\n");
    }

    #[test]
    fn test_admin_lines() {
        let mut buffer = Buffer::unbounded();
        write_flush(&mut buffer, Some(10), false).unwrap();
        write_stats(&mut buffer, Some(b"items")).unwrap();
        write_version(&mut buffer).unwrap();

        assert_eq!(
            buffer.read_slice(),
            b"flush_all 10\r\nstats items\r\nversion\r\n".as_ref()
        );
    }

    #[test]
    fn test_parse_terminators() {
        let cases: &[(&[u8], AsciiEvent)] = &[
            (b"STORED\r\n", AsciiEvent::Stored),
            (b"NOT_STORED\r\n", AsciiEvent::NotStored),
            (b"EXISTS\r\n", AsciiEvent::Exists),
            (b"NOT_FOUND\r\n", AsciiEvent::NotFound),
            (b"DELETED\r\n", AsciiEvent::Deleted),
            (b"TOUCHED\r\n", AsciiEvent::Touched),
            (b"OK\r\n", AsciiEvent::Ok),
            (b"END\r\n", AsciiEvent::End),
            (b"ERROR\r\n", AsciiEvent::Error),
        ];

        for (bytes, expected) in cases {
            let mut parser = AsciiParser::new();
            let mut buffer = buffer_with(bytes);
            assert_eq!(&parser.parse(&mut buffer).unwrap(), expected);
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_parse_value_reply() {
        let mut parser = AsciiParser::new();
        let mut buffer = buffer_with(b"VALUE foo 13 3 99\r\nbar\r\nEND\r\n");

        assert_eq!(
            parser.parse(&mut buffer).unwrap(),
            AsciiEvent::Value {
                key: b"foo".to_vec(),
                flags: 13,
                cas: Some(99),
                data: b"bar".to_vec(),
            }
        );
        assert_eq!(parser.parse(&mut buffer).unwrap(), AsciiEvent::End);
    }

    #[test]
    fn test_parse_value_roundtrip() {
        // Encoding a VALUE reply and parsing it yields the original tuple.
        let mut buffer = Buffer::unbounded();
        let data = b"some value\x00with bytes";
        let mut line = Vec::new();
        write!(line, "VALUE the-key 7 {} 123", data.len()).unwrap();
        line.extend_from_slice(b"\r\n");
        buffer.extend(&line).unwrap();
        buffer.extend(data).unwrap();
        buffer.extend(b"\r\n").unwrap();

        let mut parser = AsciiParser::new();
        match parser.parse(&mut buffer).unwrap() {
            AsciiEvent::Value {
                key,
                flags,
                cas,
                data: parsed,
            } => {
                assert_eq!(key, b"the-key");
                assert_eq!(flags, 7);
                assert_eq!(cas, Some(123));
                assert_eq!(parsed, data);
            }
            event => panic!("Unexpected event {:?}", event),
        }
    }

    #[test]
    fn test_parse_value_waits_for_data() {
        let mut parser = AsciiParser::new();
        let mut buffer = buffer_with(b"VALUE foo 0 5\r\nab");

        assert_eq!(parser.parse(&mut buffer).unwrap_err(), TransportError::Wait);

        buffer.extend(b"cde\r\n").unwrap();
        match parser.parse(&mut buffer).unwrap() {
            AsciiEvent::Value { data, cas, .. } => {
                assert_eq!(data, b"abcde");
                assert_eq!(cas, None);
            }
            event => panic!("Unexpected event {:?}", event),
        }
    }

    #[test]
    fn test_parse_value_rejects_missing_terminator() {
        let mut parser = AsciiParser::new();
        let mut buffer = buffer_with(b"VALUE foo 0 3\r\nbarXY");

        assert_eq!(
            parser.parse(&mut buffer).unwrap_err(),
            TransportError::Fatal(FailureKind::Protocol)
        );
    }

    #[test]
    fn test_parse_number_and_version() {
        let mut parser = AsciiParser::new();
        let mut buffer = buffer_with(b"42\r\nVERSION 1.6.21\r\n");

        assert_eq!(parser.parse(&mut buffer).unwrap(), AsciiEvent::Number(42));
        assert_eq!(
            parser.parse(&mut buffer).unwrap(),
            AsciiEvent::Version("1.6.21".to_owned())
        );
    }

    #[test]
    fn test_parse_stat_and_errors() {
        let mut parser = AsciiParser::new();
        let mut buffer =
            buffer_with(b"STAT pid 1234\r\nCLIENT_ERROR cannot increment or decrement non-numeric value\r\nSERVER_ERROR out of memory\r\n");

        assert_eq!(
            parser.parse(&mut buffer).unwrap(),
            AsciiEvent::Stat {
                key: b"pid".to_vec(),
                value: b"1234".to_vec(),
            }
        );
        assert_eq!(
            parser.parse(&mut buffer).unwrap(),
            AsciiEvent::ClientError(
                "cannot increment or decrement non-numeric value".to_owned()
            )
        );
        assert_eq!(
            parser.parse(&mut buffer).unwrap(),
            AsciiEvent::ServerError("out of memory".to_owned())
        );
    }

    #[test]
    fn test_parse_waits_for_line() {
        let mut parser = AsciiParser::new();
        let mut buffer = buffer_with(b"STOR");

        assert_eq!(parser.parse(&mut buffer).unwrap_err(), TransportError::Wait);
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let mut parser = AsciiParser::new();
        let mut buffer = buffer_with(b"WHATEVER 1 2\r\n");

        assert_eq!(
            parser.parse(&mut buffer).unwrap_err(),
            TransportError::Fatal(FailureKind::Protocol)
        );
    }

    #[test]
    fn test_parse_rejects_unterminated_flood() {
        let mut parser = AsciiParser::new();
        let mut buffer = buffer_with(&vec![b'a'; MAX_LINE + 1]);

        assert_eq!(
            parser.parse(&mut buffer).unwrap_err(),
            TransportError::Fatal(FailureKind::Protocol)
        );
    }
}
