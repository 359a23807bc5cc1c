use crate::error::{FailureKind, TransportError, TransportResult};
use crate::net::buffer::Buffer;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use flint::choose;
use std::io::Cursor;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;
pub const HEADER_SIZE: usize = 24;

const RAW_BYTES: u8 = 0x00;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    NoOp = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    AppendQ = 0x19,
    PrependQ = 0x1a,
    Touch = 0x1c,
    Gat = 0x1d,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Opcode> {
        let opcode = match value {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Increment,
            0x06 => Opcode::Decrement,
            0x07 => Opcode::Quit,
            0x08 => Opcode::Flush,
            0x09 => Opcode::GetQ,
            0x0a => Opcode::NoOp,
            0x0b => Opcode::Version,
            0x0c => Opcode::GetK,
            0x0d => Opcode::GetKQ,
            0x0e => Opcode::Append,
            0x0f => Opcode::Prepend,
            0x10 => Opcode::Stat,
            0x11 => Opcode::SetQ,
            0x12 => Opcode::AddQ,
            0x13 => Opcode::ReplaceQ,
            0x14 => Opcode::DeleteQ,
            0x19 => Opcode::AppendQ,
            0x1a => Opcode::PrependQ,
            0x1c => Opcode::Touch,
            0x1d => Opcode::Gat,
            0x20 => Opcode::SaslListMechs,
            0x21 => Opcode::SaslAuth,
            0x22 => Opcode::SaslStep,
            _ => return None,
        };

        Some(opcode)
    }

    /// Quiet variants elicit no response on success.
    pub fn is_quiet(self) -> bool {
        match self {
            Opcode::GetQ
            | Opcode::GetKQ
            | Opcode::SetQ
            | Opcode::AddQ
            | Opcode::ReplaceQ
            | Opcode::DeleteQ
            | Opcode::AppendQ
            | Opcode::PrependQ => true,
            _ => false,
        }
    }

    /// The quiet twin of a storage or delete opcode, used for `no_reply`.
    pub fn quiet(self) -> Opcode {
        match self {
            Opcode::Set => Opcode::SetQ,
            Opcode::Add => Opcode::AddQ,
            Opcode::Replace => Opcode::ReplaceQ,
            Opcode::Delete => Opcode::DeleteQ,
            Opcode::Append => Opcode::AppendQ,
            Opcode::Prepend => Opcode::PrependQ,
            Opcode::Get => Opcode::GetQ,
            Opcode::GetK => Opcode::GetKQ,
            other => other,
        }
    }
}

/// Extra fields carried ahead of the key in a request body.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Extras {
    None,
    /// 4-byte flags then 4-byte expiration, both big-endian.
    Storage { flags: u32, expiration: u32 },
    /// 4-byte expiration (touch, gat, flush-with-delay).
    Expiration(u32),
    /// 8-byte delta, 8-byte initial value, 4-byte expiration.
    Delta {
        delta: u64,
        initial: u64,
        expiration: u32,
    },
}

impl Extras {
    fn len(&self) -> usize {
        match self {
            Extras::None => 0,
            Extras::Storage { .. } => 8,
            Extras::Expiration(_) => 4,
            Extras::Delta { .. } => 20,
        }
    }

    fn write(&self, out: &mut [u8; 20]) -> usize {
        let mut cursor = Cursor::new(&mut out[..]);
        match *self {
            Extras::None => {}
            Extras::Storage { flags, expiration } => {
                cursor.write_u32::<BigEndian>(flags).expect("extras fit");
                cursor.write_u32::<BigEndian>(expiration).expect("extras fit");
            }
            Extras::Expiration(expiration) => {
                cursor.write_u32::<BigEndian>(expiration).expect("extras fit");
            }
            Extras::Delta {
                delta,
                initial,
                expiration,
            } => {
                cursor.write_u64::<BigEndian>(delta).expect("extras fit");
                cursor.write_u64::<BigEndian>(initial).expect("extras fit");
                cursor.write_u32::<BigEndian>(expiration).expect("extras fit");
            }
        }

        cursor.position() as usize
    }
}

/// One framed request. The prefix is sent ahead of the key and counts toward
/// the reported key length.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub opcode: Opcode,
    pub key: &'a [u8],
    pub prefix: &'a [u8],
    pub extras: Extras,
    pub value: &'a [u8],
    pub opaque: u32,
    pub cas: u64,
}

impl<'a> Request<'a> {
    pub fn bare(opcode: Opcode, opaque: u32) -> Request<'a> {
        Request {
            opcode,
            key: &[],
            prefix: &[],
            extras: Extras::None,
            value: &[],
            opaque,
            cas: 0,
        }
    }
}

/// Appends one framed request to the connection's write buffer. Header,
/// prefix, key and value are appended as separate segments.
pub fn write_request(buffer: &mut Buffer, request: &Request) -> TransportResult<()> {
    let key_len = request.prefix.len() + request.key.len();
    let extras_len = request.extras.len();
    let body_len = extras_len + key_len + request.value.len();

    let mut header = [0u8; HEADER_SIZE];
    {
        let mut cursor = Cursor::new(&mut header[..]);
        cursor.write_u8(MAGIC_REQUEST)?;
        cursor.write_u8(request.opcode as u8)?;
        cursor.write_u16::<BigEndian>(key_len as u16)?;
        cursor.write_u8(extras_len as u8)?;
        cursor.write_u8(RAW_BYTES)?;
        cursor.write_u16::<BigEndian>(0)?;
        cursor.write_u32::<BigEndian>(body_len as u32)?;
        cursor.write_u32::<BigEndian>(request.opaque)?;
        cursor.write_u64::<BigEndian>(request.cas)?;
    }

    let mut extras = [0u8; 20];
    let written = request.extras.write(&mut extras);

    buffer.extend_vectored(&[
        &header,
        &extras[..written],
        request.prefix,
        request.key,
        request.value,
    ])
}

/// A pipelined multi-key GET: quiet GETKQ for every key but the last, a GETK
/// for the last, then a NOOP barrier. The response stream ends at the NOOP
/// echo.
pub fn write_mget(
    buffer: &mut Buffer,
    keys: &[&[u8]],
    prefix: &[u8],
    opaque_base: u32,
) -> TransportResult<()> {
    for (index, key) in keys.iter().enumerate() {
        let last = index + 1 == keys.len();
        write_request(
            buffer,
            &Request {
                opcode: choose!(last => Opcode::GetK, Opcode::GetKQ),
                key,
                prefix,
                extras: Extras::None,
                value: &[],
                opaque: opaque_base.wrapping_add(index as u32),
                cas: 0,
            },
        )?;
    }

    write_request(
        buffer,
        &Request::bare(Opcode::NoOp, opaque_base.wrapping_add(keys.len() as u32)),
    )
}

/// One decoded response frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Response {
    pub opcode: Opcode,
    pub status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub flags: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Decodes one complete response from the head of `bytes`, returning it with
/// the number of bytes consumed. `Wait` until a whole frame has arrived.
pub fn decode_response(bytes: &[u8]) -> TransportResult<(Response, usize)> {
    if bytes.len() < HEADER_SIZE {
        return Err(TransportError::Wait);
    }

    let mut stream = bytes;
    let magic = stream.read_u8()?;
    if magic != MAGIC_RESPONSE {
        return Err(TransportError::Fatal(FailureKind::Protocol));
    }

    let opcode = Opcode::from_u8(stream.read_u8()?)
        .ok_or(TransportError::Fatal(FailureKind::Protocol))?;
    let key_len = stream.read_u16::<BigEndian>()? as usize;
    let extras_len = stream.read_u8()? as usize;
    let _data_type = stream.read_u8()?;
    let status = stream.read_u16::<BigEndian>()?;
    let body_len = stream.read_u32::<BigEndian>()? as usize;
    let opaque = stream.read_u32::<BigEndian>()?;
    let cas = stream.read_u64::<BigEndian>()?;

    if body_len < extras_len + key_len {
        return Err(TransportError::Fatal(FailureKind::Protocol));
    }

    if bytes.len() < HEADER_SIZE + body_len {
        return Err(TransportError::Wait);
    }

    let body = &bytes[HEADER_SIZE..HEADER_SIZE + body_len];
    let (extras, rest) = body.split_at(extras_len);
    let (key, value) = rest.split_at(key_len);
    let flags = if extras.len() >= 4 {
        BigEndian::read_u32(extras)
    } else {
        0
    };

    Ok((
        Response {
            opcode,
            status,
            opaque,
            cas,
            flags,
            key: key.to_vec(),
            value: value.to_vec(),
        },
        HEADER_SIZE + body_len,
    ))
}
