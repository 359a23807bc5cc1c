use crate::error::{FailureKind, TransportError, TransportResult};
use std::io;

/// Free suffix below which `consume` compacts the parsed-out head.
const COMPACT_THRESHOLD: usize = 1024;
/// Granularity of socket reads into the buffer.
const READ_CHUNK: usize = 4096;

/// Hard cap for a UDP datagram buffer.
pub const UDP_BUFFER_MAX: usize = 64 * 1024;
/// Soft cap at which TCP request coalescing stops and the buffer is flushed.
pub const TCP_COALESCE_CAP: usize = 1024 * 1024;

/// A growable FIFO byte buffer with a head cursor. Data is appended at the
/// tail and parsed from the head; already-parsed bytes are discarded lazily
/// and the storage is compacted only when the free suffix runs low.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    limit: usize,
}

impl Buffer {
    #[inline]
    pub fn new(limit: usize) -> Buffer {
        Buffer {
            data: Vec::new(),
            head: 0,
            limit,
        }
    }

    /// Buffer without a hard cap (TCP side; coalescing applies the soft cap).
    #[inline]
    pub fn unbounded() -> Buffer {
        Buffer::new(usize::MAX)
    }

    /// The number of unparsed bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slice containing the unparsed data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Advances the head past `count` parsed bytes.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        self.head += count;

        if self.head == self.data.len() {
            self.clear();
        } else if self.data.capacity() - self.data.len() < COMPACT_THRESHOLD {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Appends `bytes`, growing fallibly.
    pub fn extend(&mut self, bytes: &[u8]) -> TransportResult<()> {
        self.reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Appends several segments (header, prefix, payload) with a single
    /// reservation so framing never copies through an intermediate.
    pub fn extend_vectored(&mut self, parts: &[&[u8]]) -> TransportResult<()> {
        let total: usize = parts.iter().map(|part| part.len()).sum();
        self.reserve(total)?;

        for part in parts {
            self.data.extend_from_slice(part);
        }

        Ok(())
    }

    fn reserve(&mut self, additional: usize) -> TransportResult<()> {
        if self.len() + additional > self.limit {
            return Err(TransportError::Fatal(FailureKind::Memory));
        }

        self.data
            .try_reserve(additional)
            .map_err(|_| TransportError::Fatal(FailureKind::Memory))
    }

    /// Reads all currently available data from `reader` into the buffer.
    /// Returns the number of bytes read; a clean end-of-stream with no
    /// progress surfaces as `UnexpectedEof`.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut total = 0;

        loop {
            if self.data.len() >= self.limit {
                return Ok(total);
            }

            let old_len = self.data.len();
            let want = READ_CHUNK.min(self.limit - old_len);
            if self.data.try_reserve(want).is_err() {
                return Err(io::ErrorKind::OutOfMemory.into());
            }
            self.data.resize(old_len + want, 0);

            match reader.read(&mut self.data[old_len..]) {
                Ok(0) => {
                    self.data.truncate(old_len);
                    if total == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    return Ok(total);
                }
                Ok(count) => {
                    self.data.truncate(old_len + count);
                    total += count;
                }
                Err(err) => {
                    self.data.truncate(old_len);
                    if err.kind() == io::ErrorKind::WouldBlock {
                        return Ok(total);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Writes the buffered data to `writer`, advancing the head. Returns the
    /// number of bytes written; stops early when the writer would block.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;

        while !self.is_empty() {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    total += count;
                }
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        return Ok(total);
                    }
                    return Err(err);
                }
            }
        }

        Ok(total)
    }
}

/// `byteorder` writers target the buffer directly.
impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.extend(buf) {
            Ok(()) => Ok(buf.len()),
            Err(_) => Err(io::ErrorKind::OutOfMemory.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..10_000).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::unbounded();

        let count = buffer.ingress(&mut channel).unwrap();
        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert!(buffer.is_empty());
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_egress_partial_on_would_block() {
        let mut channel = MockChannel::new(Vec::new(), 3, 3);
        let mut buffer = Buffer::unbounded();
        buffer.extend(b"abcdef").unwrap();

        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, 3);
        assert_eq!(buffer.read_slice(), b"def");
        assert_eq!(&channel.data[..], b"abc");
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        struct ZeroWriter;

        impl io::Write for ZeroWriter {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buffer = Buffer::unbounded();
        buffer.extend(&[1]).unwrap();

        let result = buffer.egress(&mut ZeroWriter);

        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_ingress_eof_without_progress() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let mut buffer = Buffer::unbounded();

        let result = buffer.ingress(&mut cursor);

        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_ingress_respects_limit() {
        let data = vec![7u8; UDP_BUFFER_MAX + 500];
        let mut channel = MockChannel::new(data, 4096, 0);

        let mut buffer = Buffer::new(UDP_BUFFER_MAX);
        let count = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, UDP_BUFFER_MAX);
        assert_eq!(buffer.len(), UDP_BUFFER_MAX);
    }

    #[test]
    fn test_extend_over_limit() {
        let mut buffer = Buffer::new(4);

        assert!(buffer.extend(b"abcd").is_ok());
        assert_eq!(
            buffer.extend(b"e").unwrap_err(),
            TransportError::Fatal(FailureKind::Memory)
        );
    }

    #[test]
    fn test_consume_resets_when_drained() {
        let mut buffer = Buffer::unbounded();
        buffer.extend(b"abcdef").unwrap();

        buffer.consume(2);
        assert_eq!(buffer.read_slice(), b"cdef");

        buffer.consume(4);
        assert!(buffer.is_empty());
        assert_eq!(buffer.head, 0);
    }

    #[test]
    fn test_compaction_keeps_unparsed_tail() {
        let mut buffer = Buffer::unbounded();
        let payload: Vec<u8> = (0..8192).map(|i| i as u8).collect();
        buffer.extend(&payload).unwrap();

        // Parse out most of the head, then force the free suffix low by
        // appending until close to capacity.
        buffer.consume(8000);
        while buffer.data.capacity() - buffer.data.len() >= COMPACT_THRESHOLD {
            buffer.extend(&[1u8; 512]).unwrap();
        }
        let before = buffer.len();
        buffer.extend(b"xy").unwrap();
        buffer.consume(1);

        assert_eq!(buffer.head, 0);
        assert_eq!(buffer.len(), before + 1);
    }

    #[test]
    fn test_vectored_append() {
        let mut buffer = Buffer::unbounded();
        buffer
            .extend_vectored(&[b"head", b"", b"prefix", b"payload"])
            .unwrap();

        assert_eq!(buffer.read_slice(), b"headprefixpayload");
    }

    #[test]
    fn test_write_impl() {
        use byteorder::{BigEndian, WriteBytesExt};

        let mut buffer = Buffer::unbounded();
        buffer.write_u16::<BigEndian>(0x0102).unwrap();
        buffer.write_u32::<BigEndian>(0x0304_0506).unwrap();

        assert_eq!(buffer.read_slice(), &[1, 2, 3, 4, 5, 6]);
    }
}
