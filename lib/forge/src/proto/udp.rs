use crate::error::{FailureKind, TransportError, TransportResult};
use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;

/// Per-datagram frame header: request id, sequence number, total datagrams,
/// reserved. All big-endian.
pub const UDP_HEADER_SIZE: usize = 8;

/// Payload bytes carried per outgoing datagram.
pub const UDP_MAX_PAYLOAD: usize = 1400;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct UdpHeader {
    pub request_id: u16,
    pub sequence: u16,
    pub total: u16,
}

pub fn write_header(out: &mut [u8], header: UdpHeader) {
    BigEndian::write_u16(&mut out[0..2], header.request_id);
    BigEndian::write_u16(&mut out[2..4], header.sequence);
    BigEndian::write_u16(&mut out[4..6], header.total);
    BigEndian::write_u16(&mut out[6..8], 0);
}

/// Splits the datagram into its header and payload.
pub fn read_header(datagram: &[u8]) -> TransportResult<(UdpHeader, &[u8])> {
    if datagram.len() < UDP_HEADER_SIZE {
        return Err(TransportError::Fatal(FailureKind::Protocol));
    }

    let header = UdpHeader {
        request_id: BigEndian::read_u16(&datagram[0..2]),
        sequence: BigEndian::read_u16(&datagram[2..4]),
        total: BigEndian::read_u16(&datagram[4..6]),
    };

    Ok((header, &datagram[UDP_HEADER_SIZE..]))
}

/// Frames `payload` into one or more datagrams under `request_id`.
pub fn write_datagrams(request_id: u16, payload: &[u8]) -> Vec<Vec<u8>> {
    let total = (payload.len().max(1) + UDP_MAX_PAYLOAD - 1) / UDP_MAX_PAYLOAD;
    let mut datagrams = Vec::with_capacity(total);

    for (sequence, chunk) in payload.chunks(UDP_MAX_PAYLOAD).enumerate() {
        let mut datagram = vec![0u8; UDP_HEADER_SIZE + chunk.len()];
        write_header(
            &mut datagram,
            UdpHeader {
                request_id,
                sequence: sequence as u16,
                total: total as u16,
            },
        );
        datagram[UDP_HEADER_SIZE..].copy_from_slice(chunk);
        datagrams.push(datagram);
    }

    datagrams
}

struct PendingRequest {
    fragments: Vec<Option<Vec<u8>>>,
    received: u16,
    started_at: u64,
}

/// Accounting returned by an eviction sweep: datagrams lost and requests
/// abandoned.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct EvictReport {
    pub dropped_fragments: u64,
    pub timed_out_requests: u64,
}

/// Reassembles out-of-order response datagrams keyed by request id. Requests
/// whose fragments stop arriving are evicted by the periodic sweep.
pub struct Reassembly {
    pending: HashMap<u16, PendingRequest>,
}

impl Reassembly {
    pub fn new() -> Reassembly {
        Reassembly {
            pending: HashMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Feeds one datagram. Returns the reassembled payload once every
    /// fragment of the request has arrived.
    pub fn push(&mut self, datagram: &[u8], now: u64) -> TransportResult<Option<(u16, Vec<u8>)>> {
        let (header, payload) = read_header(datagram)?;

        if header.total == 0 || header.sequence >= header.total {
            return Err(TransportError::Fatal(FailureKind::Protocol));
        }

        let entry = self
            .pending
            .entry(header.request_id)
            .or_insert_with(|| PendingRequest {
                fragments: vec![None; header.total as usize],
                received: 0,
                started_at: now,
            });

        if entry.fragments.len() != header.total as usize {
            return Err(TransportError::Fatal(FailureKind::Protocol));
        }

        let slot = &mut entry.fragments[header.sequence as usize];
        if slot.is_none() {
            *slot = Some(payload.to_vec());
            entry.received += 1;
        }

        if usize::from(entry.received) < entry.fragments.len() {
            return Ok(None);
        }

        let entry = self
            .pending
            .remove(&header.request_id)
            .expect("completed request present");
        let mut assembled = Vec::new();
        for fragment in entry.fragments {
            assembled.extend_from_slice(&fragment.expect("all fragments received"));
        }

        Ok(Some((header.request_id, assembled)))
    }

    /// Evicts requests older than `timeout` seconds. Missing fragments count
    /// as drops only when the request made partial progress, matching the
    /// packet counters.
    pub fn evict_expired(&mut self, now: u64, timeout: u64) -> EvictReport {
        let mut report = EvictReport::default();

        self.pending.retain(|_, entry| {
            if now.saturating_sub(entry.started_at) <= timeout {
                return true;
            }

            if entry.received > 0 {
                report.dropped_fragments += (entry.fragments.len() - usize::from(entry.received)) as u64;
            }
            report.timed_out_requests += 1;
            false
        });

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(request_id: u16, sequence: u16, total: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; UDP_HEADER_SIZE + payload.len()];
        write_header(
            &mut out,
            UdpHeader {
                request_id,
                sequence,
                total,
            },
        );
        out[UDP_HEADER_SIZE..].copy_from_slice(payload);
        out
    }

    #[test]
    fn test_header_roundtrip() {
        let frame = datagram(0x0102, 3, 7, b"xyz");
        let (header, payload) = read_header(&frame).unwrap();

        assert_eq!(header.request_id, 0x0102);
        assert_eq!(header.sequence, 3);
        assert_eq!(header.total, 7);
        assert_eq!(payload, b"xyz");
        // Reserved word stays zero.
        assert_eq!(&frame[6..8], &[0, 0]);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut reassembly = Reassembly::new();

        assert_eq!(reassembly.push(&datagram(9, 2, 3, b"C"), 0).unwrap(), None);
        assert_eq!(reassembly.push(&datagram(9, 0, 3, b"A"), 0).unwrap(), None);
        let (id, payload) = reassembly.push(&datagram(9, 1, 3, b"B"), 0).unwrap().unwrap();

        assert_eq!(id, 9);
        assert_eq!(payload, b"ABC");
        assert!(reassembly.is_empty());
    }

    #[test]
    fn test_duplicate_fragments_are_ignored() {
        let mut reassembly = Reassembly::new();

        assert_eq!(reassembly.push(&datagram(1, 0, 2, b"A"), 0).unwrap(), None);
        assert_eq!(reassembly.push(&datagram(1, 0, 2, b"A"), 0).unwrap(), None);
        let (_, payload) = reassembly.push(&datagram(1, 1, 2, b"B"), 0).unwrap().unwrap();

        assert_eq!(payload, b"AB");
    }

    #[test]
    fn test_eviction_counts_missing_fragments() {
        let mut reassembly = Reassembly::new();

        // Three datagrams expected, only the first ever arrives.
        reassembly.push(&datagram(4, 2, 3, b"C"), 100).unwrap();

        let report = reassembly.evict_expired(105, 10);
        assert_eq!(report, EvictReport::default());

        let report = reassembly.evict_expired(111, 10);
        assert_eq!(report.dropped_fragments, 2);
        assert_eq!(report.timed_out_requests, 1);
        assert!(reassembly.is_empty());
    }

    #[test]
    fn test_eviction_without_progress_counts_no_drops() {
        let mut reassembly = Reassembly::new();
        reassembly.push(&datagram(5, 0, 4, b"A"), 0).unwrap();
        // Simulate an entry that recorded nothing (all fragments lost after
        // the tracking slot was created).
        reassembly.pending.get_mut(&5).unwrap().received = 0;
        reassembly.pending.get_mut(&5).unwrap().fragments[0] = None;

        let report = reassembly.evict_expired(11, 10);
        assert_eq!(report.dropped_fragments, 0);
        assert_eq!(report.timed_out_requests, 1);
    }

    #[test]
    fn test_rejects_malformed_headers() {
        let mut reassembly = Reassembly::new();

        assert_eq!(
            reassembly.push(&[0u8; 4], 0).unwrap_err(),
            TransportError::Fatal(FailureKind::Protocol)
        );
        assert_eq!(
            reassembly.push(&datagram(1, 0, 0, b""), 0).unwrap_err(),
            TransportError::Fatal(FailureKind::Protocol)
        );
        assert_eq!(
            reassembly.push(&datagram(1, 5, 3, b""), 0).unwrap_err(),
            TransportError::Fatal(FailureKind::Protocol)
        );
    }

    #[test]
    fn test_total_mismatch_is_protocol_error() {
        let mut reassembly = Reassembly::new();
        reassembly.push(&datagram(2, 0, 3, b"A"), 0).unwrap();

        assert_eq!(
            reassembly.push(&datagram(2, 1, 4, b"B"), 0).unwrap_err(),
            TransportError::Fatal(FailureKind::Protocol)
        );
    }

    #[test]
    fn test_write_datagrams_split() {
        let payload = vec![7u8; UDP_MAX_PAYLOAD + 10];
        let datagrams = write_datagrams(33, &payload);

        assert_eq!(datagrams.len(), 2);
        let (first, _) = read_header(&datagrams[0]).unwrap();
        let (second, tail) = read_header(&datagrams[1]).unwrap();
        assert_eq!(first.total, 2);
        assert_eq!(second.sequence, 1);
        assert_eq!(tail.len(), 10);

        let single = write_datagrams(1, b"abc");
        assert_eq!(single.len(), 1);
    }
}
