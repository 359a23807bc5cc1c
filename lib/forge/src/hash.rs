use serde_derive::{Deserialize, Serialize};

/// Hash capability carried by the client handle. Custom functions can be
/// injected through `ClientConfig::custom_hash`.
pub type HashFn = fn(&[u8]) -> u32;

/// Built-in key hash selectors. The distribution layer only ever sees
/// `hash(bytes) -> u32`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashKind {
    OneAtATime,
    Fnv1_32,
    Fnv1a_32,
    Crc32,
}

impl HashKind {
    #[inline]
    pub fn hash(self, bytes: &[u8]) -> u32 {
        match self {
            HashKind::OneAtATime => one_at_a_time(bytes),
            HashKind::Fnv1_32 => fnv1_32(bytes),
            HashKind::Fnv1a_32 => fnv1a_32(bytes),
            HashKind::Crc32 => crc32(bytes),
        }
    }
}

impl Default for HashKind {
    fn default() -> HashKind {
        HashKind::OneAtATime
    }
}

const FNV_32_INIT: u32 = 0x811c_9dc5;
const FNV_32_PRIME: u32 = 16_777_619;

/// Jenkins one-at-a-time, the historical default key hash.
pub fn one_at_a_time(bytes: &[u8]) -> u32 {
    let mut value: u32 = 0;

    for &byte in bytes {
        value = value.wrapping_add(u32::from(byte));
        value = value.wrapping_add(value << 10);
        value ^= value >> 6;
    }

    value = value.wrapping_add(value << 3);
    value ^= value >> 11;
    value.wrapping_add(value << 15)
}

pub fn fnv1_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_32_INIT, |hash, &byte| {
        hash.wrapping_mul(FNV_32_PRIME) ^ u32::from(byte)
    })
}

pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_32_INIT, |hash, &byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_32_PRIME)
    })
}

/// Bitwise CRC-32 (IEEE), folded to 15 bits the way the classic clients do.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc: u32 = !0;

    for &byte in bytes {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }

    ((!crc) >> 16) & 0x7fff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashes_are_deterministic() {
        for kind in &[
            HashKind::OneAtATime,
            HashKind::Fnv1_32,
            HashKind::Fnv1a_32,
            HashKind::Crc32,
        ] {
            assert_eq!(kind.hash(b"foo"), kind.hash(b"foo"));
            assert_ne!(kind.hash(b"foo"), kind.hash(b"bar"));
        }
    }

    #[test]
    fn test_fnv_known_vectors() {
        // FNV-1a("") is the offset basis; FNV-1a("a") is a published vector.
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1_32(b"a"), 0x050c_5d7e);
    }

    #[test]
    fn test_crc_is_folded() {
        for key in &[&b"foo"[..], b"bar", b"a-much-longer-key-0123456789"] {
            assert!(crc32(key) <= 0x7fff);
        }
    }
}
