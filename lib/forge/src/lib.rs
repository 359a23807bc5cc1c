//! Client-side access layer for a memcached-class distributed cache.
//!
//! The crate maps logical key operations onto a pool of TCP/UDP connections
//! to a configured set of backend servers. Keys are distributed with a
//! pluggable hash over either a modulo or a consistent-hash (ketama) ring,
//! and requests are framed in either the ASCII or the binary wire protocol.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod client;
pub mod config;
pub mod error;
pub mod hash;
pub mod net;
pub mod pool;
pub mod proto;
pub mod ring;
pub mod stats;
