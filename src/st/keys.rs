//! Byte-sortable key layout of the segment tree.
//!
//! segment:  `0x01 ‖ start(8B BE) ‖ end(8B BE) ‖ level(1B) ‖ uuid`
//! endpoint: `0x02 ‖ value(8B BE) ‖ level(1B) ‖ kind(1B) ‖ uuid`

use crate::{storage_error::StorageError, uuid_bytes::UuidBytes};

pub const SEGMENT_PREFIX: u8 = 0x01;
pub const ENDPOINT_PREFIX: u8 = 0x02;
/// Never stored; bounds per-node scans from above.
pub const LEVEL_SENTINEL: u8 = 0xff;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EndpointKind {
    Start = 0,
    End = 1,
}

impl EndpointKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(EndpointKind::Start),
            1 => Some(EndpointKind::End),
            _ => None,
        }
    }
}

pub fn segment_key(start: u64, end: u64, level: u8, uuid: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(18 + uuid.len());
    k.push(SEGMENT_PREFIX);
    k.extend_from_slice(&start.to_be_bytes());
    k.extend_from_slice(&end.to_be_bytes());
    k.push(level);
    k.extend_from_slice(uuid);
    k
}

pub fn endpoint_key(value: u64, level: u8, kind: EndpointKind, uuid: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(11 + uuid.len());
    k.push(ENDPOINT_PREFIX);
    k.extend_from_slice(&value.to_be_bytes());
    k.push(level);
    k.push(kind as u8);
    k.extend_from_slice(uuid);
    k
}

/// Smallest endpoint key at `value` (any level, kind, uuid).
pub fn endpoint_floor(value: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(9);
    k.push(ENDPOINT_PREFIX);
    k.extend_from_slice(&value.to_be_bytes());
    k
}

/// Original interval stored under every canonical segment key.
pub fn encode_value(start: u64, end: u64) -> [u8; 16] {
    let mut v = [0u8; 16];
    v[..8].copy_from_slice(&start.to_be_bytes());
    v[8..].copy_from_slice(&end.to_be_bytes());
    v
}

fn be_u64(b: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(b.get(..8)?.try_into().ok()?))
}

pub fn decode_value(v: &[u8]) -> Result<(u64, u64), StorageError> {
    match (be_u64(v), v.get(8..).and_then(be_u64)) {
        (Some(s), Some(e)) if v.len() == 16 => Ok((s, e)),
        _ => Err(StorageError::Codec(format!("bad segment value ({} bytes)", v.len()))),
    }
}

pub struct DecodedSegment {
    pub start: u64,
    pub end: u64,
    pub level: u8,
    pub uuid: UuidBytes,
}

pub fn decode_segment_key(k: &[u8]) -> Result<DecodedSegment, StorageError> {
    let bad = || StorageError::Codec(format!("bad segment key ({} bytes)", k.len()));
    if k.first() != Some(&SEGMENT_PREFIX) || k.len() != 34 {
        return Err(bad());
    }
    Ok(DecodedSegment {
        start: be_u64(&k[1..9]).ok_or_else(bad)?,
        end: be_u64(&k[9..17]).ok_or_else(bad)?,
        level: k[17],
        uuid: UuidBytes::from_slice(&k[18..]).ok_or_else(bad)?,
    })
}

pub struct DecodedEndpoint {
    pub value: u64,
    pub level: u8,
    pub kind: EndpointKind,
    pub uuid: UuidBytes,
}

pub fn decode_endpoint_key(k: &[u8]) -> Result<DecodedEndpoint, StorageError> {
    let bad = || StorageError::Codec(format!("bad endpoint key ({} bytes)", k.len()));
    if k.first() != Some(&ENDPOINT_PREFIX) || k.len() != 27 {
        return Err(bad());
    }
    Ok(DecodedEndpoint {
        value: be_u64(&k[1..9]).ok_or_else(bad)?,
        level: k[9],
        kind: EndpointKind::from_byte(k[10]).ok_or_else(bad)?,
        uuid: UuidBytes::from_slice(&k[11..]).ok_or_else(bad)?,
    })
}
