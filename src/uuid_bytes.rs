use std::fmt;

use uuid::Uuid;

/// Opaque 16-byte identifier used for segment-tree entries.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct UuidBytes([u8; 16]);

impl UuidBytes {
    pub fn new() -> Self {
        UuidBytes(*Uuid::new_v4().as_bytes())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        UuidBytes(bytes)
    }

    /// Rebuild an id from a key suffix. `None` unless exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(UuidBytes(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for UuidBytes {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UuidBytes {
    fn from(u: Uuid) -> Self {
        UuidBytes(*u.as_bytes())
    }
}

impl From<UuidBytes> for Uuid {
    fn from(b: UuidBytes) -> Self {
        Uuid::from_bytes(b.0)
    }
}

impl AsRef<[u8]> for UuidBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for UuidBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}
