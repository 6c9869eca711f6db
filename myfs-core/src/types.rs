//! Core type definitions shared across the volume engine.

use std::fmt;

use subtle::ConstantTimeEq;

use crate::format::{DIGEST_SIZE, SALT_SIZE};

// Identifiers

/// A 16-byte random volume identifier, assigned at format time.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VolumeId(pub [u8; 16]);

impl VolumeId {
    /// Creates a `VolumeId` from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generates a new random volume identifier.
    ///
    /// # Panics
    ///
    /// Panics if the system's random number generator fails.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Returns the raw bytes of the volume identifier.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Converts the volume identifier to a hexadecimal string.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeId({})", self.to_hex())
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for VolumeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A stable file entry identifier. Ids are monotonic and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl EntryId {
    /// Returns the numeric value of the id.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 32-byte SHA-256 digest over an entry's plaintext.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest(pub [u8; DIGEST_SIZE]);

impl ContentDigest {
    /// Creates a `ContentDigest` from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Constant-time comparison against another digest.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }

    /// Converts the digest to a hexadecimal string.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

// Enums

/// Lifecycle state of a file entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntryState {
    /// Entry is live and exportable.
    #[default]
    Active,
    /// Entry is recoverably deleted; the payload is untouched.
    SoftDeleted,
    /// Entry is scheduled for removal at the next purge.
    PendingPurge,
}

impl EntryState {
    /// Encodes the state as a single byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::SoftDeleted => 1,
            Self::PendingPurge => 2,
        }
    }

    /// Decodes a state byte, returning `None` for unknown values.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Active),
            1 => Some(Self::SoftDeleted),
            2 => Some(Self::PendingPurge),
            _ => None,
        }
    }
}

/// Output shape selected for an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    /// Decrypt and return the plaintext.
    Normal,
    /// Return the sealed blob for off-system backup.
    Raw,
}

// Locator

/// An `(offset, length)` reference into the container's data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator {
    /// Byte offset of the sealed payload within the container.
    pub offset: u64,
    /// Byte length of the sealed payload.
    pub length: u64,
}

impl Locator {
    /// Creates a new locator.
    #[must_use]
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Returns the first byte past the referenced run.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }
}

// File entry

/// A file entry in the volume's table.
///
/// Protected and unprotected entries share one shape: the wrapped file key is
/// present exactly when the entry is guarded by its own secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Stable entry id.
    pub id: EntryId,
    /// Display name (unique among active entries).
    pub name: String,
    /// Plaintext size in bytes.
    pub original_size: u64,
    /// Sealed payload size in bytes, including nonce and tag framing.
    pub ciphertext_size: u64,
    /// Unix timestamp of the import.
    pub imported_at: u64,
    /// Per-entry random salt.
    pub salt: [u8; SALT_SIZE],
    /// File key sealed under the master key; present iff subkey-protected.
    pub wrapped_key: Option<Vec<u8>>,
    /// SHA-256 digest over the plaintext.
    pub digest: ContentDigest,
    /// Location of the sealed payload in the data region.
    pub locator: Locator,
    /// Lifecycle state.
    pub state: EntryState,
    /// Unix timestamp of deletion; present in non-active states.
    pub deleted_at: Option<u64>,
}

impl FileEntry {
    /// Returns `true` if the entry is in the [`EntryState::Active`] state.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == EntryState::Active
    }

    /// Returns `true` if the entry is guarded by its own file secret.
    #[must_use]
    pub const fn is_protected(&self) -> bool {
        self.wrapped_key.is_some()
    }
}

/// Listing view of a file entry, safe to show to a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Stable entry id.
    pub id: EntryId,
    /// Display name.
    pub name: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Unix timestamp of the import.
    pub imported_at: u64,
    /// Whether the entry is guarded by its own secret.
    pub protected: bool,
    /// Lifecycle state.
    pub state: EntryState,
    /// Unix timestamp of deletion, if any.
    pub deleted_at: Option<u64>,
}

impl From<&FileEntry> for EntryInfo {
    fn from(entry: &FileEntry) -> Self {
        Self {
            id: entry.id,
            name: entry.name.clone(),
            size: entry.original_size,
            imported_at: entry.imported_at,
            protected: entry.is_protected(),
            state: entry.state,
            deleted_at: entry.deleted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_id_generate_unique() {
        let a = VolumeId::generate();
        let b = VolumeId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_volume_id_hex() {
        let id = VolumeId::new([0xAB; 16]);
        assert_eq!(id.to_hex(), "ab".repeat(16));
    }

    #[test]
    fn test_content_digest_matches() {
        let a = ContentDigest::new([1u8; 32]);
        let b = ContentDigest::new([1u8; 32]);
        let c = ContentDigest::new([2u8; 32]);
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_entry_state_roundtrip() {
        for state in [
            EntryState::Active,
            EntryState::SoftDeleted,
            EntryState::PendingPurge,
        ] {
            assert_eq!(EntryState::from_u8(state.as_u8()), Some(state));
        }
        assert_eq!(EntryState::from_u8(9), None);
    }

    #[test]
    fn test_locator_end() {
        let loc = Locator::new(100, 28);
        assert_eq!(loc.end(), 128);
    }
}
