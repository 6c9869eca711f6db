//! Container format constants and layout definitions.
//!
//! This module pins the binary layout of the container header, the sidecar
//! prefix, the machine binding record, and the AEAD framing shared by every
//! sealed segment.

// Layout comments describe binary structure, not Rust identifiers
#![allow(clippy::doc_markdown)]

/// Magic bytes at the start of every container file.
pub const FILE_MAGIC: &[u8; 4] = b"MFS1";

/// Current container format version.
pub const FORMAT_VERSION: u16 = 1;

/// Current file table format version.
pub const TABLE_VERSION: u16 = 1;

/// Size of the fixed container header in bytes.
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     magic ("MFS1")
/// 4       2     format version (u16 BE)
/// 6       16    volume identifier
/// 22      16    master salt
/// 38      8     KDF memory cost in bytes (u64 BE)
/// 46      4     KDF iterations (u32 BE)
/// 50      4     KDF parallelism (u32 BE)
/// 54      12    header AEAD nonce
/// 66      32    header AEAD tag (sealed volume id, AAD = bytes 0..54)
/// 98      8     table segment offset (u64 BE)
/// 106     8     table segment length (u64 BE)
/// 114     8     data region offset (u64 BE)
/// ```
pub const HEADER_SIZE: u64 = 122;

/// End of the header prefix covered by the header AEAD tag.
pub const HEADER_SEALED_PREFIX: usize = 54;

/// Byte offset of the header nonce.
pub const HEADER_NONCE_OFFSET: usize = 54;

/// Byte offset of the header tag.
pub const HEADER_TAG_OFFSET: usize = 66;

/// Byte offset of the table/data pointer fields rewritten on commit.
pub const HEADER_POINTER_OFFSET: u64 = 98;

/// Size of the pointer fields (table offset + table length + data offset).
pub const HEADER_POINTER_SIZE: usize = 24;

/// Size of the sidecar prefix: volume id, master salt, and KDF parameters,
/// encoded exactly as container bytes 6..54.
pub const SIDECAR_PREFIX_SIZE: u64 = 48;

/// Size of the machine binding record: volume id followed by an
/// HMAC-SHA-256 of the volume id under the machine-derived key.
pub const MACHINE_RECORD_SIZE: usize = 48;

/// Size of a ChaCha20-Poly1305 nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of a Poly1305 authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Framing overhead of every sealed segment: `nonce || ciphertext || tag`.
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Size of the sealed header tag field (16-byte ciphertext + 16-byte tag).
pub const HEADER_TAG_SIZE: usize = 32;

/// Size of every symmetric key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the master salt and of per-entry salts in bytes.
pub const SALT_SIZE: usize = 16;

/// Size of a SHA-256 content digest in bytes.
pub const DIGEST_SIZE: usize = 32;

/// Domain separation label for master key derivation.
pub const LABEL_MASTER: &[u8] = b"mfs/master";

/// Domain separation label for per-file key derivation; also the associated
/// data role label for payload and wrapped-key seals.
pub const LABEL_FILE: &[u8] = b"mfs/file";

/// Associated data role label for the sealed file table.
pub const LABEL_TABLE: &[u8] = b"mfs/table";

/// Domain separation label for the machine binding key.
pub const LABEL_MACHINE: &[u8] = b"mfs/machine";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(HEADER_SIZE, 122);
        assert_eq!(HEADER_TAG_OFFSET + HEADER_TAG_SIZE, 98);
        assert_eq!(HEADER_POINTER_OFFSET + HEADER_POINTER_SIZE as u64, HEADER_SIZE);
        assert_eq!(SIDECAR_PREFIX_SIZE, 48);
        assert_eq!(SEAL_OVERHEAD, 28);
    }
}
