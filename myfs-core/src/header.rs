//! Container and sidecar header encoding.
//!
//! The header's leading 54 bytes (magic through KDF parameters) are sealed
//! by an AEAD tag: the 16-byte volume identifier encrypted under the master
//! key with those bytes as associated data. Opening the tag and recovering
//! the volume id is the sole acceptance check for a candidate master secret.
//!
//! The pointer fields at offsets 98..122 are outside the sealed prefix so a
//! commit can flip them without re-deriving the tag; a stale or mangled
//! pointer is caught when the table segment fails to open.

// Binary format code uses small constant casts that are safe
#![allow(clippy::cast_possible_truncation)]

use crate::crypto::aead;
use crate::crypto::kdf::KdfParams;
use crate::crypto::MasterKey;
use crate::error::{MyfsError, MyfsResult};
use crate::format::{
    FILE_MAGIC, FORMAT_VERSION, HEADER_NONCE_OFFSET, HEADER_POINTER_SIZE, HEADER_SEALED_PREFIX,
    HEADER_SIZE, HEADER_TAG_OFFSET, HEADER_TAG_SIZE, NONCE_SIZE, SALT_SIZE, SIDECAR_PREFIX_SIZE,
};
use crate::types::VolumeId;

/// Decoded container header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHeader {
    /// Format version.
    pub version: u16,
    /// Volume identifier.
    pub volume_id: VolumeId,
    /// Per-volume master salt.
    pub master_salt: [u8; SALT_SIZE],
    /// KDF parameters the master key was derived under.
    pub kdf: KdfParams,
    /// Byte offset of the sealed table segment.
    pub table_offset: u64,
    /// Byte length of the sealed table segment.
    pub table_length: u64,
    /// Byte offset where the data region begins.
    pub data_offset: u64,
}

/// The nonce and sealed identity carried at header offsets 54..98.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderTag {
    /// AEAD nonce for the header tag.
    pub nonce: [u8; NONCE_SIZE],
    /// Sealed volume id (16-byte ciphertext + 16-byte tag).
    pub sealed: [u8; HEADER_TAG_SIZE],
}

impl VolumeHeader {
    /// Creates a header for a freshly formatted volume.
    #[must_use]
    pub const fn new(
        volume_id: VolumeId,
        master_salt: [u8; SALT_SIZE],
        kdf: KdfParams,
        table_offset: u64,
        table_length: u64,
        data_offset: u64,
    ) -> Self {
        Self {
            version: FORMAT_VERSION,
            volume_id,
            master_salt,
            kdf,
            table_offset,
            table_length,
            data_offset,
        }
    }

    /// Encodes the sealed prefix: bytes 0..54.
    #[must_use]
    pub fn encode_prefix(&self) -> [u8; HEADER_SEALED_PREFIX] {
        let mut buf = [0u8; HEADER_SEALED_PREFIX];
        buf[0..4].copy_from_slice(FILE_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6..22].copy_from_slice(self.volume_id.as_bytes());
        buf[22..38].copy_from_slice(&self.master_salt);
        buf[38..46].copy_from_slice(&self.kdf.memory_bytes.to_be_bytes());
        buf[46..50].copy_from_slice(&self.kdf.iterations.to_be_bytes());
        buf[50..54].copy_from_slice(&self.kdf.parallelism.to_be_bytes());
        buf
    }

    /// Encodes the pointer fields rewritten on commit: bytes 98..122.
    #[must_use]
    pub fn encode_pointers(&self) -> [u8; HEADER_POINTER_SIZE] {
        let mut buf = [0u8; HEADER_POINTER_SIZE];
        buf[0..8].copy_from_slice(&self.table_offset.to_be_bytes());
        buf[8..16].copy_from_slice(&self.table_length.to_be_bytes());
        buf[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        buf
    }

    /// Encodes the full 122-byte header, sealing a fresh tag under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if sealing fails.
    pub fn seal_and_encode(&self, key: &MasterKey) -> MyfsResult<[u8; HEADER_SIZE as usize]> {
        let prefix = self.encode_prefix();
        let nonce: [u8; NONCE_SIZE] = crate::crypto::random_bytes();
        let sealed =
            aead::seal_with_nonce(key.as_bytes(), &nonce, &prefix, self.volume_id.as_bytes())?;

        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[..HEADER_SEALED_PREFIX].copy_from_slice(&prefix);
        buf[HEADER_NONCE_OFFSET..HEADER_NONCE_OFFSET + NONCE_SIZE].copy_from_slice(&nonce);
        buf[HEADER_TAG_OFFSET..HEADER_TAG_OFFSET + HEADER_TAG_SIZE].copy_from_slice(&sealed);
        buf[98..122].copy_from_slice(&self.encode_pointers());
        Ok(buf)
    }

    /// Decodes a header without verifying the tag.
    ///
    /// Only structural checks run here; the caller verifies the tag once a
    /// candidate master key is available.
    ///
    /// # Errors
    ///
    /// Returns [`MyfsError::Unrecoverable`] on truncation, bad magic, or an
    /// unsupported version.
    pub fn decode(bytes: &[u8]) -> MyfsResult<(Self, HeaderTag)> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(MyfsError::unrecoverable("container header truncated"));
        }
        if &bytes[0..4] != FILE_MAGIC {
            return Err(MyfsError::unrecoverable("bad container magic"));
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(MyfsError::unrecoverable(format!(
                "unsupported container version {version}"
            )));
        }

        let mut volume_id = [0u8; 16];
        volume_id.copy_from_slice(&bytes[6..22]);
        let mut master_salt = [0u8; SALT_SIZE];
        master_salt.copy_from_slice(&bytes[22..38]);

        let kdf = KdfParams {
            memory_bytes: u64::from_be_bytes(bytes[38..46].try_into().expect("slice length is 8")),
            iterations: u32::from_be_bytes(bytes[46..50].try_into().expect("slice length is 4")),
            parallelism: u32::from_be_bytes(bytes[50..54].try_into().expect("slice length is 4")),
        };

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[HEADER_NONCE_OFFSET..HEADER_NONCE_OFFSET + NONCE_SIZE]);
        let mut sealed = [0u8; HEADER_TAG_SIZE];
        sealed.copy_from_slice(&bytes[HEADER_TAG_OFFSET..HEADER_TAG_OFFSET + HEADER_TAG_SIZE]);

        let table_offset = u64::from_be_bytes(bytes[98..106].try_into().expect("slice length is 8"));
        let table_length =
            u64::from_be_bytes(bytes[106..114].try_into().expect("slice length is 8"));
        let data_offset = u64::from_be_bytes(bytes[114..122].try_into().expect("slice length is 8"));

        Ok((
            Self {
                version,
                volume_id: VolumeId::new(volume_id),
                master_salt,
                kdf,
                table_offset,
                table_length,
                data_offset,
            },
            HeaderTag { nonce, sealed },
        ))
    }

    /// Verifies the header tag under a candidate master key.
    ///
    /// # Errors
    ///
    /// Returns [`MyfsError::AuthFailed`] if the tag does not open or does not
    /// recover the volume id. A wrong secret and a tampered header are
    /// indistinguishable here by design.
    pub fn verify_tag(&self, tag: &HeaderTag, key: &MasterKey) -> MyfsResult<()> {
        let prefix = self.encode_prefix();
        let opened = aead::open_with_nonce(key.as_bytes(), &tag.nonce, &prefix, &tag.sealed)?;
        if opened.as_slice() == self.volume_id.as_bytes() {
            Ok(())
        } else {
            Err(MyfsError::AuthFailed)
        }
    }

    /// Encodes the sidecar prefix: volume id, master salt, and KDF
    /// parameters, byte-identical to container offsets 6..54.
    #[must_use]
    pub fn encode_sidecar_prefix(&self) -> [u8; SIDECAR_PREFIX_SIZE as usize] {
        let mut buf = [0u8; SIDECAR_PREFIX_SIZE as usize];
        buf[0..16].copy_from_slice(self.volume_id.as_bytes());
        buf[16..32].copy_from_slice(&self.master_salt);
        buf[32..40].copy_from_slice(&self.kdf.memory_bytes.to_be_bytes());
        buf[40..44].copy_from_slice(&self.kdf.iterations.to_be_bytes());
        buf[44..48].copy_from_slice(&self.kdf.parallelism.to_be_bytes());
        buf
    }
}

/// Decoded sidecar prefix fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarPrefix {
    /// Volume identifier.
    pub volume_id: VolumeId,
    /// Per-volume master salt.
    pub master_salt: [u8; SALT_SIZE],
    /// KDF parameters.
    pub kdf: KdfParams,
}

impl SidecarPrefix {
    /// Decodes the 48-byte sidecar prefix.
    ///
    /// # Errors
    ///
    /// Returns [`MyfsError::Unrecoverable`] if the prefix is truncated.
    pub fn decode(bytes: &[u8]) -> MyfsResult<Self> {
        if bytes.len() < SIDECAR_PREFIX_SIZE as usize {
            return Err(MyfsError::unrecoverable("sidecar prefix truncated"));
        }
        let mut volume_id = [0u8; 16];
        volume_id.copy_from_slice(&bytes[0..16]);
        let mut master_salt = [0u8; SALT_SIZE];
        master_salt.copy_from_slice(&bytes[16..32]);
        let kdf = KdfParams {
            memory_bytes: u64::from_be_bytes(bytes[32..40].try_into().expect("slice length is 8")),
            iterations: u32::from_be_bytes(bytes[40..44].try_into().expect("slice length is 4")),
            parallelism: u32::from_be_bytes(bytes[44..48].try_into().expect("slice length is 4")),
        };
        Ok(Self {
            volume_id: VolumeId::new(volume_id),
            master_salt,
            kdf,
        })
    }
}
