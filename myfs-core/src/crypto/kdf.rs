//! Argon2id key derivation.
//!
//! Parameters are recorded in the volume header so that volumes formatted
//! under older defaults stay openable after the defaults change. Every
//! derivation mixes in exactly one domain separation label by prefixing it
//! to the salt input.

use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::{MyfsError, MyfsResult};
use crate::format::{KEY_SIZE, LABEL_FILE, LABEL_MACHINE, LABEL_MASTER, SALT_SIZE};

use super::{FileKey, MasterKey};

/// Argon2id cost parameters, persisted in the volume header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in bytes.
    pub memory_bytes: u64,
    /// Number of iterations (time cost).
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_bytes: 64 * 1024 * 1024,
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for unit tests. Unsafe for real volumes.
    #[must_use]
    pub const fn insecure_for_tests() -> Self {
        Self {
            memory_bytes: 8 * 1024 * 1024,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Derives a 256-bit key from a secret, a salt, and one domain label.
///
/// # Errors
///
/// Returns [`MyfsError::AuthFailed`] if the recorded parameters cannot
/// produce a key; corrupted parameters and wrong secrets are deliberately
/// indistinguishable at this boundary.
pub fn derive_key(
    secret: &[u8],
    salt: &[u8],
    label: &'static [u8],
    params: &KdfParams,
) -> MyfsResult<[u8; KEY_SIZE]> {
    let memory_kib =
        u32::try_from(params.memory_bytes / 1024).map_err(|_| MyfsError::AuthFailed)?;
    let argon_params = Params::new(
        memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|_| MyfsError::AuthFailed)?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut salt_input = Vec::with_capacity(label.len() + salt.len());
    salt_input.extend_from_slice(label);
    salt_input.extend_from_slice(salt);

    let mut key = [0u8; KEY_SIZE];
    argon
        .hash_password_into(secret, &salt_input, &mut key)
        .map_err(|_| MyfsError::AuthFailed)?;
    Ok(key)
}

/// Derives the volume master key from the master secret.
///
/// # Errors
///
/// See [`derive_key`].
pub fn derive_master_key(
    master_secret: &str,
    master_salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> MyfsResult<MasterKey> {
    derive_key(master_secret.as_bytes(), master_salt, LABEL_MASTER, params)
        .map(MasterKey::from_bytes)
}

/// Derives a per-file key from a file secret and the entry salt.
///
/// # Errors
///
/// See [`derive_key`].
pub fn derive_file_key(
    file_secret: &str,
    entry_salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> MyfsResult<FileKey> {
    derive_key(file_secret.as_bytes(), entry_salt, LABEL_FILE, params).map(FileKey::from_bytes)
}

/// Derives the machine binding key from a host fingerprint digest, salted by
/// the volume identifier.
///
/// # Errors
///
/// See [`derive_key`].
pub fn derive_machine_key(
    fingerprint: &[u8; 32],
    volume_id: &[u8; 16],
    params: &KdfParams,
) -> MyfsResult<[u8; KEY_SIZE]> {
    derive_key(fingerprint, volume_id, LABEL_MACHINE, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SALT: [u8; SALT_SIZE] = [7u8; SALT_SIZE];

    #[test]
    fn test_derivation_is_deterministic() {
        let params = KdfParams::insecure_for_tests();
        let a = derive_master_key("hunter2", &TEST_SALT, &params).unwrap();
        let b = derive_master_key("hunter2", &TEST_SALT, &params).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_secret_changes_key() {
        let params = KdfParams::insecure_for_tests();
        let a = derive_master_key("hunter2", &TEST_SALT, &params).unwrap();
        let b = derive_master_key("hunter3", &TEST_SALT, &params).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_salt_changes_key() {
        let params = KdfParams::insecure_for_tests();
        let a = derive_master_key("hunter2", &TEST_SALT, &params).unwrap();
        let b = derive_master_key("hunter2", &[8u8; SALT_SIZE], &params).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_label_separates_domains() {
        let params = KdfParams::insecure_for_tests();
        let master =
            derive_key(b"secret", &TEST_SALT, LABEL_MASTER, &params).unwrap();
        let file = derive_key(b"secret", &TEST_SALT, LABEL_FILE, &params).unwrap();
        assert_ne!(master, file);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = KdfParams {
            memory_bytes: 0,
            iterations: 0,
            parallelism: 0,
        };
        let result = derive_key(b"secret", &TEST_SALT, LABEL_MASTER, &params);
        assert!(matches!(result, Err(MyfsError::AuthFailed)));
    }
}
