//! Machine identity and the binding record.
//!
//! A volume is bound to the host it was formatted on. The binding record
//! (`<container>.machine`) holds the volume id and an HMAC-SHA-256 of that
//! id under a key derived from the host fingerprint; the fingerprint itself
//! never reaches disk. Fingerprint inputs are the machine uuid, the primary
//! MAC address, the CPU identifier, and the OS name, lowercased and joined
//! with single newlines before hashing.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::crypto::kdf::{derive_machine_key, KdfParams};
use crate::error::{MyfsError, MyfsResult};
use crate::format::MACHINE_RECORD_SIZE;
use crate::types::VolumeId;

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 digest over the canonicalized host identifiers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Collects the fingerprint of the local host.
    ///
    /// Identifiers that cannot be read contribute an empty component, so the
    /// fingerprint stays stable across permission differences on the same
    /// host.
    #[must_use]
    pub fn collect() -> Self {
        Self::from_inputs(
            &host::machine_uuid(),
            &host::primary_mac(),
            &host::cpu_identifier(),
            std::env::consts::OS,
        )
    }

    /// Builds a fingerprint from explicit identifier components.
    #[must_use]
    pub fn from_inputs(machine_uuid: &str, mac: &str, cpu: &str, os: &str) -> Self {
        let canonical = [machine_uuid, mac, cpu, os]
            .map(|part| part.trim().to_lowercase())
            .join("\n");
        let hash = Sha256::digest(canonical.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The fingerprint must never leak into logs in a recoverable form.
        f.debug_struct("Fingerprint").finish_non_exhaustive()
    }
}

/// The on-disk machine binding record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineBinding {
    volume_id: VolumeId,
    mac: [u8; 32],
}

impl MachineBinding {
    /// Issues a binding record authorizing the fingerprinted host for a
    /// volume.
    ///
    /// # Errors
    ///
    /// Returns an error if key derivation fails.
    pub fn issue(
        fingerprint: &Fingerprint,
        volume_id: VolumeId,
        kdf: &KdfParams,
    ) -> MyfsResult<Self> {
        let key = derive_machine_key(fingerprint.as_bytes(), volume_id.as_bytes(), kdf)?;
        let mut mac_ctx =
            HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
        mac_ctx.update(volume_id.as_bytes());
        let mut mac = [0u8; 32];
        mac.copy_from_slice(&mac_ctx.finalize().into_bytes());
        Ok(Self { volume_id, mac })
    }

    /// Encodes the 48-byte record.
    #[must_use]
    pub fn encode(&self) -> [u8; MACHINE_RECORD_SIZE] {
        let mut buf = [0u8; MACHINE_RECORD_SIZE];
        buf[0..16].copy_from_slice(self.volume_id.as_bytes());
        buf[16..48].copy_from_slice(&self.mac);
        buf
    }

    /// Decodes a binding record.
    ///
    /// # Errors
    ///
    /// Returns [`MyfsError::AuthFailed`] on malformed input; no detail about
    /// the failure is surfaced.
    pub fn decode(bytes: &[u8]) -> MyfsResult<Self> {
        if bytes.len() != MACHINE_RECORD_SIZE {
            return Err(MyfsError::AuthFailed);
        }
        let mut volume_id = [0u8; 16];
        volume_id.copy_from_slice(&bytes[0..16]);
        let mut mac = [0u8; 32];
        mac.copy_from_slice(&bytes[16..48]);
        Ok(Self {
            volume_id: VolumeId::new(volume_id),
            mac,
        })
    }

    /// Verifies that the record authorizes `fingerprint` for `volume_id`.
    ///
    /// # Errors
    ///
    /// Returns [`MyfsError::AuthFailed`] on any mismatch.
    pub fn verify(
        &self,
        fingerprint: &Fingerprint,
        volume_id: &VolumeId,
        kdf: &KdfParams,
    ) -> MyfsResult<()> {
        if self.volume_id != *volume_id {
            return Err(MyfsError::AuthFailed);
        }
        let key = derive_machine_key(fingerprint.as_bytes(), volume_id.as_bytes(), kdf)?;
        let mut mac_ctx =
            HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
        mac_ctx.update(volume_id.as_bytes());
        mac_ctx
            .verify_slice(&self.mac)
            .map_err(|_| MyfsError::AuthFailed)
    }
}

/// Best-effort readers for stable host identifiers.
mod host {
    use std::path::Path;

    pub fn machine_uuid() -> String {
        #[cfg(target_os = "linux")]
        {
            read_trimmed("/etc/machine-id")
                .or_else(|| read_trimmed("/var/lib/dbus/machine-id"))
                .unwrap_or_default()
        }
        #[cfg(not(target_os = "linux"))]
        {
            String::new()
        }
    }

    pub fn primary_mac() -> String {
        #[cfg(target_os = "linux")]
        {
            let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
                return String::new();
            };
            let mut names: Vec<String> = entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name != "lo")
                .collect();
            names.sort();
            for name in names {
                if let Some(addr) =
                    read_trimmed(format!("/sys/class/net/{name}/address"))
                {
                    if !addr.is_empty() && addr != "00:00:00:00:00:00" {
                        return addr;
                    }
                }
            }
            String::new()
        }
        #[cfg(not(target_os = "linux"))]
        {
            String::new()
        }
    }

    pub fn cpu_identifier() -> String {
        #[cfg(target_os = "linux")]
        {
            let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") else {
                return String::new();
            };
            cpuinfo
                .lines()
                .find(|line| line.starts_with("model name"))
                .and_then(|line| line.split(':').nth(1))
                .map(str::trim)
                .unwrap_or_default()
                .to_string()
        }
        #[cfg(not(target_os = "linux"))]
        {
            String::new()
        }
    }

    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    fn read_trimmed<P: AsRef<Path>>(path: P) -> Option<String> {
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
    }
}
