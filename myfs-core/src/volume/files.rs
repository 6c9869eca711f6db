//! File operations: import, export, secrets, deletion, and purge.
//!
//! Every mutating operation snapshots the in-memory table and records the
//! container length before touching anything; on failure both are restored
//! so the on-disk state is exactly the pre-operation state.

use std::collections::BTreeMap;
use std::path::Path;

use subtle::ConstantTimeEq;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::crypto::kdf::{derive_file_key, derive_key, derive_master_key};
use crate::crypto::{aead, compute_digest, random_bytes, FileKey, MasterKey};
use crate::error::{MyfsError, MyfsResult};
use crate::format::{KEY_SIZE, LABEL_MASTER, SALT_SIZE};
use crate::store::VolumeStore;
use crate::types::{ContentDigest, EntryId, EntryInfo, EntryState, ExportMode, FileEntry};

use super::{unix_now, Volume};

/// How the current payload key is proven for a secret change.
enum PayloadAuth<'a> {
    /// The entry is sealed directly under the master key.
    Master,
    /// The entry's file secret is supplied.
    FileSecret(&'a str),
    /// The wrapped file key is opened with the master key alone.
    ForceMaster,
}

impl<S: VolumeStore> Volume<S> {
    /// Lists entries. Active entries always appear; deleted ones only when
    /// `include_deleted` is set.
    #[must_use]
    pub fn entries(&self, include_deleted: bool) -> Vec<EntryInfo> {
        self.table()
            .entries()
            .filter(|entry| include_deleted || entry.is_active())
            .map(EntryInfo::from)
            .collect()
    }

    /// Imports a file into the volume under `name`.
    ///
    /// With a file secret the payload is sealed under a key derived from it
    /// and that key is wrapped under the master key; otherwise the payload
    /// is sealed directly under the master key.
    ///
    /// # Errors
    ///
    /// `NameTaken` if an active entry already uses the name. Soft-deleted
    /// entries may share it.
    pub fn import(
        &mut self,
        name: &str,
        data: &[u8],
        file_secret: Option<&str>,
    ) -> MyfsResult<EntryId> {
        self.ensure_active()?;
        if self.table().find_by_name(name, false).is_some() {
            return Err(MyfsError::name_taken(name));
        }

        let digest = compute_digest(data);
        let salt: [u8; SALT_SIZE] = random_bytes();
        let kdf = self.header().kdf;
        let (sealed, wrapped_key) = match file_secret {
            Some(secret) => {
                let file_key = derive_file_key(secret, &salt, &kdf)?;
                let sealed =
                    aead::seal(file_key.as_bytes(), &Self::payload_aad(&salt), data)?;
                let wrapped = aead::seal(
                    self.master_key().as_bytes(),
                    &self.wrap_aad(),
                    file_key.as_bytes(),
                )?;
                (sealed, Some(wrapped))
            }
            None => (
                aead::seal(self.master_key().as_bytes(), &Self::payload_aad(&salt), data)?,
                None,
            ),
        };

        let snapshot = self.snapshot_table();
        let saved_len = self.container_mut().len()?;
        let result = self.import_commit(name, data.len() as u64, digest, salt, wrapped_key, &sealed);
        match result {
            Ok(id) => {
                info!(entry = name, id = %id, protected = file_secret.is_some(), "imported");
                Ok(id)
            }
            Err(e) => {
                self.restore_table(snapshot);
                let _ = self.container_mut().set_len(saved_len);
                let _ = self.container_mut().sync();
                Err(e)
            }
        }
    }

    fn import_commit(
        &mut self,
        name: &str,
        original_size: u64,
        digest: ContentDigest,
        salt: [u8; SALT_SIZE],
        wrapped_key: Option<Vec<u8>>,
        sealed: &[u8],
    ) -> MyfsResult<EntryId> {
        let locator = self.append_payload(sealed)?;
        let id = self.table_mut().allocate_id();
        self.table_mut().insert(FileEntry {
            id,
            name: name.to_string(),
            original_size,
            ciphertext_size: sealed.len() as u64,
            imported_at: unix_now(),
            salt,
            wrapped_key,
            digest,
            locator,
            state: EntryState::Active,
            deleted_at: None,
        })?;
        self.commit()?;
        Ok(id)
    }

    /// Imports a file from the local filesystem, named after its final path
    /// component.
    ///
    /// # Errors
    ///
    /// Everything [`Volume::import`] can return, plus I/O failures reading
    /// the source.
    pub fn import_from_path<P: AsRef<Path>>(
        &mut self,
        source: P,
        file_secret: Option<&str>,
    ) -> MyfsResult<EntryId> {
        let source = source.as_ref();
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                MyfsError::io(
                    format!("importing {}", source.display()),
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "unusable file name"),
                )
            })?
            .to_string();
        let data = std::fs::read(source)
            .map_err(|e| MyfsError::io(format!("reading {}", source.display()), e))?;
        self.import(&name, &data, file_secret)
    }

    /// Exports an active entry.
    ///
    /// In [`ExportMode::Normal`] the plaintext is returned after its digest
    /// is checked against the stored one. In [`ExportMode::Raw`] the sealed
    /// blob is returned as stored; for subkey-protected entries the per-file
    /// salt is prepended so the blob stays portable.
    ///
    /// # Errors
    ///
    /// `NotFound` for missing or deleted names, `AuthFailed` for a missing
    /// or wrong file secret, `IntegrityFailed` when the payload does not
    /// verify (the entry is then marked for purge).
    pub fn export(
        &mut self,
        name: &str,
        file_secret: Option<&str>,
        mode: ExportMode,
    ) -> MyfsResult<Vec<u8>> {
        self.ensure_active()?;
        let entry = self
            .table()
            .find_by_name(name, false)
            .ok_or_else(|| MyfsError::not_found(name))?;
        let id = entry.id;
        let salt = entry.salt;
        let protected = entry.is_protected();
        let stored_digest = entry.digest;

        let sealed = self.read_payload(id)?;
        match mode {
            ExportMode::Raw => {
                debug!(entry = name, "raw export");
                if protected {
                    let mut out = Vec::with_capacity(SALT_SIZE + sealed.len());
                    out.extend_from_slice(&salt);
                    out.extend_from_slice(&sealed);
                    Ok(out)
                } else {
                    Ok(sealed)
                }
            }
            ExportMode::Normal => {
                let plaintext = if protected {
                    let secret = file_secret.ok_or(MyfsError::AuthFailed)?;
                    let key = derive_file_key(secret, &salt, &self.header().kdf)?;
                    aead::open(key.as_bytes(), &Self::payload_aad(&salt), &sealed)?
                } else {
                    match aead::open(
                        self.master_key().as_bytes(),
                        &Self::payload_aad(&salt),
                        &sealed,
                    ) {
                        Ok(plaintext) => plaintext,
                        Err(_) => return Err(self.quarantine(id, name)),
                    }
                };

                if !compute_digest(&plaintext).matches(&stored_digest) {
                    return Err(self.quarantine(id, name));
                }
                debug!(entry = name, "exported");
                Ok(plaintext)
            }
        }
    }

    /// Exports an entry to a filesystem path, returning the byte count.
    ///
    /// # Errors
    ///
    /// Everything [`Volume::export`] can return, plus I/O failures writing
    /// the destination.
    pub fn export_to_path<P: AsRef<Path>>(
        &mut self,
        name: &str,
        file_secret: Option<&str>,
        mode: ExportMode,
        destination: P,
    ) -> MyfsResult<u64> {
        let bytes = self.export(name, file_secret, mode)?;
        let destination = destination.as_ref();
        std::fs::write(destination, &bytes)
            .map_err(|e| MyfsError::io(format!("writing {}", destination.display()), e))?;
        Ok(bytes.len() as u64)
    }

    /// Marks a verification failure: the entry goes to `PendingPurge` and an
    /// audit record is emitted. Returns the error to surface.
    pub(crate) fn quarantine(&mut self, id: EntryId, name: &str) -> MyfsError {
        error!(entry = name, "payload failed verification; marking for purge");
        let snapshot = self.snapshot_table();
        let marked = self
            .table_mut()
            .transition(id, EntryState::PendingPurge, unix_now())
            .and_then(|()| self.commit());
        if marked.is_err() {
            self.restore_table(snapshot);
        }
        MyfsError::integrity(name)
    }

    /// Adds a file secret to an unprotected entry.
    ///
    /// # Errors
    ///
    /// `AuthFailed` if the entry is already protected.
    pub fn add_file_secret(&mut self, name: &str, new_secret: &str) -> MyfsResult<()> {
        self.ensure_active()?;
        self.change_secret_inner(name, PayloadAuth::Master, new_secret)
    }

    /// Changes an entry's file secret, proving knowledge of the current one.
    ///
    /// # Errors
    ///
    /// `AuthFailed` if the entry is unprotected or the current secret is
    /// wrong.
    pub fn change_file_secret(
        &mut self,
        name: &str,
        current_secret: &str,
        new_secret: &str,
    ) -> MyfsResult<()> {
        self.ensure_active()?;
        self.change_secret_inner(name, PayloadAuth::FileSecret(current_secret), new_secret)
    }

    /// Re-keys an entry under a new secret using only the master secret.
    /// Works on protected entries (via the wrapped key) and unprotected
    /// ones (equivalent to adding a secret).
    ///
    /// # Errors
    ///
    /// `NotFound` if no active entry has this name.
    pub fn force_change_file_secret(&mut self, name: &str, new_secret: &str) -> MyfsResult<()> {
        self.ensure_active()?;
        self.change_secret_inner(name, PayloadAuth::ForceMaster, new_secret)
    }

    fn change_secret_inner(
        &mut self,
        name: &str,
        auth: PayloadAuth<'_>,
        new_secret: &str,
    ) -> MyfsResult<()> {
        let entry = self
            .table()
            .find_by_name(name, false)
            .ok_or_else(|| MyfsError::not_found(name))?;
        let id = entry.id;
        let salt = entry.salt;
        let protected = entry.is_protected();
        let wrapped = entry.wrapped_key.clone();

        let sealed = self.read_payload(id)?;
        let plaintext = match auth {
            PayloadAuth::Master => {
                if protected {
                    return Err(MyfsError::AuthFailed);
                }
                Zeroizing::new(aead::open(
                    self.master_key().as_bytes(),
                    &Self::payload_aad(&salt),
                    &sealed,
                )?)
            }
            PayloadAuth::FileSecret(current) => {
                if !protected {
                    return Err(MyfsError::AuthFailed);
                }
                let key = derive_file_key(current, &salt, &self.header().kdf)?;
                Zeroizing::new(aead::open(
                    key.as_bytes(),
                    &Self::payload_aad(&salt),
                    &sealed,
                )?)
            }
            PayloadAuth::ForceMaster => {
                if let Some(wrapped) = wrapped {
                    let file_key = self.unwrap_file_key(&wrapped)?;
                    Zeroizing::new(aead::open(
                        file_key.as_bytes(),
                        &Self::payload_aad(&salt),
                        &sealed,
                    )?)
                } else {
                    Zeroizing::new(aead::open(
                        self.master_key().as_bytes(),
                        &Self::payload_aad(&salt),
                        &sealed,
                    )?)
                }
            }
        };

        // Fresh salt, fresh key, fresh seal.
        let new_salt: [u8; SALT_SIZE] = random_bytes();
        let new_key = derive_file_key(new_secret, &new_salt, &self.header().kdf)?;
        let resealed = aead::seal(
            new_key.as_bytes(),
            &Self::payload_aad(&new_salt),
            &plaintext,
        )?;
        let new_wrapped = aead::seal(
            self.master_key().as_bytes(),
            &self.wrap_aad(),
            new_key.as_bytes(),
        )?;

        let snapshot = self.snapshot_table();
        let saved_len = self.container_mut().len()?;
        let result = (|| {
            let locator = self.append_payload(&resealed)?;
            let entry = self
                .table_mut()
                .get_mut(id)
                .ok_or_else(|| MyfsError::not_found(name))?;
            entry.salt = new_salt;
            entry.wrapped_key = Some(new_wrapped);
            entry.ciphertext_size = resealed.len() as u64;
            entry.locator = locator;
            self.commit()
        })();
        match result {
            Ok(()) => {
                info!(entry = name, "file secret updated");
                Ok(())
            }
            Err(e) => {
                self.restore_table(snapshot);
                let _ = self.container_mut().set_len(saved_len);
                let _ = self.container_mut().sync();
                Err(e)
            }
        }
    }

    /// Opens a wrapped file key with the master key.
    pub(crate) fn unwrap_file_key(&self, wrapped: &[u8]) -> MyfsResult<FileKey> {
        let opened = aead::open(self.master_key().as_bytes(), &self.wrap_aad(), wrapped)?;
        let bytes: [u8; KEY_SIZE] = opened
            .as_slice()
            .try_into()
            .map_err(|_| MyfsError::AuthFailed)?;
        Ok(FileKey::from_bytes(bytes))
    }

    /// Soft-deletes an active entry; the payload is untouched and the entry
    /// can be recovered until the next purge.
    ///
    /// # Errors
    ///
    /// `NotFound` if no active entry has this name.
    pub fn soft_delete(&mut self, name: &str) -> MyfsResult<()> {
        self.ensure_active()?;
        let id = self
            .table()
            .find_by_name(name, false)
            .map(|entry| entry.id)
            .ok_or_else(|| MyfsError::not_found(name))?;
        self.transition_and_commit(id, EntryState::SoftDeleted)?;
        info!(entry = name, "soft-deleted");
        Ok(())
    }

    /// Recovers a soft-deleted entry back to active.
    ///
    /// # Errors
    ///
    /// `NotFound` if no soft-deleted entry has this name, `NameTaken` if an
    /// active entry took the name in the meantime.
    pub fn recover(&mut self, name: &str) -> MyfsResult<()> {
        self.ensure_active()?;
        let id = self
            .table()
            .find_retired_by_name(name)
            .filter(|entry| entry.state == EntryState::SoftDeleted)
            .map(|entry| entry.id)
            .ok_or_else(|| MyfsError::not_found(name))?;
        self.transition_and_commit(id, EntryState::Active)?;
        info!(entry = name, "recovered");
        Ok(())
    }

    /// Marks an entry (active or soft-deleted) for removal at the next
    /// purge. The payload and locator stay in place until then.
    ///
    /// # Errors
    ///
    /// `NotFound` if the name matches neither.
    pub fn hard_delete(&mut self, name: &str) -> MyfsResult<()> {
        self.ensure_active()?;
        let id = self
            .table()
            .find_by_name(name, false)
            .or_else(|| {
                self.table()
                    .find_retired_by_name(name)
                    .filter(|entry| entry.state == EntryState::SoftDeleted)
            })
            .map(|entry| entry.id)
            .ok_or_else(|| MyfsError::not_found(name))?;
        self.transition_and_commit(id, EntryState::PendingPurge)?;
        info!(entry = name, "hard-deleted");
        Ok(())
    }

    fn transition_and_commit(&mut self, id: EntryId, state: EntryState) -> MyfsResult<()> {
        let snapshot = self.snapshot_table();
        let result = self
            .table_mut()
            .transition(id, state, unix_now())
            .and_then(|()| self.commit());
        if result.is_err() {
            self.restore_table(snapshot);
        }
        result
    }

    /// Removes every `PendingPurge` entry and rewrites the container
    /// compactly, reclaiming their payload runs and all tombstones. Returns
    /// the number of entries purged.
    ///
    /// # Errors
    ///
    /// On failure the pre-purge state remains in force on disk.
    pub fn purge(&mut self) -> MyfsResult<usize> {
        self.ensure_active()?;
        let snapshot = self.snapshot_table();

        // Payloads of surviving entries, read before any locator changes.
        let survivor_ids: Vec<EntryId> = self
            .table()
            .entries()
            .filter(|entry| entry.state != EntryState::PendingPurge)
            .map(|entry| entry.id)
            .collect();
        let result = (|| {
            let mut payloads = BTreeMap::new();
            for id in &survivor_ids {
                payloads.insert(*id, self.read_payload(*id)?);
            }
            let purged = self.table_mut().remove_purged();
            self.rewrite_full(&payloads, None)?;
            Ok(purged.len())
        })();
        match result {
            Ok(count) => {
                info!(purged = count, "purge complete");
                Ok(count)
            }
            Err(e) => {
                self.restore_table(snapshot);
                Err(e)
            }
        }
    }

    /// Rotates the master secret.
    ///
    /// Re-seals every master-sealed payload, re-wraps every wrapped file
    /// key, derives a fresh master key under a fresh salt, and rewrites both
    /// container and sidecar. The machine binding record stays valid; it is
    /// bound to the fingerprint and volume id, not the master key.
    ///
    /// # Errors
    ///
    /// `AuthFailed` if `old_secret` does not match the open volume's secret.
    pub fn change_master_secret(&mut self, old_secret: &str, new_secret: &str) -> MyfsResult<()> {
        self.ensure_active()?;

        let kdf = self.header().kdf;
        let supplied =
            derive_master_key(old_secret, &self.header().master_salt, &kdf)?;
        if !bool::from(
            supplied
                .as_bytes()
                .ct_eq(self.master_key().as_bytes()),
        ) {
            return Err(MyfsError::AuthFailed);
        }

        let new_salt: [u8; SALT_SIZE] = random_bytes();
        let new_key = MasterKey::from_bytes(derive_key(
            new_secret.as_bytes(),
            &new_salt,
            LABEL_MASTER,
            &kdf,
        )?);
        let new_wrap_aad = self.wrap_aad();

        let snapshot = self.snapshot_table();
        let ids: Vec<EntryId> = self.table().entries().map(|entry| entry.id).collect();
        let result = (|| {
            let mut payloads = BTreeMap::new();
            for id in ids {
                let entry = self
                    .table()
                    .get(id)
                    .ok_or_else(|| MyfsError::unrecoverable("entry vanished during rotation"))?;
                let salt = entry.salt;
                let wrapped = entry.wrapped_key.clone();
                let sealed = self.read_payload(id)?;

                if let Some(wrapped) = wrapped {
                    // Payload stays under the file key; only the wrapping
                    // moves to the new master key.
                    let file_key = self.unwrap_file_key(&wrapped)?;
                    let rewrapped =
                        aead::seal(new_key.as_bytes(), &new_wrap_aad, file_key.as_bytes())?;
                    let entry = self
                        .table_mut()
                        .get_mut(id)
                        .ok_or_else(|| MyfsError::unrecoverable("entry vanished during rotation"))?;
                    entry.wrapped_key = Some(rewrapped);
                    payloads.insert(id, sealed);
                } else {
                    let plaintext = Zeroizing::new(aead::open(
                        self.master_key().as_bytes(),
                        &Self::payload_aad(&salt),
                        &sealed,
                    )?);
                    let resealed =
                        aead::seal(new_key.as_bytes(), &Self::payload_aad(&salt), &plaintext)?;
                    let entry = self
                        .table_mut()
                        .get_mut(id)
                        .ok_or_else(|| MyfsError::unrecoverable("entry vanished during rotation"))?;
                    entry.ciphertext_size = resealed.len() as u64;
                    entry.locator.length = resealed.len() as u64;
                    payloads.insert(id, resealed);
                }
            }
            self.rewrite_full(&payloads, Some((new_key.clone(), new_salt)))
        })();
        match result {
            Ok(()) => {
                info!(volume = %self.volume_id(), "master secret rotated");
                Ok(())
            }
            Err(e) => {
                self.restore_table(snapshot);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{format_memory, reopen, stores_of};
    use super::super::OpenOptions;
    use super::*;
    use crate::format::SEAL_OVERHEAD;

    #[test]
    fn test_import_export_roundtrip() {
        let (mut volume, _) = format_memory();
        volume.import("greet.txt", b"hello world", None).unwrap();

        let listed = volume.entries(false);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "greet.txt");
        assert_eq!(listed[0].size, 11);
        assert!(!listed[0].protected);

        let exported = volume.export("greet.txt", None, ExportMode::Normal).unwrap();
        assert_eq!(exported, b"hello world");
    }

    #[test]
    fn test_import_survives_reopen() {
        let (mut volume, binding) = format_memory();
        volume.import("greet.txt", b"hello world", None).unwrap();
        let (container, sidecar) = stores_of(&volume);
        drop(volume);

        let (mut reopened, _) =
            reopen(container, sidecar, &binding, OpenOptions::checked()).unwrap();
        let exported = reopened
            .export("greet.txt", None, ExportMode::Normal)
            .unwrap();
        assert_eq!(exported, b"hello world");
    }

    #[test]
    fn test_import_duplicate_name_is_taken() {
        let (mut volume, _) = format_memory();
        volume.import("a.txt", b"A", None).unwrap();
        assert!(matches!(
            volume.import("a.txt", b"again", None),
            Err(MyfsError::NameTaken { .. })
        ));
    }

    #[test]
    fn test_import_name_shared_with_soft_deleted() {
        let (mut volume, _) = format_memory();
        volume.import("a.txt", b"first", None).unwrap();
        volume.soft_delete("a.txt").unwrap();
        volume.import("a.txt", b"second", None).unwrap();

        let exported = volume.export("a.txt", None, ExportMode::Normal).unwrap();
        assert_eq!(exported, b"second");
    }

    #[test]
    fn test_raw_export_matches_recorded_ciphertext_size() {
        let (mut volume, _) = format_memory();
        volume.import("greet.txt", b"hello world", None).unwrap();

        let raw = volume.export("greet.txt", None, ExportMode::Raw).unwrap();
        let info = &volume.entries(false)[0];
        assert_eq!(raw.len() as u64, 11 + SEAL_OVERHEAD as u64);
        assert_eq!(raw.len() as u64, info.size + SEAL_OVERHEAD as u64);

        // Normal export still round-trips afterwards.
        let plain = volume.export("greet.txt", None, ExportMode::Normal).unwrap();
        assert_eq!(plain, b"hello world");
    }

    #[test]
    fn test_protected_roundtrip_and_wrong_secret() {
        let (mut volume, _) = format_memory();
        let data: Vec<u8> = (0..=255).collect();
        volume.import("secret.bin", &data, Some("alpha")).unwrap();

        let exported = volume
            .export("secret.bin", Some("alpha"), ExportMode::Normal)
            .unwrap();
        assert_eq!(exported, data);

        assert!(matches!(
            volume.export("secret.bin", Some("beta"), ExportMode::Normal),
            Err(MyfsError::AuthFailed)
        ));
        assert!(matches!(
            volume.export("secret.bin", None, ExportMode::Normal),
            Err(MyfsError::AuthFailed)
        ));
    }

    #[test]
    fn test_protected_raw_export_embeds_salt() {
        let (mut volume, _) = format_memory();
        volume.import("secret.bin", b"payload", Some("alpha")).unwrap();

        let raw = volume.export("secret.bin", None, ExportMode::Raw).unwrap();
        assert_eq!(raw.len(), SALT_SIZE + 7 + SEAL_OVERHEAD);

        // The embedded salt plus the secret re-derives the payload key.
        let salt: [u8; SALT_SIZE] = raw[..SALT_SIZE].try_into().unwrap();
        let key = derive_file_key("alpha", &salt, &volume.header().kdf).unwrap();
        let plaintext = aead::open(
            key.as_bytes(),
            &Volume::<crate::store::MemoryStore>::payload_aad(&salt),
            &raw[SALT_SIZE..],
        )
        .unwrap();
        assert_eq!(plaintext, b"payload");
    }

    #[test]
    fn test_secret_change_invalidates_old() {
        let (mut volume, _) = format_memory();
        let data: Vec<u8> = (0..=255).collect();
        volume.import("secret.bin", &data, Some("alpha")).unwrap();

        volume
            .change_file_secret("secret.bin", "alpha", "beta")
            .unwrap();

        assert!(matches!(
            volume.export("secret.bin", Some("alpha"), ExportMode::Normal),
            Err(MyfsError::AuthFailed)
        ));
        let exported = volume
            .export("secret.bin", Some("beta"), ExportMode::Normal)
            .unwrap();
        assert_eq!(exported, data);
    }

    #[test]
    fn test_change_secret_wrong_current_rejected() {
        let (mut volume, _) = format_memory();
        volume.import("f", b"x", Some("alpha")).unwrap();
        assert!(matches!(
            volume.change_file_secret("f", "wrong", "beta"),
            Err(MyfsError::AuthFailed)
        ));
        // Old secret still works.
        assert_eq!(
            volume.export("f", Some("alpha"), ExportMode::Normal).unwrap(),
            b"x"
        );
    }

    #[test]
    fn test_add_secret_to_unprotected() {
        let (mut volume, _) = format_memory();
        volume.import("f", b"contents", None).unwrap();
        volume.add_file_secret("f", "s3cret").unwrap();

        assert!(volume.entries(false)[0].protected);
        assert!(matches!(
            volume.export("f", None, ExportMode::Normal),
            Err(MyfsError::AuthFailed)
        ));
        assert_eq!(
            volume
                .export("f", Some("s3cret"), ExportMode::Normal)
                .unwrap(),
            b"contents"
        );
    }

    #[test]
    fn test_add_secret_to_protected_rejected() {
        let (mut volume, _) = format_memory();
        volume.import("f", b"x", Some("alpha")).unwrap();
        assert!(matches!(
            volume.add_file_secret("f", "beta"),
            Err(MyfsError::AuthFailed)
        ));
    }

    #[test]
    fn test_force_change_without_current_secret() {
        let (mut volume, _) = format_memory();
        volume.import("f", b"precious", Some("forgotten")).unwrap();

        volume.force_change_file_secret("f", "remembered").unwrap();
        assert_eq!(
            volume
                .export("f", Some("remembered"), ExportMode::Normal)
                .unwrap(),
            b"precious"
        );
    }

    #[test]
    fn test_soft_delete_recover_purge_flow() {
        let (mut volume, _) = format_memory();
        volume.import("a.txt", b"A", None).unwrap();
        volume.import("b.txt", b"B", None).unwrap();

        volume.soft_delete("a.txt").unwrap();
        assert_eq!(volume.entries(false).len(), 1);
        assert_eq!(volume.entries(true).len(), 2);

        volume.recover("a.txt").unwrap();
        volume.hard_delete("b.txt").unwrap();

        let data_len_before = volume.container_mut().len().unwrap();
        let purged = volume.purge().unwrap();
        assert_eq!(purged, 1);
        let data_len_after = volume.container_mut().len().unwrap();
        assert!(data_len_after < data_len_before);

        assert_eq!(
            volume.export("a.txt", None, ExportMode::Normal).unwrap(),
            b"A"
        );
        assert!(matches!(
            volume.export("b.txt", None, ExportMode::Normal),
            Err(MyfsError::NotFound { .. })
        ));
    }

    #[test]
    fn test_purge_shrinks_by_ciphertext_length() {
        let (mut volume, _) = format_memory();
        volume.import("a.txt", b"A", None).unwrap();
        volume.import("b.txt", b"B", None).unwrap();
        volume.purge().unwrap(); // compact away commit tombstones first

        let before = volume.container_mut().len().unwrap();
        let b_len = volume
            .table()
            .find_by_name("b.txt", false)
            .unwrap()
            .ciphertext_size;

        volume.hard_delete("b.txt").unwrap();
        volume.purge().unwrap();
        let after = volume.container_mut().len().unwrap();

        // The data region shrinks by exactly b's sealed payload; the table
        // shrinks too since its record is gone.
        assert!(before - after >= b_len);
    }

    #[test]
    fn test_soft_delete_reversibility_after_reopen() {
        let (mut volume, binding) = format_memory();
        volume.import("doc", b"payload", None).unwrap();
        volume.soft_delete("doc").unwrap();
        let (container, sidecar) = stores_of(&volume);
        drop(volume);

        let (mut reopened, _) =
            reopen(container, sidecar, &binding, OpenOptions::checked()).unwrap();
        reopened.recover("doc").unwrap();
        assert_eq!(
            reopened.export("doc", None, ExportMode::Normal).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn test_recover_collision_is_name_taken() {
        let (mut volume, _) = format_memory();
        volume.import("a.txt", b"old", None).unwrap();
        volume.soft_delete("a.txt").unwrap();
        volume.import("a.txt", b"new", None).unwrap();

        assert!(matches!(
            volume.recover("a.txt"),
            Err(MyfsError::NameTaken { .. })
        ));
    }

    #[test]
    fn test_purged_entry_is_gone_after_reopen() {
        let (mut volume, binding) = format_memory();
        volume.import("doomed", b"secret stuff", None).unwrap();
        volume.hard_delete("doomed").unwrap();
        volume.purge().unwrap();
        let (container, sidecar) = stores_of(&volume);
        drop(volume);

        let (mut reopened, _) =
            reopen(container, sidecar, &binding, OpenOptions::checked()).unwrap();
        assert!(reopened.entries(true).is_empty());
        assert!(matches!(
            reopened.export("doomed", None, ExportMode::Normal),
            Err(MyfsError::NotFound { .. })
        ));
    }

    #[test]
    fn test_export_soft_deleted_is_not_found() {
        let (mut volume, _) = format_memory();
        volume.import("gone", b"x", None).unwrap();
        volume.soft_delete("gone").unwrap();
        assert!(matches!(
            volume.export("gone", None, ExportMode::Normal),
            Err(MyfsError::NotFound { .. })
        ));
    }

    #[test]
    fn test_change_master_secret() {
        let (mut volume, binding) = format_memory();
        volume.import("plain", b"plain data", None).unwrap();
        volume.import("locked", b"locked data", Some("k")).unwrap();

        volume.change_master_secret("hunter2", "correct horse").unwrap();

        // Both payload styles still open in-session.
        assert_eq!(
            volume.export("plain", None, ExportMode::Normal).unwrap(),
            b"plain data"
        );
        assert_eq!(
            volume
                .export("locked", Some("k"), ExportMode::Normal)
                .unwrap(),
            b"locked data"
        );

        let (container, sidecar) = stores_of(&volume);
        drop(volume);

        // Old secret no longer opens; new one does, with the old binding.
        let (c2, s2) = (container.clone(), sidecar.clone());
        let result = super::super::Volume::open_with(
            &super::super::testing::session(),
            c2,
            s2,
            "hunter2",
            Some(&binding),
            &super::super::testing::fingerprint(),
            OpenOptions::default(),
        );
        assert!(matches!(result, Err(MyfsError::AuthFailed)));

        let (mut reopened, _) = super::super::Volume::open_with(
            &super::super::testing::session(),
            container,
            sidecar,
            "correct horse",
            Some(&binding),
            &super::super::testing::fingerprint(),
            OpenOptions::checked(),
        )
        .unwrap();
        assert_eq!(
            reopened.export("plain", None, ExportMode::Normal).unwrap(),
            b"plain data"
        );
        assert_eq!(
            reopened
                .export("locked", Some("k"), ExportMode::Normal)
                .unwrap(),
            b"locked data"
        );
    }

    #[test]
    fn test_change_master_secret_wrong_old_rejected() {
        let (mut volume, _) = format_memory();
        assert!(matches!(
            volume.change_master_secret("wrong", "new"),
            Err(MyfsError::AuthFailed)
        ));
    }

    #[test]
    fn test_mirror_equivalence_after_mutations() {
        let (mut volume, _) = format_memory();
        volume.import("a", b"1", None).unwrap();
        volume.import("b", b"2", Some("s")).unwrap();
        volume.soft_delete("a").unwrap();

        // The container's table segment and the sidecar's must be
        // byte-identical after every commit.
        let header = volume.header().clone();
        let (mut container, mut sidecar) = stores_of(&volume);
        drop(volume);

        let from_container =
            super::super::read_container_table(&mut container, &header).unwrap();
        let from_sidecar = super::super::read_sidecar_table(&mut sidecar, &header).unwrap();
        assert_eq!(from_container, from_sidecar);
    }
}
