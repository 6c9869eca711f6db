//! Backup-based repair of a damaged container/sidecar pair.
//!
//! Policy:
//! - Container header intact, table corrupt: adopt the sidecar's table.
//! - Container header corrupt, sidecar intact: rebuild the container from
//!   the sidecar, salvaging payloads out of the damaged file.
//! - Both headers corrupt: `Unrecoverable`.
//! - Payloads whose recomputed digests disagree with the stored ones are
//!   marked `PendingPurge` and surfaced as lost names.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::crypto::kdf::derive_master_key;
use crate::crypto::{aead, compute_digest, MasterKey};
use crate::error::{MyfsError, MyfsResult};
use crate::format::{KEY_SIZE, LABEL_FILE, SIDECAR_PREFIX_SIZE};
use crate::header::{SidecarPrefix, VolumeHeader};
use crate::session::Session;
use crate::store::{FileStore, VolumeStore};
use crate::table::FileTable;
use crate::types::{EntryId, EntryState, FileEntry, VolumeId};

use super::{
    publish_table_raw, read_container_table, read_sidecar_table, rebuild_image, resolve_header,
    unix_now, write_sidecar_raw,
};

/// What a repair pass did.
#[derive(Debug, Default)]
pub struct RepairOutcome {
    /// The container was rewritten from the sidecar.
    pub rewrote_container: bool,
    /// The sidecar was rewritten from the container.
    pub rewrote_sidecar: bool,
    /// Entries whose payloads could not be recovered.
    pub lost_entries: Vec<String>,
}

/// Repairs the volume at the given paths.
///
/// Either file may be missing or corrupt; whichever side still
/// authenticates under the master secret is used to rebuild the other.
///
/// # Errors
///
/// `AuthFailed` when nothing authenticates under the secret,
/// `Unrecoverable` when both headers are beyond use, `Locked` when another
/// process holds the container.
pub fn repair<P: AsRef<Path>, Q: AsRef<Path>>(
    session: &Session,
    container_path: P,
    sidecar_path: Q,
    master_secret: &str,
) -> MyfsResult<RepairOutcome> {
    let mut container = FileStore::open(container_path.as_ref(), true)?;
    container.lock_exclusive()?;
    let mut sidecar = FileStore::open(sidecar_path.as_ref(), true)?;
    repair_with(session, &mut container, &mut sidecar, master_secret)
}

/// Repairs a volume on already-opened stores.
///
/// # Errors
///
/// See [`repair`].
pub fn repair_with<S: VolumeStore>(
    session: &Session,
    container: &mut S,
    sidecar: &mut S,
    master_secret: &str,
) -> MyfsResult<RepairOutcome> {
    info!(date = %session.opened_on(), "repair requested");
    repair_stores(container, sidecar, master_secret)
}

/// The repair core shared with the open fallback path.
pub(crate) fn repair_stores<S: VolumeStore>(
    container: &mut S,
    sidecar: &mut S,
    master_secret: &str,
) -> MyfsResult<RepairOutcome> {
    let mut outcome = RepairOutcome::default();

    match resolve_header(container, master_secret) {
        Ok((mut header, key)) => {
            let mut table = reconcile_tables(container, sidecar, &mut header, &key, &mut outcome)?;
            outcome.lost_entries =
                quarantine_unverifiable(container, sidecar, &mut header, &key, &mut table)?;
            Ok(outcome)
        }
        Err(container_err) => {
            match rebuild_container_from_sidecar(container, sidecar, master_secret) {
                Ok(lost) => {
                    outcome.rewrote_container = true;
                    outcome.rewrote_sidecar = true;
                    outcome.lost_entries = lost;
                    Ok(outcome)
                }
                Err(_) => match container_err {
                    MyfsError::AuthFailed => Err(MyfsError::AuthFailed),
                    _ => Err(MyfsError::unrecoverable(
                        "both container and sidecar are unusable",
                    )),
                },
            }
        }
    }
}

/// With an authenticated container header, settles which table survives and
/// rewrites the stale side.
fn reconcile_tables<S: VolumeStore>(
    container: &mut S,
    sidecar: &mut S,
    header: &mut VolumeHeader,
    key: &MasterKey,
    outcome: &mut RepairOutcome,
) -> MyfsResult<FileTable> {
    let container_sealed = read_container_table(container, header);
    let container_table = container_sealed
        .as_ref()
        .ok_or(MyfsError::TableCorrupt)
        .and_then(|bytes| FileTable::open_sealed(bytes, key, &header.volume_id));
    let sidecar_sealed = read_sidecar_table(sidecar, header);
    let sidecar_table = sidecar_sealed
        .as_ref()
        .ok_or(MyfsError::TableCorrupt)
        .and_then(|bytes| FileTable::open_sealed(bytes, key, &header.volume_id));

    match (container_table, sidecar_table) {
        (Ok(from_container), Ok(from_sidecar)) => {
            if container_sealed == sidecar_sealed {
                Ok(from_container)
            } else if from_sidecar.sequence() > from_container.sequence() {
                warn!("adopting newer sidecar table during repair");
                let sealed = sidecar_sealed.expect("sidecar table decoded from these bytes");
                publish_table_raw(container, header, &sealed)?;
                outcome.rewrote_container = true;
                Ok(from_sidecar)
            } else {
                warn!("rewriting stale sidecar during repair");
                let sealed = container_sealed.expect("container table decoded from these bytes");
                write_sidecar_raw(sidecar, header, &sealed)?;
                outcome.rewrote_sidecar = true;
                Ok(from_container)
            }
        }
        (Ok(from_container), Err(_)) => {
            warn!("rewriting unreadable sidecar during repair");
            let sealed = container_sealed.expect("container table decoded from these bytes");
            write_sidecar_raw(sidecar, header, &sealed)?;
            outcome.rewrote_sidecar = true;
            Ok(from_container)
        }
        (Err(_), Ok(from_sidecar)) => {
            warn!("rebuilding container table from sidecar during repair");
            let sealed = sidecar_sealed.expect("sidecar table decoded from these bytes");
            publish_table_raw(container, header, &sealed)?;
            outcome.rewrote_container = true;
            Ok(from_sidecar)
        }
        (Err(_), Err(_)) => Err(MyfsError::TableCorrupt),
    }
}

/// Verifies every payload still carried by the table; failures are marked
/// `PendingPurge` and the updated table is published to both sides.
fn quarantine_unverifiable<S: VolumeStore>(
    container: &mut S,
    sidecar: &mut S,
    header: &mut VolumeHeader,
    key: &MasterKey,
    table: &mut FileTable,
) -> MyfsResult<Vec<String>> {
    let candidates: Vec<EntryId> = table
        .entries()
        .filter(|entry| entry.state != EntryState::PendingPurge)
        .map(|entry| entry.id)
        .collect();

    let mut lost = Vec::new();
    for id in candidates {
        let entry = table
            .get(id)
            .ok_or_else(|| MyfsError::unrecoverable("entry vanished during repair"))?;
        if payload_verifies(container, entry, key, &header.volume_id) {
            continue;
        }
        let name = entry.name.clone();
        warn!(entry = %name, "payload lost; marking for purge");
        table.transition(id, EntryState::PendingPurge, unix_now())?;
        lost.push(name);
    }

    if !lost.is_empty() {
        table.bump_sequence(unix_now());
        let sealed = table.seal(key, &header.volume_id)?;
        publish_table_raw(container, header, &sealed)?;
        write_sidecar_raw(sidecar, header, &sealed)?;
    }
    Ok(lost)
}

/// Decrypts one payload and compares digests, without a `Volume` in hand.
fn payload_verifies<S: VolumeStore>(
    container: &mut S,
    entry: &FileEntry,
    key: &MasterKey,
    volume_id: &VolumeId,
) -> bool {
    let Ok(len) = usize::try_from(entry.locator.length) else {
        return false;
    };
    let Ok(sealed) = container.read_at(entry.locator.offset, len) else {
        return false;
    };

    let payload_aad = aead::role_aad(LABEL_FILE, &entry.salt);
    let opened = match &entry.wrapped_key {
        Some(wrapped) => {
            let wrap_aad = aead::role_aad(LABEL_FILE, volume_id.as_bytes());
            let Ok(key_bytes) = aead::open(key.as_bytes(), &wrap_aad, wrapped) else {
                return false;
            };
            let Ok(file_key) = <[u8; KEY_SIZE]>::try_from(key_bytes.as_slice()) else {
                return false;
            };
            aead::open(&file_key, &payload_aad, &sealed)
        }
        None => aead::open(key.as_bytes(), &payload_aad, &sealed),
    };
    let Ok(plaintext) = opened.map(Zeroizing::new) else {
        return false;
    };
    compute_digest(&plaintext).matches(&entry.digest)
}

/// Rebuilds the container wholesale from the sidecar, salvaging whatever
/// payloads the damaged container still yields.
fn rebuild_container_from_sidecar<S: VolumeStore>(
    container: &mut S,
    sidecar: &mut S,
    master_secret: &str,
) -> MyfsResult<Vec<String>> {
    let total = sidecar.len()?;
    if total <= SIDECAR_PREFIX_SIZE {
        return Err(MyfsError::unrecoverable("sidecar missing or empty"));
    }
    let prefix_bytes = sidecar.read_at(0, SIDECAR_PREFIX_SIZE as usize)?;
    let prefix = SidecarPrefix::decode(&prefix_bytes)?;
    let key = derive_master_key(master_secret, &prefix.master_salt, &prefix.kdf)?;

    let table_len = usize::try_from(total - SIDECAR_PREFIX_SIZE)
        .map_err(|_| MyfsError::unrecoverable("sidecar too large"))?;
    let sealed = sidecar.read_at(SIDECAR_PREFIX_SIZE, table_len)?;
    let mut table = FileTable::open_sealed(&sealed, &key, &prefix.volume_id)
        .map_err(|_| MyfsError::AuthFailed)?;

    warn!(volume = %prefix.volume_id, "rebuilding container from sidecar");

    let ids: Vec<EntryId> = table.entries().map(|entry| entry.id).collect();
    let mut payloads = BTreeMap::new();
    let mut lost = Vec::new();
    for id in ids {
        let entry = table
            .get(id)
            .ok_or_else(|| MyfsError::unrecoverable("entry vanished during rebuild"))?;
        let was_condemned = entry.state == EntryState::PendingPurge;
        if payload_verifies(container, entry, &key, &prefix.volume_id) {
            let len = usize::try_from(entry.locator.length)
                .map_err(|_| MyfsError::unrecoverable("locator too large"))?;
            payloads.insert(id, container.read_at(entry.locator.offset, len)?);
        } else {
            if !was_condemned {
                lost.push(entry.name.clone());
                table.transition(id, EntryState::PendingPurge, unix_now())?;
            }
            // Nothing to carry over; the locator shrinks to an empty run.
            let entry = table
                .get_mut(id)
                .ok_or_else(|| MyfsError::unrecoverable("entry vanished during rebuild"))?;
            entry.locator.length = 0;
            payloads.insert(id, Vec::new());
        }
    }

    let rebuilt = rebuild_image(
        prefix.volume_id,
        prefix.master_salt,
        prefix.kdf,
        &key,
        &mut table,
        &payloads,
        unix_now(),
    )?;
    container.replace_contents(&rebuilt.image)?;
    write_sidecar_raw(sidecar, &rebuilt.header, &rebuilt.sealed_table)?;

    info!(volume = %prefix.volume_id, lost = lost.len(), "container rebuilt from sidecar");
    Ok(lost)
}

#[cfg(test)]
mod tests {
    use super::super::testing::{format_memory, reopen, session, stores_of, MASTER};
    use super::super::OpenOptions;
    use super::*;
    use crate::types::ExportMode;

    #[test]
    fn test_repair_clean_volume_is_noop() {
        let (mut volume, _) = format_memory();
        volume.import("a", b"data", None).unwrap();
        let (mut container, mut sidecar) = stores_of(&volume);
        drop(volume);

        let outcome =
            repair_with(&session(), &mut container, &mut sidecar, MASTER).unwrap();
        assert!(!outcome.rewrote_container);
        assert!(!outcome.rewrote_sidecar);
        assert!(outcome.lost_entries.is_empty());
    }

    #[test]
    fn test_repair_wrong_secret_is_auth_failed() {
        let (volume, _) = format_memory();
        let (mut container, mut sidecar) = stores_of(&volume);
        drop(volume);

        assert!(matches!(
            repair_with(&session(), &mut container, &mut sidecar, "wrong"),
            Err(MyfsError::AuthFailed)
        ));
    }

    #[test]
    fn test_repair_rebuilds_corrupt_container_header() {
        let (mut volume, binding) = format_memory();
        volume.import("kept.txt", b"kept bytes", None).unwrap();
        let (mut container, mut sidecar) = stores_of(&volume);
        drop(volume);

        // Destroy the sealed header prefix.
        container.corrupt_at(6, 48);

        let outcome =
            repair_with(&session(), &mut container, &mut sidecar, MASTER).unwrap();
        assert!(outcome.rewrote_container);
        assert!(outcome.lost_entries.is_empty());

        let (mut reopened, report) =
            reopen(container, sidecar, &binding, OpenOptions::checked()).unwrap();
        assert!(report.lost_entries.is_empty());
        assert_eq!(
            reopened.export("kept.txt", None, ExportMode::Normal).unwrap(),
            b"kept bytes"
        );
    }

    #[test]
    fn test_repair_surfaces_lost_payloads() {
        let (mut volume, _) = format_memory();
        volume.import("ok.txt", b"fine", None).unwrap();
        volume.import("gone.txt", b"unlucky", None).unwrap();
        let entry = volume.table().find_by_name("gone.txt", false).unwrap();
        let offset = usize::try_from(entry.locator.offset).unwrap();
        let len = usize::try_from(entry.locator.length).unwrap();
        let (mut container, mut sidecar) = stores_of(&volume);
        drop(volume);

        container.corrupt_at(offset, len);
        let outcome =
            repair_with(&session(), &mut container, &mut sidecar, MASTER).unwrap();
        assert_eq!(outcome.lost_entries, vec!["gone.txt".to_string()]);
    }

    #[test]
    fn test_repair_both_sides_dead_is_unrecoverable() {
        let (volume, _) = format_memory();
        let (mut container, mut sidecar) = stores_of(&volume);
        drop(volume);

        container.corrupt_at(0, 122);
        sidecar.corrupt_at(0, 48);

        assert!(matches!(
            repair_with(&session(), &mut container, &mut sidecar, MASTER),
            Err(MyfsError::Unrecoverable { .. })
        ));
    }

    #[test]
    fn test_repair_container_header_lost_with_damaged_payload() {
        let (mut volume, binding) = format_memory();
        volume.import("a.txt", b"aaa", None).unwrap();
        volume.import("b.txt", b"bbb", None).unwrap();
        let entry = volume.table().find_by_name("b.txt", false).unwrap();
        let offset = usize::try_from(entry.locator.offset).unwrap();
        let len = usize::try_from(entry.locator.length).unwrap();
        let (mut container, mut sidecar) = stores_of(&volume);
        drop(volume);

        container.corrupt_at(6, 48); // header
        container.corrupt_at(offset, len); // b's payload

        let outcome =
            repair_with(&session(), &mut container, &mut sidecar, MASTER).unwrap();
        assert!(outcome.rewrote_container);
        assert_eq!(outcome.lost_entries, vec!["b.txt".to_string()]);

        let (mut reopened, _) =
            reopen(container, sidecar, &binding, OpenOptions::checked()).unwrap();
        assert_eq!(
            reopened.export("a.txt", None, ExportMode::Normal).unwrap(),
            b"aaa"
        );
        assert!(matches!(
            reopened.export("b.txt", None, ExportMode::Normal),
            Err(MyfsError::NotFound { .. })
        ));
    }
}
