//! Integrity monitoring: header, table mirror, and payload verification.
//!
//! Runs on every open and on demand. Verification never writes plaintext
//! anywhere; payloads are decrypted in memory, digested, and discarded.
//! Failures escalate automatically: a bad header is restored from the open
//! volume's state, a diverged mirror is republished, and entries whose
//! payloads no longer verify are marked for purge with an audit record.

use tracing::{debug, error, warn};
use zeroize::Zeroizing;

use crate::crypto::{aead, compute_digest};
use crate::error::{MyfsError, MyfsResult};
use crate::format::HEADER_SIZE;
use crate::header::VolumeHeader;
use crate::store::VolumeStore;
use crate::table::FileTable;
use crate::types::{EntryId, EntryState};
use crate::volume::Volume;

/// Outcome of an integrity pass.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    /// The on-disk header verified against the open volume's key.
    pub header_ok: bool,
    /// Container and sidecar tables matched the in-memory state.
    pub table_mirror_ok: bool,
    /// Entries whose payloads failed verification, now marked for purge.
    pub corrupt_entries: Vec<String>,
}

impl IntegrityReport {
    /// `true` when nothing had to be repaired or quarantined.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.header_ok && self.table_mirror_ok && self.corrupt_entries.is_empty()
    }
}

impl<S: VolumeStore> Volume<S> {
    /// Verifies the volume end to end and repairs what it can.
    ///
    /// # Errors
    ///
    /// Returns an error only when a repair write fails; detection results
    /// are reported, not raised.
    pub fn check_integrity(&mut self) -> MyfsResult<IntegrityReport> {
        let mut report = IntegrityReport {
            header_ok: true,
            table_mirror_ok: true,
            corrupt_entries: Vec::new(),
        };

        self.verify_header(&mut report)?;
        self.verify_table_mirror(&mut report)?;
        self.verify_payloads(&mut report)?;

        if report.is_clean() {
            debug!(volume = %self.volume_id(), "integrity check clean");
        }
        Ok(report)
    }

    /// Recomputes the header tag from disk; rewrites the header from the
    /// authenticated in-memory state on mismatch.
    fn verify_header(&mut self, report: &mut IntegrityReport) -> MyfsResult<()> {
        let on_disk_ok = self
            .container_mut()
            .read_at(0, HEADER_SIZE as usize)
            .ok()
            .and_then(|bytes| VolumeHeader::decode(&bytes).ok())
            .is_some_and(|(decoded, tag)| {
                decoded == *self.header() && decoded.verify_tag(&tag, self.master_key()).is_ok()
            });

        if !on_disk_ok {
            report.header_ok = false;
            error!(volume = %self.volume_id(), "container header failed verification; restoring");
            let encoded = self.header().seal_and_encode(self.master_key())?;
            self.container_mut().write_at(0, &encoded)?;
            self.container_mut().sync()?;
        }
        Ok(())
    }

    /// Confirms both table copies open and carry the loaded sequence;
    /// republishes the in-memory table otherwise.
    fn verify_table_mirror(&mut self, report: &mut IntegrityReport) -> MyfsResult<()> {
        let expected_sequence = self.table().sequence();
        let key = self.master_key().clone();
        let volume_id = self.header().volume_id;

        let header = self.header().clone();
        let container_ok = crate::volume::read_container_table(self.container_mut(), &header)
            .and_then(|sealed| FileTable::open_sealed(&sealed, &key, &volume_id).ok())
            .is_some_and(|table| table.sequence() == expected_sequence);
        let sidecar_ok = crate::volume::read_sidecar_table(self.sidecar_mut(), &header)
            .and_then(|sealed| FileTable::open_sealed(&sealed, &key, &volume_id).ok())
            .is_some_and(|table| table.sequence() == expected_sequence);

        if !(container_ok && sidecar_ok) {
            report.table_mirror_ok = false;
            warn!(
                volume = %volume_id,
                container_ok, sidecar_ok,
                "table mirror diverged; republishing"
            );
            let sealed = self.table().seal(&key, &volume_id)?;
            let mut header = self.header().clone();
            crate::volume::publish_table_raw(self.container_mut(), &mut header, &sealed)?;
            crate::volume::write_sidecar_raw(self.sidecar_mut(), &header, &sealed)?;
            *self.header_mut() = header;
        }
        Ok(())
    }

    /// Streams every active entry's payload through decryption and digest
    /// comparison. Failures are marked `PendingPurge` and committed.
    fn verify_payloads(&mut self, report: &mut IntegrityReport) -> MyfsResult<()> {
        let active_ids: Vec<EntryId> = self
            .table()
            .entries()
            .filter(|entry| entry.is_active())
            .map(|entry| entry.id)
            .collect();

        let mut failed: Vec<(EntryId, String)> = Vec::new();
        for id in active_ids {
            if !self.payload_verifies(id)? {
                let name = self
                    .table()
                    .get(id)
                    .map(|entry| entry.name.clone())
                    .unwrap_or_default();
                error!(entry = %name, "content digest mismatch");
                failed.push((id, name));
            }
        }
        if failed.is_empty() {
            return Ok(());
        }

        let snapshot = self.snapshot_table();
        let now = crate::volume::unix_now();
        let result = (|| {
            for (id, _) in &failed {
                self.table_mut()
                    .transition(*id, EntryState::PendingPurge, now)?;
            }
            self.commit()
        })();
        if result.is_err() {
            self.restore_table(snapshot);
        }
        result?;

        report
            .corrupt_entries
            .extend(failed.into_iter().map(|(_, name)| name));
        Ok(())
    }

    /// Decrypts one payload in memory and compares its digest. `Ok(false)`
    /// means the entry is damaged, not that the check could not run.
    fn payload_verifies(&mut self, id: EntryId) -> MyfsResult<bool> {
        let Some(entry) = self.table().get(id) else {
            return Ok(true);
        };
        let salt = entry.salt;
        let wrapped = entry.wrapped_key.clone();
        let stored_digest = entry.digest;

        let Ok(sealed) = self.read_payload(id) else {
            return Ok(false);
        };

        let opened = match wrapped {
            Some(wrapped) => match self.unwrap_file_key(&wrapped) {
                Ok(file_key) => aead::open(
                    file_key.as_bytes(),
                    &Self::payload_aad(&salt),
                    &sealed,
                ),
                Err(_) => return Ok(false),
            },
            None => aead::open(
                self.master_key().as_bytes(),
                &Self::payload_aad(&salt),
                &sealed,
            ),
        };
        let Ok(plaintext) = opened.map(Zeroizing::new) else {
            return Ok(false);
        };
        Ok(compute_digest(&plaintext).matches(&stored_digest))
    }
}
