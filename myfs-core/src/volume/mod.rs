//! Volume lifecycle: format, open, commit, close.
//!
//! # Container structure
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            Header (122 bytes)            │  offset 0
//! │   identity, salt, KDF params, sealed     │
//! │   tag, table/data pointers               │
//! ├──────────────────────────────────────────┤
//! │      Sealed table segment (variable)     │  offset 122 after format/purge
//! ├──────────────────────────────────────────┤
//! │                                          │
//! │       Data region (sealed payloads)      │
//! │                                          │
//! └──────────────────────────────────────────┘
//! ```
//!
//! # Commit sequence
//!
//! Every mutation ends in the same publish path:
//! 1. Append the re-sealed table at the container tail
//! 2. fsync the container
//! 3. Rewrite the header pointer fields (the atomic publish point)
//! 4. fsync the container
//! 5. Rewrite the sidecar with the identical sealed bytes
//!
//! A crash before step 3 leaves the previous table reachable; a crash after
//! it leaves the new one. A crash between steps 4 and 5 leaves the sidecar
//! one sequence behind, which open detects and reconciles. Superseded table
//! slots become tombstones inside the data region and are reclaimed by
//! purge's full rewrite.

mod files;
mod repair;

pub use repair::{repair, repair_with, RepairOutcome};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::crypto::aead;
use crate::crypto::kdf::{derive_master_key, KdfParams};
use crate::crypto::MasterKey;
use crate::error::{MyfsError, MyfsResult};
use crate::format::{
    HEADER_POINTER_OFFSET, HEADER_SIZE, LABEL_FILE, SEAL_OVERHEAD, SIDECAR_PREFIX_SIZE,
};
use crate::header::{SidecarPrefix, VolumeHeader};
use crate::machine::{Fingerprint, MachineBinding};
use crate::session::Session;
use crate::store::{FileStore, VolumeStore};
use crate::table::FileTable;
use crate::types::{EntryId, VolumeId};

/// Options controlling how a volume is opened.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Regenerate the machine binding record instead of failing when it is
    /// absent or does not match this host.
    pub rebind: bool,
    /// Close the volume after this much idle time; subsequent operations
    /// fail `AuthFailed`.
    pub inactivity_timeout: Option<Duration>,
    /// Run streamed payload verification as part of open. On by default;
    /// callers in a hurry may skip it and run
    /// [`Volume::check_integrity`] later.
    pub verify_payloads: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            rebind: false,
            inactivity_timeout: None,
            verify_payloads: true,
        }
    }
}

impl OpenOptions {
    /// The default open behavior: no rebind, no timeout, payloads verified.
    #[must_use]
    pub fn checked() -> Self {
        Self::default()
    }
}

/// What open had to do besides loading the volume.
#[derive(Debug, Default)]
pub struct OpenReport {
    /// The sidecar's table was adopted over the container's.
    pub adopted_sidecar: bool,
    /// The container was rewritten during open.
    pub repaired_container: bool,
    /// The sidecar was rewritten during open.
    pub repaired_sidecar: bool,
    /// A new machine binding record was issued.
    pub rebound: bool,
    /// The freshly issued binding record, when `rebound` is set.
    pub new_binding: Option<MachineBinding>,
    /// Entries whose payloads failed verification and were marked for purge.
    pub lost_entries: Vec<String>,
}

/// An open, authenticated volume.
///
/// A `Volume` exists only in the `VolumeOpen` state of the session machine:
/// constructing one requires the session gate, the master secret, and a
/// matching machine binding. Key material is zeroized when the volume is
/// dropped or expires.
pub struct Volume<S: VolumeStore> {
    container: S,
    sidecar: S,
    header: VolumeHeader,
    table: FileTable,
    master_key: MasterKey,
    expired: bool,
    inactivity_timeout: Option<Duration>,
    last_activity: Instant,
}

impl<S: VolumeStore> Volume<S> {
    /// Formats a new volume onto empty stores.
    ///
    /// Returns the volume (already open) and the machine binding record the
    /// caller must persist beside the container.
    ///
    /// # Errors
    ///
    /// Fails if either store is non-empty or any write fails; partial writes
    /// are truncated away before returning.
    pub fn format_with(
        session: &Session,
        mut container: S,
        mut sidecar: S,
        master_secret: &str,
        kdf: KdfParams,
        fingerprint: &Fingerprint,
    ) -> MyfsResult<(Self, MachineBinding)> {
        if !container.is_empty()? || !sidecar.is_empty()? {
            return Err(MyfsError::io(
                "formatting volume",
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "store is not empty"),
            ));
        }

        let result = Self::format_inner(session, &mut container, &mut sidecar, master_secret, kdf);
        match result {
            Ok((header, table, master_key)) => {
                let binding = MachineBinding::issue(fingerprint, header.volume_id, &kdf)?;
                debug!(volume = %header.volume_id, "formatted volume");
                Ok((
                    Self {
                        container,
                        sidecar,
                        header,
                        table,
                        master_key,
                        expired: false,
                        inactivity_timeout: None,
                        last_activity: Instant::now(),
                    },
                    binding,
                ))
            }
            Err(e) => {
                let _ = container.set_len(0);
                let _ = sidecar.set_len(0);
                Err(e)
            }
        }
    }

    fn format_inner(
        session: &Session,
        container: &mut S,
        sidecar: &mut S,
        master_secret: &str,
        kdf: KdfParams,
    ) -> MyfsResult<(VolumeHeader, FileTable, MasterKey)> {
        debug!(date = %session.opened_on(), "format requested");
        let volume_id = VolumeId::generate();
        let master_salt = crate::crypto::random_bytes();
        let master_key = derive_master_key(master_secret, &master_salt, &kdf)?;

        let mut table = FileTable::new();
        let rebuilt = rebuild_image(
            volume_id,
            master_salt,
            kdf,
            &master_key,
            &mut table,
            &BTreeMap::new(),
            unix_now(),
        )?;

        container.append(&rebuilt.image)?;
        container.sync()?;
        write_sidecar_raw(sidecar, &rebuilt.header, &rebuilt.sealed_table)?;
        Ok((rebuilt.header, table, master_key))
    }

    /// Opens an existing volume.
    ///
    /// Follows the repair policy when one side of the mirror is damaged: the
    /// intact side is adopted, the damaged side rewritten, and the report
    /// says so. Machine binding is verified before the table is trusted.
    ///
    /// # Errors
    ///
    /// `AuthFailed` for a wrong master secret or binding mismatch,
    /// `TableCorrupt` when neither table copy opens, `Unrecoverable` when
    /// neither header survives.
    pub fn open_with(
        session: &Session,
        mut container: S,
        mut sidecar: S,
        master_secret: &str,
        binding: Option<&MachineBinding>,
        fingerprint: &Fingerprint,
        options: OpenOptions,
    ) -> MyfsResult<(Self, OpenReport)> {
        debug!(date = %session.opened_on(), "open requested");
        let mut report = OpenReport::default();

        // Resolve the header, falling back to sidecar-driven repair when the
        // container's header does not authenticate.
        let (header, master_key) = match resolve_header(&mut container, master_secret) {
            Ok(resolved) => resolved,
            Err(original) => {
                match repair::repair_stores(&mut container, &mut sidecar, master_secret) {
                    Ok(outcome) => {
                        report.repaired_container |= outcome.rewrote_container;
                        report.repaired_sidecar |= outcome.rewrote_sidecar;
                        report.adopted_sidecar |= outcome.rewrote_container;
                        report.lost_entries.extend(outcome.lost_entries);
                        resolve_header(&mut container, master_secret)?
                    }
                    Err(MyfsError::Unrecoverable { .. } | MyfsError::AuthFailed) => {
                        return Err(original)
                    }
                    Err(other) => return Err(other),
                }
            }
        };

        // Machine binding gates everything past the master secret.
        match binding {
            Some(record) => {
                if let Err(e) = record.verify(fingerprint, &header.volume_id, &header.kdf) {
                    if options.rebind {
                        let fresh =
                            MachineBinding::issue(fingerprint, header.volume_id, &header.kdf)?;
                        report.rebound = true;
                        report.new_binding = Some(fresh);
                        warn!(volume = %header.volume_id, "machine binding regenerated");
                    } else {
                        return Err(e);
                    }
                }
            }
            None if options.rebind => {
                let fresh = MachineBinding::issue(fingerprint, header.volume_id, &header.kdf)?;
                report.rebound = true;
                report.new_binding = Some(fresh);
                warn!(volume = %header.volume_id, "machine binding regenerated");
            }
            None => return Err(MyfsError::AuthFailed),
        }

        let mut header = header;
        let table = Self::load_and_reconcile_tables(
            &mut container,
            &mut sidecar,
            &mut header,
            &master_key,
            &mut report,
        )?;

        let mut volume = Self {
            container,
            sidecar,
            header,
            table,
            master_key,
            expired: false,
            inactivity_timeout: options.inactivity_timeout,
            last_activity: Instant::now(),
        };

        if options.verify_payloads {
            let integrity = volume.check_integrity()?;
            report.lost_entries.extend(integrity.corrupt_entries);
        }

        debug!(volume = %volume.header.volume_id, sequence = volume.table.sequence(), "volume open");
        Ok((volume, report))
    }

    fn load_and_reconcile_tables(
        container: &mut S,
        sidecar: &mut S,
        header: &mut VolumeHeader,
        master_key: &MasterKey,
        report: &mut OpenReport,
    ) -> MyfsResult<FileTable> {
        let container_sealed = read_container_table(container, header);
        let container_table = container_sealed
            .as_ref()
            .ok_or(MyfsError::TableCorrupt)
            .and_then(|bytes| FileTable::open_sealed(bytes, master_key, &header.volume_id));

        let sidecar_sealed = read_sidecar_table(sidecar, header);
        let sidecar_table = sidecar_sealed
            .as_ref()
            .ok_or(MyfsError::TableCorrupt)
            .and_then(|bytes| FileTable::open_sealed(bytes, master_key, &header.volume_id));

        match (container_table, sidecar_table) {
            (Ok(from_container), Ok(from_sidecar)) => {
                if container_sealed == sidecar_sealed {
                    return Ok(from_container);
                }
                if from_sidecar.sequence() > from_container.sequence() {
                    warn!(
                        container_seq = from_container.sequence(),
                        sidecar_seq = from_sidecar.sequence(),
                        "sidecar is newer than container; adopting sidecar table"
                    );
                    let sealed = sidecar_sealed.expect("sidecar table decoded from these bytes");
                    publish_table_raw(container, header, &sealed)?;
                    write_sidecar_raw(sidecar, header, &sealed)?;
                    report.adopted_sidecar = true;
                    report.repaired_container = true;
                    Ok(from_sidecar)
                } else {
                    warn!(
                        container_seq = from_container.sequence(),
                        sidecar_seq = from_sidecar.sequence(),
                        "sidecar is stale; rewriting from container"
                    );
                    let sealed = container_sealed.expect("container table decoded from these bytes");
                    write_sidecar_raw(sidecar, header, &sealed)?;
                    report.repaired_sidecar = true;
                    Ok(from_container)
                }
            }
            (Ok(from_container), Err(_)) => {
                warn!("sidecar table unreadable; rewriting from container");
                let sealed = container_sealed.expect("container table decoded from these bytes");
                write_sidecar_raw(sidecar, header, &sealed)?;
                report.repaired_sidecar = true;
                Ok(from_container)
            }
            (Err(_), Ok(from_sidecar)) => {
                warn!("container table unreadable; adopting sidecar table");
                let sealed = sidecar_sealed.expect("sidecar table decoded from these bytes");
                publish_table_raw(container, header, &sealed)?;
                write_sidecar_raw(sidecar, header, &sealed)?;
                report.adopted_sidecar = true;
                report.repaired_container = true;
                Ok(from_sidecar)
            }
            (Err(_), Err(_)) => Err(MyfsError::TableCorrupt),
        }
    }

    /// The volume identifier.
    #[must_use]
    pub const fn volume_id(&self) -> VolumeId {
        self.header.volume_id
    }

    /// The commit sequence number of the loaded table.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.table.sequence()
    }

    /// Closes the volume, flushing stores. Key material is zeroized on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn close(mut self) -> MyfsResult<()> {
        self.container.sync()?;
        self.sidecar.sync()?;
        debug!(volume = %self.header.volume_id, "volume closed");
        Ok(())
    }

    /// Fails with `AuthFailed` once the inactivity timeout has elapsed,
    /// zeroizing the key on first detection.
    pub(crate) fn ensure_active(&mut self) -> MyfsResult<()> {
        if self.expired {
            return Err(MyfsError::AuthFailed);
        }
        if let Some(timeout) = self.inactivity_timeout {
            if self.last_activity.elapsed() > timeout {
                self.master_key.zeroize();
                self.expired = true;
                warn!(volume = %self.header.volume_id, "volume expired after inactivity");
                return Err(MyfsError::AuthFailed);
            }
        }
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Associated data for payload seals: role label plus the entry salt.
    /// The volume id is deliberately excluded so raw-exported blobs stay
    /// portable across volumes.
    pub(crate) fn payload_aad(entry_salt: &[u8]) -> Vec<u8> {
        aead::role_aad(LABEL_FILE, entry_salt)
    }

    /// Associated data for wrapped file keys: role label plus the volume id.
    pub(crate) fn wrap_aad(&self) -> Vec<u8> {
        aead::role_aad(LABEL_FILE, self.header.volume_id.as_bytes())
    }

    /// Reads a sealed payload from the data region.
    pub(crate) fn read_payload(&mut self, entry_id: EntryId) -> MyfsResult<Vec<u8>> {
        let entry = self
            .table
            .get(entry_id)
            .ok_or_else(|| MyfsError::not_found(format!("entry #{entry_id}")))?;
        let locator = entry.locator;
        let len = usize::try_from(locator.length).map_err(|_| {
            MyfsError::io(
                "reading payload",
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "locator too large"),
            )
        })?;
        self.container.read_at(locator.offset, len)
    }

    /// Appends a sealed payload, returning its locator.
    pub(crate) fn append_payload(
        &mut self,
        sealed: &[u8],
    ) -> MyfsResult<crate::types::Locator> {
        let offset = self.container.append(sealed)?;
        Ok(crate::types::Locator::new(offset, sealed.len() as u64))
    }

    /// Re-seals the table and publishes it to container then sidecar.
    ///
    /// On failure the on-disk pointers and length are restored so the
    /// previous committed state remains in force; the in-memory table is the
    /// caller's to restore.
    pub(crate) fn commit(&mut self) -> MyfsResult<()> {
        let old_header = self.header.clone();
        let old_len = self.container.len()?;

        self.table.bump_sequence(unix_now());
        let sealed = self.table.seal(&self.master_key, &self.header.volume_id)?;

        let published = publish_table_raw(&mut self.container, &mut self.header, &sealed);
        let published = match published {
            Ok(()) => write_sidecar_raw(&mut self.sidecar, &self.header, &sealed),
            Err(e) => Err(e),
        };

        if let Err(e) = published {
            self.header = old_header;
            let _ = self
                .container
                .write_at(HEADER_POINTER_OFFSET, &self.header.encode_pointers());
            let _ = self.container.set_len(old_len);
            let _ = self.container.sync();
            return Err(e);
        }
        debug!(volume = %self.header.volume_id, sequence = self.table.sequence(), "commit published");
        Ok(())
    }

    /// Rewrites the whole container compactly (header, table, data region)
    /// and mirrors the sidecar. Used by purge and master-secret rotation.
    ///
    /// `payloads` maps every surviving entry to its (possibly re-sealed)
    /// payload bytes; locators are reassigned contiguously. On any failure
    /// the on-disk state is restored to the pre-operation image.
    pub(crate) fn rewrite_full(
        &mut self,
        payloads: &BTreeMap<EntryId, Vec<u8>>,
        new_master: Option<(MasterKey, [u8; crate::format::SALT_SIZE])>,
    ) -> MyfsResult<()> {
        let old_image_len = usize::try_from(self.container.len()?).map_err(|_| {
            MyfsError::io(
                "rewriting container",
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "container too large"),
            )
        })?;
        let old_image = self.container.read_at(0, old_image_len)?;

        let (key, salt) = match &new_master {
            Some((key, salt)) => (key.clone(), *salt),
            None => (self.master_key.clone(), self.header.master_salt),
        };

        let rebuilt = rebuild_image(
            self.header.volume_id,
            salt,
            self.header.kdf,
            &key,
            &mut self.table,
            payloads,
            unix_now(),
        )?;

        self.container.replace_contents(&rebuilt.image)?;
        if let Err(e) = write_sidecar_raw(&mut self.sidecar, &rebuilt.header, &rebuilt.sealed_table)
        {
            // Put the old container image back so both sides stay consistent.
            let _ = self.container.replace_contents(&old_image);
            return Err(e);
        }

        self.header = rebuilt.header;
        self.master_key = key;
        Ok(())
    }

    pub(crate) const fn table(&self) -> &FileTable {
        &self.table
    }

    pub(crate) fn table_mut(&mut self) -> &mut FileTable {
        &mut self.table
    }

    pub(crate) const fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut VolumeHeader {
        &mut self.header
    }

    pub(crate) const fn master_key(&self) -> &MasterKey {
        &self.master_key
    }

    pub(crate) fn snapshot_table(&self) -> FileTable {
        self.table.clone()
    }

    pub(crate) fn restore_table(&mut self, snapshot: FileTable) {
        self.table = snapshot;
    }

    pub(crate) fn container_mut(&mut self) -> &mut S {
        &mut self.container
    }

    pub(crate) fn sidecar_mut(&mut self) -> &mut S {
        &mut self.sidecar
    }
}

impl<S: VolumeStore> Drop for Volume<S> {
    fn drop(&mut self) {
        self.master_key.zeroize();
    }
}

impl<S: VolumeStore> std::fmt::Debug for Volume<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("volume_id", &self.header.volume_id)
            .field("sequence", &self.table.sequence())
            .field("entries", &self.table.len())
            .finish_non_exhaustive()
    }
}

// Path-level API over real files.

impl Volume<FileStore> {
    /// Formats a new volume at `container_path` with its sidecar at
    /// `sidecar_path`, writing the machine binding record beside the
    /// container.
    ///
    /// # Errors
    ///
    /// Fails if either file exists or any write fails; partially created
    /// files are truncated.
    pub fn format<P: AsRef<Path>, Q: AsRef<Path>>(
        session: &Session,
        container_path: P,
        sidecar_path: Q,
        master_secret: &str,
        kdf: KdfParams,
    ) -> MyfsResult<Self> {
        let mut container = FileStore::create(container_path.as_ref())?;
        container.lock_exclusive()?;
        let sidecar = FileStore::create(sidecar_path.as_ref())?;

        let fingerprint = Fingerprint::collect();
        let (volume, binding) =
            Self::format_with(session, container, sidecar, master_secret, kdf, &fingerprint)?;

        let binding_path = machine_record_path(container_path.as_ref());
        std::fs::write(&binding_path, binding.encode())
            .map_err(|e| MyfsError::io(format!("writing {}", binding_path.display()), e))?;
        Ok(volume)
    }

    /// Opens the volume at `container_path`, holding the container's
    /// advisory exclusive lock for the volume's lifetime.
    ///
    /// # Errors
    ///
    /// `Locked` when another process holds the container,
    /// plus everything [`Volume::open_with`] can return.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        session: &Session,
        container_path: P,
        sidecar_path: Q,
        master_secret: &str,
        options: OpenOptions,
    ) -> MyfsResult<(Self, OpenReport)> {
        let mut container = FileStore::open(container_path.as_ref(), false)?;
        container.lock_exclusive()?;
        let sidecar = FileStore::open(sidecar_path.as_ref(), true)?;

        let binding_path = machine_record_path(container_path.as_ref());
        let binding = match std::fs::read(&binding_path) {
            Ok(bytes) => Some(MachineBinding::decode(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(MyfsError::io(
                    format!("reading {}", binding_path.display()),
                    e,
                ))
            }
        };

        let fingerprint = Fingerprint::collect();
        let (volume, report) = Self::open_with(
            session,
            container,
            sidecar,
            master_secret,
            binding.as_ref(),
            &fingerprint,
            options,
        )?;

        if let Some(fresh) = &report.new_binding {
            std::fs::write(&binding_path, fresh.encode())
                .map_err(|e| MyfsError::io(format!("writing {}", binding_path.display()), e))?;
        }
        Ok((volume, report))
    }
}

/// The binding record path for a container: `<container>.machine`.
#[must_use]
pub fn machine_record_path(container_path: &Path) -> PathBuf {
    let mut name = container_path.as_os_str().to_os_string();
    name.push(".machine");
    PathBuf::from(name)
}

// Shared low-level helpers.

/// Reads and authenticates the container header with the candidate secret.
pub(crate) fn resolve_header<S: VolumeStore>(
    container: &mut S,
    master_secret: &str,
) -> MyfsResult<(VolumeHeader, MasterKey)> {
    if container.len()? < HEADER_SIZE {
        return Err(MyfsError::unrecoverable("container header truncated"));
    }
    let bytes = container.read_at(0, HEADER_SIZE as usize)?;
    let (header, tag) = VolumeHeader::decode(&bytes)?;
    let key = derive_master_key(master_secret, &header.master_salt, &header.kdf)?;
    header.verify_tag(&tag, &key)?;
    Ok((header, key))
}

/// Reads the container's sealed table segment, `None` when unreadable.
pub(crate) fn read_container_table<S: VolumeStore>(
    container: &mut S,
    header: &VolumeHeader,
) -> Option<Vec<u8>> {
    let len = usize::try_from(header.table_length).ok()?;
    container.read_at(header.table_offset, len).ok()
}

/// Reads the sidecar's sealed table segment, `None` when unreadable or the
/// prefix names a different volume.
pub(crate) fn read_sidecar_table<S: VolumeStore>(
    sidecar: &mut S,
    header: &VolumeHeader,
) -> Option<Vec<u8>> {
    let total = sidecar.len().ok()?;
    if total <= SIDECAR_PREFIX_SIZE {
        return None;
    }
    let prefix_bytes = sidecar.read_at(0, SIDECAR_PREFIX_SIZE as usize).ok()?;
    let prefix = SidecarPrefix::decode(&prefix_bytes).ok()?;
    if prefix.volume_id != header.volume_id {
        return None;
    }
    let table_len = usize::try_from(total - SIDECAR_PREFIX_SIZE).ok()?;
    sidecar.read_at(SIDECAR_PREFIX_SIZE, table_len).ok()
}

/// Appends a sealed table to the container and flips the header pointers.
/// The pointer rewrite is the publish point.
pub(crate) fn publish_table_raw<S: VolumeStore>(
    container: &mut S,
    header: &mut VolumeHeader,
    sealed: &[u8],
) -> MyfsResult<()> {
    let offset = container.append(sealed)?;
    container.sync()?;
    header.table_offset = offset;
    header.table_length = sealed.len() as u64;
    container.write_at(HEADER_POINTER_OFFSET, &header.encode_pointers())?;
    container.sync()
}

/// Rewrites the sidecar as prefix plus the given sealed table bytes.
pub(crate) fn write_sidecar_raw<S: VolumeStore>(
    sidecar: &mut S,
    header: &VolumeHeader,
    sealed: &[u8],
) -> MyfsResult<()> {
    let mut bytes = Vec::with_capacity(SIDECAR_PREFIX_SIZE as usize + sealed.len());
    bytes.extend_from_slice(&header.encode_sidecar_prefix());
    bytes.extend_from_slice(sealed);
    sidecar.replace_contents(&bytes)?;
    sidecar.sync()
}

/// A compact container image with its header and sealed table.
pub(crate) struct RebuiltImage {
    pub image: Vec<u8>,
    pub header: VolumeHeader,
    pub sealed_table: Vec<u8>,
}

/// Builds a canonical container image: header at 0, table at 122, payloads
/// packed contiguously after it. Entry locators are reassigned in current
/// on-disk order and the table sequence is bumped.
pub(crate) fn rebuild_image(
    volume_id: VolumeId,
    master_salt: [u8; crate::format::SALT_SIZE],
    kdf: KdfParams,
    key: &MasterKey,
    table: &mut FileTable,
    payloads: &BTreeMap<EntryId, Vec<u8>>,
    now: u64,
) -> MyfsResult<RebuiltImage> {
    let sealed_len = table.serialized_len() + SEAL_OVERHEAD;
    let data_offset = HEADER_SIZE + sealed_len as u64;

    let plan = table.relocation_plan(data_offset);
    for step in &plan {
        let entry = table
            .get_mut(step.id)
            .ok_or_else(|| MyfsError::unrecoverable("relocation plan names unknown entry"))?;
        entry.locator = step.to;
    }

    table.bump_sequence(now);
    let sealed_table = table.seal(key, &volume_id)?;
    debug_assert_eq!(sealed_table.len(), sealed_len);

    let header = VolumeHeader::new(
        volume_id,
        master_salt,
        kdf,
        HEADER_SIZE,
        sealed_table.len() as u64,
        data_offset,
    );

    let payload_total: usize = plan
        .iter()
        .map(|step| step.to.length as usize)
        .sum();
    let mut image =
        Vec::with_capacity(HEADER_SIZE as usize + sealed_table.len() + payload_total);
    image.extend_from_slice(&header.seal_and_encode(key)?);
    image.extend_from_slice(&sealed_table);
    for step in &plan {
        let bytes = payloads
            .get(&step.id)
            .ok_or_else(|| MyfsError::unrecoverable("missing payload for rebuilt entry"))?;
        if bytes.len() as u64 != step.to.length {
            return Err(MyfsError::unrecoverable("payload length drifted during rebuild"));
        }
        image.extend_from_slice(bytes);
    }

    Ok(RebuiltImage {
        image,
        header,
        sealed_table,
    })
}

/// Current Unix timestamp.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_secs()
}


#[cfg(test)]
mod tests {
    use super::testing::{
        fingerprint, format_memory, other_fingerprint, reopen, session, stores_of, MASTER,
    };
    use super::*;

    #[test]
    fn test_format_writes_canonical_layout() {
        let (volume, _) = format_memory();
        assert_eq!(volume.header().table_offset, HEADER_SIZE);
        assert_eq!(
            volume.header().data_offset,
            HEADER_SIZE + volume.header().table_length
        );
        assert_eq!(volume.sequence(), 1);
    }

    #[test]
    fn test_format_then_open_roundtrip() {
        let (volume, binding) = format_memory();
        let volume_id = volume.volume_id();
        let (container, sidecar) = stores_of(&volume);
        drop(volume);

        let (reopened, report) =
            reopen(container, sidecar, &binding, OpenOptions::checked()).unwrap();
        assert_eq!(reopened.volume_id(), volume_id);
        assert!(!report.adopted_sidecar);
        assert!(!report.repaired_sidecar);
        assert!(report.lost_entries.is_empty());
    }

    #[test]
    fn test_open_wrong_secret_is_auth_failed() {
        let (volume, binding) = format_memory();
        let (container, sidecar) = stores_of(&volume);
        drop(volume);

        let result = Volume::open_with(
            &session(),
            container,
            sidecar,
            "not-the-secret",
            Some(&binding),
            &fingerprint(),
            OpenOptions::default(),
        );
        assert!(matches!(result, Err(MyfsError::AuthFailed)));
    }

    #[test]
    fn test_open_missing_binding_is_auth_failed() {
        let (volume, _) = format_memory();
        let (container, sidecar) = stores_of(&volume);
        drop(volume);

        let result = Volume::open_with(
            &session(),
            container,
            sidecar,
            MASTER,
            None,
            &fingerprint(),
            OpenOptions::default(),
        );
        assert!(matches!(result, Err(MyfsError::AuthFailed)));
    }

    #[test]
    fn test_open_on_other_machine_is_auth_failed() {
        let (volume, binding) = format_memory();
        let (container, sidecar) = stores_of(&volume);
        drop(volume);

        let result = Volume::open_with(
            &session(),
            container,
            sidecar,
            MASTER,
            Some(&binding),
            &other_fingerprint(),
            OpenOptions::default(),
        );
        assert!(matches!(result, Err(MyfsError::AuthFailed)));
    }

    #[test]
    fn test_rebind_on_other_machine() {
        let (volume, binding) = format_memory();
        let (container, sidecar) = stores_of(&volume);
        drop(volume);

        let options = OpenOptions {
            rebind: true,
            ..OpenOptions::default()
        };
        let (reopened, report) = Volume::open_with(
            &session(),
            container,
            sidecar,
            MASTER,
            Some(&binding),
            &other_fingerprint(),
            options,
        )
        .unwrap();
        assert!(report.rebound);
        let fresh = report.new_binding.unwrap();
        fresh
            .verify(
                &other_fingerprint(),
                &reopened.volume_id(),
                &KdfParams::insecure_for_tests(),
            )
            .unwrap();
    }

    #[test]
    fn test_missing_binding_with_rebind_succeeds() {
        let (volume, _) = format_memory();
        let (container, sidecar) = stores_of(&volume);
        drop(volume);

        let options = OpenOptions {
            rebind: true,
            ..OpenOptions::default()
        };
        let (_, report) = Volume::open_with(
            &session(),
            container,
            sidecar,
            MASTER,
            None,
            &fingerprint(),
            options,
        )
        .unwrap();
        assert!(report.rebound);
        assert!(report.new_binding.is_some());
    }

    #[test]
    fn test_corrupt_container_table_falls_back_to_sidecar() {
        let (volume, binding) = format_memory();
        let header = volume.header().clone();
        let (mut container, sidecar) = stores_of(&volume);
        drop(volume);

        // Zero out the tail of the table segment.
        let start = usize::try_from(header.table_offset).unwrap()
            + usize::try_from(header.table_length).unwrap()
            - 8;
        container.corrupt_at(start, 8);

        let (reopened, report) =
            reopen(container, sidecar, &binding, OpenOptions::checked()).unwrap();
        assert!(report.adopted_sidecar);
        assert!(report.repaired_container);
        assert_eq!(reopened.sequence(), 1);

        // A second open needs no repair.
        let (container, sidecar) = stores_of(&reopened);
        drop(reopened);
        let (_, report) = reopen(container, sidecar, &binding, OpenOptions::checked()).unwrap();
        assert!(!report.adopted_sidecar);
        assert!(!report.repaired_container);
    }

    #[test]
    fn test_corrupt_sidecar_is_rewritten_from_container() {
        let (volume, binding) = format_memory();
        let (container, mut sidecar) = stores_of(&volume);
        drop(volume);

        sidecar.corrupt_at(60, 8);

        let (reopened, report) =
            reopen(container, sidecar, &binding, OpenOptions::checked()).unwrap();
        assert!(report.repaired_sidecar);
        assert!(!report.adopted_sidecar);

        let (container, sidecar) = stores_of(&reopened);
        drop(reopened);
        let (_, report) = reopen(container, sidecar, &binding, OpenOptions::checked()).unwrap();
        assert!(!report.repaired_sidecar);
    }

    #[test]
    fn test_both_tables_corrupt_is_table_corrupt() {
        let (volume, binding) = format_memory();
        let header = volume.header().clone();
        let (mut container, mut sidecar) = stores_of(&volume);
        drop(volume);

        let start = usize::try_from(header.table_offset).unwrap();
        container.corrupt_at(start, usize::try_from(header.table_length).unwrap());
        sidecar.corrupt_at(
            SIDECAR_PREFIX_SIZE as usize,
            usize::try_from(header.table_length).unwrap(),
        );

        let result = reopen(container, sidecar, &binding, OpenOptions::default());
        assert!(matches!(result, Err(MyfsError::TableCorrupt)));
    }

    #[test]
    fn test_machine_record_path_appends_extension() {
        let path = machine_record_path(Path::new("/tmp/vol.DRI"));
        assert_eq!(path, PathBuf::from("/tmp/vol.DRI.machine"));
    }

    #[test]
    fn test_inactivity_timeout_expires_volume() {
        let (mut volume, _) = format_memory();
        volume.inactivity_timeout = Some(Duration::from_millis(0));
        volume.last_activity = Instant::now() - Duration::from_secs(1);

        assert!(matches!(volume.ensure_active(), Err(MyfsError::AuthFailed)));
        // Stays expired even after the clock moves on.
        assert!(matches!(volume.ensure_active(), Err(MyfsError::AuthFailed)));
    }
}
