//! The in-memory file table and its sealed wire form.
//!
//! The table is the canonical index of the volume: an ordered collection
//! keyed by entry id with a secondary index over active display names. Its
//! wire form is a length-prefixed record stream, sealed under the master key
//! with the volume identifier bound into the associated data. The sealed
//! table carries a sequence number bumped on every commit; mirror
//! reconciliation compares sequences to find the survivor of a crashed
//! commit.

// Binary format code uses small constant casts that are safe
#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;

use crate::crypto::aead;
use crate::crypto::MasterKey;
use crate::error::{MyfsError, MyfsResult};
use crate::format::{DIGEST_SIZE, LABEL_TABLE, SALT_SIZE, TABLE_VERSION};
use crate::types::{ContentDigest, EntryId, EntryState, FileEntry, Locator, VolumeId};

/// Fixed serialized header: version, sequence, updated-at, next id, count.
const TABLE_HEADER_SIZE: usize = 2 + 8 + 8 + 8 + 4;

/// One step of a data-region rewrite plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Entry whose payload moves.
    pub id: EntryId,
    /// Current payload location.
    pub from: Locator,
    /// Destination after the rewrite.
    pub to: Locator,
}

/// The volume's canonical file index.
#[derive(Debug, Clone, Default)]
pub struct FileTable {
    sequence: u64,
    updated_at: u64,
    next_id: u64,
    entries: BTreeMap<EntryId, FileEntry>,
    active_names: BTreeMap<String, EntryId>,
    retired_names: BTreeMap<String, Vec<EntryId>>,
}

impl FileTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Returns the commit sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the timestamp of the last commit.
    #[must_use]
    pub const fn updated_at(&self) -> u64 {
        self.updated_at
    }

    /// Increments the sequence number and stamps the update time.
    pub fn bump_sequence(&mut self, now: u64) {
        self.sequence += 1;
        self.updated_at = now;
    }

    /// Allocates the next entry id. Ids are strictly increasing and never
    /// reused, even after purge.
    pub fn allocate_id(&mut self) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Number of entries, including deleted ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates all entries in id order.
    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    /// Looks up an entry by id.
    #[must_use]
    pub fn get(&self, id: EntryId) -> Option<&FileEntry> {
        self.entries.get(&id)
    }

    /// Looks up an entry by id, mutably.
    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut FileEntry> {
        self.entries.get_mut(&id)
    }

    /// Finds an entry by display name.
    ///
    /// Active entries win; with `include_deleted` the most recently created
    /// non-active entry of that name is returned as a fallback.
    #[must_use]
    pub fn find_by_name(&self, name: &str, include_deleted: bool) -> Option<&FileEntry> {
        if let Some(id) = self.active_names.get(name) {
            return self.entries.get(id);
        }
        if include_deleted {
            return self.find_retired_by_name(name);
        }
        None
    }

    /// Finds the most recently created non-active entry with this name,
    /// regardless of whether an active entry shares it.
    #[must_use]
    pub fn find_retired_by_name(&self, name: &str) -> Option<&FileEntry> {
        self.retired_names
            .get(name)
            .and_then(|ids| ids.last())
            .and_then(|id| self.entries.get(id))
    }

    /// Inserts a new entry.
    ///
    /// # Errors
    ///
    /// Returns [`MyfsError::NameTaken`] if the entry is active and its name
    /// collides with another active entry.
    pub fn insert(&mut self, entry: FileEntry) -> MyfsResult<()> {
        if entry.state == EntryState::Active && self.active_names.contains_key(&entry.name) {
            return Err(MyfsError::name_taken(entry.name));
        }
        match entry.state {
            EntryState::Active => {
                self.active_names.insert(entry.name.clone(), entry.id);
            }
            EntryState::SoftDeleted | EntryState::PendingPurge => {
                self.retired_names
                    .entry(entry.name.clone())
                    .or_default()
                    .push(entry.id);
            }
        }
        if entry.id.value() >= self.next_id {
            self.next_id = entry.id.value() + 1;
        }
        self.entries.insert(entry.id, entry);
        Ok(())
    }

    /// Transitions an entry to a new lifecycle state.
    ///
    /// Permitted transitions: Active → SoftDeleted (soft delete),
    /// SoftDeleted → Active (recover), Active/SoftDeleted → PendingPurge
    /// (hard delete), and PendingPurge → Active/SoftDeleted (rollback within
    /// the owning operation). Entries leave the table only through
    /// [`FileTable::remove_purged`].
    ///
    /// # Errors
    ///
    /// Returns [`MyfsError::NotFound`] for an unknown id,
    /// [`MyfsError::NameTaken`] when a recover would collide with an active
    /// name, and [`MyfsError::Unrecoverable`] for a transition the lifecycle
    /// forbids.
    pub fn transition(&mut self, id: EntryId, new_state: EntryState, now: u64) -> MyfsResult<()> {
        let (old_state, name) = match self.entries.get(&id) {
            Some(entry) => (entry.state, entry.name.clone()),
            None => return Err(MyfsError::not_found(format!("entry #{id}"))),
        };

        let allowed = matches!(
            (old_state, new_state),
            (EntryState::Active, EntryState::SoftDeleted | EntryState::PendingPurge)
                | (EntryState::SoftDeleted, EntryState::Active | EntryState::PendingPurge)
                | (EntryState::PendingPurge, EntryState::Active | EntryState::SoftDeleted)
        );
        if !allowed {
            return Err(MyfsError::unrecoverable(format!(
                "invalid lifecycle transition for entry #{id}"
            )));
        }

        if new_state == EntryState::Active && self.active_names.contains_key(&name) {
            return Err(MyfsError::name_taken(name));
        }

        // Maintain the name indexes.
        match (old_state, new_state) {
            (EntryState::Active, _) => {
                self.active_names.remove(&name);
                self.retired_names.entry(name.clone()).or_default().push(id);
            }
            (_, EntryState::Active) => {
                if let Some(ids) = self.retired_names.get_mut(&name) {
                    ids.retain(|other| *other != id);
                    if ids.is_empty() {
                        self.retired_names.remove(&name);
                    }
                }
                self.active_names.insert(name, id);
            }
            _ => {}
        }

        let entry = self.entries.get_mut(&id).expect("entry existence checked");
        entry.state = new_state;
        match new_state {
            EntryState::Active => entry.deleted_at = None,
            EntryState::SoftDeleted | EntryState::PendingPurge => {
                if entry.deleted_at.is_none() {
                    entry.deleted_at = Some(now);
                }
            }
        }
        Ok(())
    }

    /// Removes every entry in the `PendingPurge` state, returning them.
    pub fn remove_purged(&mut self) -> Vec<FileEntry> {
        let ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.state == EntryState::PendingPurge)
            .map(|e| e.id)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.entries.remove(&id) {
                if let Some(names) = self.retired_names.get_mut(&entry.name) {
                    names.retain(|other| *other != id);
                    if names.is_empty() {
                        self.retired_names.remove(&entry.name);
                    }
                }
                removed.push(entry);
            }
        }
        removed
    }

    /// Produces a rewrite plan packing every payload contiguously from
    /// `data_offset`, preserving the current on-disk order.
    #[must_use]
    pub fn relocation_plan(&self, data_offset: u64) -> Vec<Relocation> {
        let mut by_offset: Vec<&FileEntry> = self.entries.values().collect();
        by_offset.sort_by_key(|e| e.locator.offset);

        let mut next = data_offset;
        let mut plan = Vec::with_capacity(by_offset.len());
        for entry in by_offset {
            plan.push(Relocation {
                id: entry.id,
                from: entry.locator,
                to: Locator::new(next, entry.locator.length),
            });
            next += entry.locator.length;
        }
        plan
    }

    /// Serializes the table to its wire form.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        buf.extend_from_slice(&TABLE_VERSION.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.updated_at.to_be_bytes());
        buf.extend_from_slice(&self.next_id.to_be_bytes());
        buf.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());

        for entry in self.entries.values() {
            let record = encode_record(entry);
            buf.extend_from_slice(&(record.len() as u32).to_be_bytes());
            buf.extend_from_slice(&record);
        }
        buf
    }

    /// Exact byte length of [`FileTable::serialize`] output.
    #[must_use]
    pub fn serialized_len(&self) -> usize {
        TABLE_HEADER_SIZE
            + self
                .entries
                .values()
                .map(|e| 4 + record_len(e))
                .sum::<usize>()
    }

    /// Deserializes a table from its wire form.
    ///
    /// # Errors
    ///
    /// Returns [`MyfsError::TableCorrupt`] on any structural violation.
    pub fn deserialize(bytes: &[u8]) -> MyfsResult<Self> {
        let mut reader = Reader::new(bytes);
        let version = reader.u16()?;
        if version != TABLE_VERSION {
            return Err(MyfsError::TableCorrupt);
        }
        let sequence = reader.u64()?;
        let updated_at = reader.u64()?;
        let next_id = reader.u64()?;
        let count = reader.u32()?;

        let mut table = Self {
            sequence,
            updated_at,
            next_id,
            ..Self::default()
        };
        for _ in 0..count {
            let record_len = reader.u32()? as usize;
            let record = reader.bytes(record_len)?;
            let entry = decode_record(record)?;
            if entry.id.value() >= next_id || table.entries.contains_key(&entry.id) {
                return Err(MyfsError::TableCorrupt);
            }
            table.insert(entry).map_err(|_| MyfsError::TableCorrupt)?;
        }
        // next_id round-trips exactly; insert never raises it past the
        // serialized value because every id was checked above.
        table.next_id = next_id;
        if !reader.is_exhausted() {
            return Err(MyfsError::TableCorrupt);
        }
        Ok(table)
    }

    /// Serializes and seals the table under the master key.
    ///
    /// # Errors
    ///
    /// Returns an error if sealing fails.
    pub fn seal(&self, key: &MasterKey, volume_id: &VolumeId) -> MyfsResult<Vec<u8>> {
        let aad = aead::role_aad(LABEL_TABLE, volume_id.as_bytes());
        aead::seal(key.as_bytes(), &aad, &self.serialize())
    }

    /// Opens a sealed table segment.
    ///
    /// # Errors
    ///
    /// Returns [`MyfsError::TableCorrupt`] if the segment does not open under
    /// the key or fails structural validation.
    pub fn open_sealed(
        sealed: &[u8],
        key: &MasterKey,
        volume_id: &VolumeId,
    ) -> MyfsResult<Self> {
        let aad = aead::role_aad(LABEL_TABLE, volume_id.as_bytes());
        let plaintext =
            aead::open(key.as_bytes(), &aad, sealed).map_err(|_| MyfsError::TableCorrupt)?;
        Self::deserialize(&plaintext)
    }
}

const FLAG_PROTECTED: u8 = 0b0000_0001;

fn record_len(entry: &FileEntry) -> usize {
    // id + state + name len + name + sizes + timestamp + salt + digest
    // + locator + flags
    let mut len = 8 + 1 + 2 + entry.name.len() + 8 + 8 + 8 + SALT_SIZE + DIGEST_SIZE + 16 + 1;
    if let Some(wrapped) = &entry.wrapped_key {
        len += 2 + wrapped.len();
    }
    if entry.state != EntryState::Active {
        len += 8;
    }
    len
}

fn encode_record(entry: &FileEntry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(record_len(entry));
    buf.extend_from_slice(&entry.id.value().to_be_bytes());
    buf.push(entry.state.as_u8());
    buf.extend_from_slice(&(entry.name.len() as u16).to_be_bytes());
    buf.extend_from_slice(entry.name.as_bytes());
    buf.extend_from_slice(&entry.original_size.to_be_bytes());
    buf.extend_from_slice(&entry.ciphertext_size.to_be_bytes());
    buf.extend_from_slice(&entry.imported_at.to_be_bytes());
    buf.extend_from_slice(&entry.salt);
    buf.extend_from_slice(entry.digest.as_bytes());
    buf.extend_from_slice(&entry.locator.offset.to_be_bytes());
    buf.extend_from_slice(&entry.locator.length.to_be_bytes());

    let mut flags = 0u8;
    if entry.wrapped_key.is_some() {
        flags |= FLAG_PROTECTED;
    }
    buf.push(flags);
    if let Some(wrapped) = &entry.wrapped_key {
        buf.extend_from_slice(&(wrapped.len() as u16).to_be_bytes());
        buf.extend_from_slice(wrapped);
    }
    if entry.state != EntryState::Active {
        buf.extend_from_slice(&entry.deleted_at.unwrap_or_default().to_be_bytes());
    }
    buf
}

fn decode_record(bytes: &[u8]) -> MyfsResult<FileEntry> {
    let mut reader = Reader::new(bytes);
    let id = EntryId(reader.u64()?);
    let state = EntryState::from_u8(reader.u8()?).ok_or(MyfsError::TableCorrupt)?;
    let name_len = reader.u16()? as usize;
    let name = String::from_utf8(reader.bytes(name_len)?.to_vec())
        .map_err(|_| MyfsError::TableCorrupt)?;
    let original_size = reader.u64()?;
    let ciphertext_size = reader.u64()?;
    let imported_at = reader.u64()?;
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(reader.bytes(SALT_SIZE)?);
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(reader.bytes(DIGEST_SIZE)?);
    let offset = reader.u64()?;
    let length = reader.u64()?;
    let flags = reader.u8()?;

    let wrapped_key = if flags & FLAG_PROTECTED == 0 {
        None
    } else {
        let wrapped_len = reader.u16()? as usize;
        Some(reader.bytes(wrapped_len)?.to_vec())
    };
    let deleted_at = if state == EntryState::Active {
        None
    } else {
        Some(reader.u64()?)
    };
    if !reader.is_exhausted() {
        return Err(MyfsError::TableCorrupt);
    }

    Ok(FileEntry {
        id,
        name,
        original_size,
        ciphertext_size,
        imported_at,
        salt,
        wrapped_key,
        digest: ContentDigest::new(digest),
        locator: Locator::new(offset, length),
        state,
        deleted_at,
    })
}

/// Bounds-checked big-endian reader over a byte slice.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> MyfsResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(MyfsError::TableCorrupt)?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> MyfsResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> MyfsResult<u16> {
        Ok(u16::from_be_bytes(
            self.bytes(2)?.try_into().expect("slice length is 2"),
        ))
    }

    fn u32(&mut self) -> MyfsResult<u32> {
        Ok(u32::from_be_bytes(
            self.bytes(4)?.try_into().expect("slice length is 4"),
        ))
    }

    fn u64(&mut self) -> MyfsResult<u64> {
        Ok(u64::from_be_bytes(
            self.bytes(8)?.try_into().expect("slice length is 8"),
        ))
    }

    const fn is_exhausted(&self) -> bool {
        self.pos == self.bytes.len()
    }
}
