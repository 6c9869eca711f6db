//! Single-user encrypted virtual volume.
//!
//! A volume is one container file holding any number of user files, each
//! optionally guarded by its own secret, with soft-delete recovery, tamper
//! detection, and backup-based repair. The container's metadata is mirrored
//! to a detachable sidecar so losing either copy does not destroy the
//! volume, and every volume is bound to the machine it was formatted on.
//!
//! # Layout
//!
//! ```text
//! volume.DRI          container: header, sealed table, data region
//! volume.IXF          sidecar: identity prefix + sealed table mirror
//! volume.DRI.machine  machine binding record
//! ```
//!
//! # Session flow
//!
//! ```no_run
//! use myfs_core::{KdfParams, OpenOptions, Session, Volume};
//!
//! # fn main() -> Result<(), myfs_core::MyfsError> {
//! let session = Session::open("myfs-20240307")?;
//! let mut volume = Volume::format(
//!     &session,
//!     "/tmp/v.DRI",
//!     "/tmp/v.IXF",
//!     "hunter2",
//!     KdfParams::default(),
//! )?;
//! volume.import("greet.txt", b"hello world", None)?;
//! volume.close()?;
//!
//! let (mut volume, report) = Volume::open(
//!     &session,
//!     "/tmp/v.DRI",
//!     "/tmp/v.IXF",
//!     "hunter2",
//!     OpenOptions::checked(),
//! )?;
//! assert!(report.lost_entries.is_empty());
//! let bytes = volume.export("greet.txt", None, myfs_core::ExportMode::Normal)?;
//! assert_eq!(bytes, b"hello world");
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod crypto;
pub mod error;
pub mod format;
pub mod header;
pub mod integrity;
pub mod machine;
pub mod session;
pub mod store;
pub mod table;
pub mod types;
pub mod volume;

pub use crypto::kdf::KdfParams;
pub use error::{MyfsError, MyfsResult};
pub use integrity::IntegrityReport;
pub use machine::{Fingerprint, MachineBinding};
pub use session::Session;
pub use store::{FileStore, MemoryStore, VolumeStore};
pub use table::FileTable;
pub use types::{EntryId, EntryInfo, EntryState, ExportMode, VolumeId};
pub use volume::{
    machine_record_path, repair, repair_with, OpenOptions, OpenReport, RepairOutcome, Volume,
};
