// vault_core is the container engine library implementing the vault format.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Raw byte-level access to the container file: the fixed prefix (superblock
//! plus two header slots), the append-only data region after it, and the
//! advisory SHA-256 tail some callers opt to write after a rebuild. Nothing
//! in this module knows what the bytes in the data region mean -- that is
//! `index.rs`'s and `vault.rs`'s job.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{Result, VaultError};
use crate::header::{self, Slot, Superblock, DATA_REGION_START, SLOT_LEN};

/// Length of the advisory SHA-256 tail appended by [`write_integrity_tail`].
pub const INTEGRITY_TAIL_LEN: u64 = 32;

pub fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

pub fn create_new(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).create_new(true).open(path)?)
}

pub fn read_superblock(f: &mut File) -> Result<Superblock> {
    let mut buf = vec![0u8; header::SUPERBLOCK_LEN as usize];
    f.seek(SeekFrom::Start(0))?;
    f.read_exact(&mut buf)?;
    Superblock::decode(&buf)
}

pub fn write_superblock(f: &mut File, sb: &Superblock) -> Result<()> {
    f.seek(SeekFrom::Start(0))?;
    f.write_all(&sb.encode())?;
    Ok(())
}

pub fn read_slot(f: &mut File, idx: u8) -> Result<Option<Slot>> {
    let mut buf = vec![0u8; SLOT_LEN as usize];
    f.seek(SeekFrom::Start(header::slot_offset(idx)))?;
    f.read_exact(&mut buf)?;
    Ok(Slot::decode(&buf))
}

/// Writes a slot and flushes it to stable storage before returning. The
/// inactive slot is always written (and synced) before the superblock or
/// the in-memory state is updated, so a crash here simply leaves the
/// previously active slot intact.
pub fn write_slot(f: &mut File, idx: u8, slot: &Slot) -> Result<()> {
    f.seek(SeekFrom::Start(header::slot_offset(idx)))?;
    f.write_all(&slot.encode())?;
    f.sync_data()?;
    Ok(())
}

pub fn read_range(f: &mut File, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len as usize];
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(&mut buf)?;
    Ok(buf)
}

/// Appends `data` at `offset`, which the caller must have already reserved
/// via the in-memory `data_end` cursor (never derived from the file's raw
/// length, which may include garbage from an aborted append).
pub fn write_at(f: &mut File, offset: u64, data: &[u8]) -> Result<()> {
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(data)?;
    Ok(())
}

pub fn sync(f: &mut File) -> Result<()> {
    f.sync_data()?;
    Ok(())
}

/// Computes the advisory SHA-256 digest over the first `len` bytes of the
/// data region (i.e. everything up to and including the active index
/// blob). Never consulted to decide whether a container opens; a mismatch
/// is only ever surfaced as a warning to the caller.
pub fn compute_integrity_tail(f: &mut File, region_len: u64) -> Result<[u8; 32]> {
    let region = read_range(f, DATA_REGION_START, region_len)?;
    Ok(crate::crypto::sha256(&region))
}

pub fn write_integrity_tail(f: &mut File, data_end: u64, tail: &[u8; 32]) -> Result<()> {
    write_at(f, data_end, tail)?;
    sync(f)
}

pub fn read_integrity_tail(f: &mut File, data_end: u64) -> Result<[u8; 32]> {
    let buf = read_range(f, data_end, INTEGRITY_TAIL_LEN)?;
    buf.try_into().map_err(|_| VaultError::Corrupt("integrity tail truncated".into()))
}

/// Rebuilds the container into a fresh temporary file containing only the
/// live data (reachable blobs plus the active index), then atomically
/// renames it over `path`. Uses [`tempfile::NamedTempFile`] in the same
/// directory as `path` so the final rename is same-filesystem and therefore
/// atomic; a crash at any point before the rename leaves the original file
/// untouched.
///
/// `writer` receives the new file (already sized to hold the fixed prefix)
/// and must write the superblock, both slots, and the data region itself;
/// it returns the new `data_end`.
pub fn rebuild_atomically<W>(path: &Path, writer: W) -> Result<()>
where
    W: FnOnce(&mut File) -> Result<u64>,
{
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;

    {
        let file = tmp.as_file_mut();
        file.set_len(DATA_REGION_START)?;
        writer(file)?;
        file.sync_all()?;
    }

    tmp.persist(path).map_err(|e| VaultError::Io(e.error))?;

    // fsync the containing directory so the rename itself survives a crash.
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }

    Ok(())
}

/// Removes a container file and any leftover temporary rebuild artifacts
/// from a previous crash. Exposed for the CLI's `destroy` operation; the
/// core itself never calls this.
pub fn remove_container(path: &Path) -> Result<()> {
    fs::remove_file(path)?;
    Ok(())
}
