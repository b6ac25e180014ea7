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

//! Chunked import and read. Each chunk is sealed independently under the
//! file's DEK with a fresh random nonce, so chunks may arrive (and be
//! re-read) in any order -- there is no running cipher state to resume. The
//! chunk's position binds into the AEAD as associated data, which is what
//! stops a chunk from one file (or one slot of the same file) from being
//! silently accepted in place of another.

use std::collections::HashMap;
use std::fs::File;

use crate::container;
use crate::crypto;
use crate::error::{Result, VaultError};
use crate::index::{ChunkLoc, FileType, Layout};
use crate::keys::Dek;

/// An import in progress. Lives only in memory until [`finish`] produces a
/// finished [`Layout`]; an aborted or abandoned import leaves its appended
/// bytes as unreferenced garbage, reclaimed by the next
/// [`crate::container::rebuild_atomically`] call.
pub struct PendingImport {
    pub file_id: [u8; 16],
    pub name: String,
    pub mime: Option<String>,
    pub file_type: FileType,
    pub dek: Dek,
    pub chunk_size: u32,
    pub total_size: u64,
    pub extra: HashMap<String, Vec<u8>>,
    pub started_ms: u64,
    chunks: HashMap<u32, ChunkLoc>,
}

impl PendingImport {
    fn total_chunks(&self) -> u32 {
        ((self.total_size + self.chunk_size as u64 - 1) / self.chunk_size as u64) as u32
    }

    fn expected_len(&self, chunk_index: u32) -> u64 {
        let start = chunk_index as u64 * self.chunk_size as u64;
        (self.total_size - start).min(self.chunk_size as u64)
    }
}

#[allow(clippy::too_many_arguments)]
pub fn start(
    file_id: [u8; 16],
    name: String,
    mime: Option<String>,
    file_type: FileType,
    dek: Dek,
    chunk_size: u32,
    total_size: u64,
    now_ms: u64,
) -> Result<PendingImport> {
    if chunk_size == 0 {
        return Err(VaultError::InvalidParam("chunk_size must be nonzero".into()));
    }
    if total_size == 0 {
        return Err(VaultError::InvalidParam("total_size must be nonzero".into()));
    }
    Ok(PendingImport {
        file_id,
        name,
        mime,
        file_type,
        dek,
        chunk_size,
        total_size,
        extra: HashMap::new(),
        started_ms: now_ms,
        chunks: HashMap::new(),
    })
}

fn chunk_aad(file_id: &[u8; 16], chunk_index: u32) -> [u8; 20] {
    let mut aad = [0u8; 20];
    aad[..16].copy_from_slice(file_id);
    aad[16..].copy_from_slice(&chunk_index.to_le_bytes());
    aad
}

/// Seals and appends one chunk. `data_end` is the vault's append cursor;
/// it is only advanced after the write succeeds.
pub fn write_chunk(
    pending: &mut PendingImport,
    f: &mut File,
    data_end: &mut u64,
    chunk_index: u32,
    plaintext: &[u8],
) -> Result<()> {
    if chunk_index >= pending.total_chunks() {
        return Err(VaultError::InvalidParam(format!(
            "chunk index {chunk_index} out of range for {} total chunks",
            pending.total_chunks()
        )));
    }
    if pending.chunks.contains_key(&chunk_index) {
        return Err(VaultError::DuplicateChunk(chunk_index));
    }
    if plaintext.len() as u64 != pending.expected_len(chunk_index) {
        return Err(VaultError::InvalidParam(format!(
            "chunk {chunk_index} has length {}, expected {}",
            plaintext.len(),
            pending.expected_len(chunk_index)
        )));
    }

    let nonce = crypto::random_array::<{ crypto::NONCE_LEN }>();
    let aad = chunk_aad(&pending.file_id, chunk_index);
    let sealed = crypto::aead_seal(&pending.dek.0, &nonce, &aad, plaintext)?;

    let mut blob = Vec::with_capacity(crypto::NONCE_LEN + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);

    let offset = *data_end;
    container::write_at(f, offset, &blob)?;
    container::sync(f)?;

    pending.chunks.insert(
        chunk_index,
        ChunkLoc {
            offset,
            len: blob.len() as u32,
        },
    );
    *data_end = offset + blob.len() as u64;
    Ok(())
}

/// Finalizes a completed import into a [`Layout::Chunked`]. Fails with
/// [`VaultError::IncompleteImport`] if any chunk in range is still missing.
pub fn finish(pending: PendingImport) -> Result<Layout> {
    let total = pending.total_chunks();
    let mut chunks = Vec::with_capacity(total as usize);
    for i in 0..total {
        let loc = pending.chunks.get(&i).ok_or(VaultError::IncompleteImport)?;
        chunks.push(*loc);
    }
    Ok(Layout::Chunked {
        chunk_size: pending.chunk_size,
        chunks,
    })
}

/// Reads and authenticates one chunk of an already-finished chunked file.
pub fn read_chunk(dek: &Dek, file_id: &[u8; 16], chunk_index: u32, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < crypto::NONCE_LEN {
        return Err(VaultError::Corrupt("chunk blob truncated".into()));
    }
    let (nonce_bytes, sealed) = blob.split_at(crypto::NONCE_LEN);
    let nonce: [u8; crypto::NONCE_LEN] = nonce_bytes
        .try_into()
        .map_err(|_| VaultError::Corrupt("chunk nonce truncated".into()))?;
    let aad = chunk_aad(file_id, chunk_index);
    crypto::aead_open(&dek.0, &nonce, &aad, sealed)
}

/// Reads and authenticates an inline (non-chunked) blob, bound to `file_id`
/// alone as AAD.
pub fn read_inline(dek: &Dek, file_id: &[u8; 16], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < crypto::NONCE_LEN {
        return Err(VaultError::Corrupt("blob truncated".into()));
    }
    let (nonce_bytes, sealed) = blob.split_at(crypto::NONCE_LEN);
    let nonce: [u8; crypto::NONCE_LEN] = nonce_bytes
        .try_into()
        .map_err(|_| VaultError::Corrupt("blob nonce truncated".into()))?;
    crypto::aead_open(&dek.0, &nonce, file_id, sealed)
}

/// Seals a whole blob in one shot, for the inline (small file) layout.
pub fn seal_inline(dek: &Dek, file_id: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = crypto::random_array::<{ crypto::NONCE_LEN }>();
    let sealed = crypto::aead_seal(&dek.0, &nonce, file_id, plaintext)?;
    let mut blob = Vec::with_capacity(crypto::NONCE_LEN + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

/// Drops every pending import older than `max_age_ms`, returning their ids
/// so the caller can log what was abandoned.
pub fn cleanup_old(pending: &mut HashMap<[u8; 16], PendingImport>, now_ms: u64, max_age_ms: u64) -> Vec<[u8; 16]> {
    let stale: Vec<[u8; 16]> = pending
        .iter()
        .filter(|(_, p)| now_ms.saturating_sub(p.started_ms) > max_age_ms)
        .map(|(id, _)| *id)
        .collect();
    for id in &stale {
        pending.remove(id);
    }
    stale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_dek;
    use tempfile::tempdir;

    fn open_scratch() -> (tempfile::TempDir, File) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scratch.bin");
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        (dir, f)
    }

    #[test]
    fn chunked_roundtrip_with_out_of_order_writes() {
        let (_dir, mut f) = open_scratch();
        let dek = generate_dek();
        let file_id = [5u8; 16];
        let mut pending = start(file_id, "big.bin".into(), None, FileType::Binary, dek.clone(), 4, 10, 1000).unwrap();

        let mut data_end = 0u64;
        write_chunk(&mut pending, &mut f, &mut data_end, 1, b"4567").unwrap();
        write_chunk(&mut pending, &mut f, &mut data_end, 0, b"0123").unwrap();
        write_chunk(&mut pending, &mut f, &mut data_end, 2, b"89").unwrap();

        let layout = finish(pending).unwrap();
        let chunks = match layout {
            Layout::Chunked { chunks, .. } => chunks,
            _ => panic!("expected chunked layout"),
        };
        assert_eq!(chunks.len(), 3);

        let mut out = Vec::new();
        for (i, loc) in chunks.iter().enumerate() {
            let blob = container::read_range(&mut f, loc.offset, loc.len as u64).unwrap();
            out.extend(read_chunk(&dek, &file_id, i as u32, &blob).unwrap());
        }
        assert_eq!(out, b"0123456789");
    }

    #[test]
    fn duplicate_chunk_is_rejected() {
        let (_dir, mut f) = open_scratch();
        let dek = generate_dek();
        let file_id = [1u8; 16];
        let mut pending = start(file_id, "a".into(), None, FileType::Binary, dek, 4, 4, 0).unwrap();
        let mut data_end = 0u64;
        write_chunk(&mut pending, &mut f, &mut data_end, 0, b"abcd").unwrap();
        assert!(matches!(
            write_chunk(&mut pending, &mut f, &mut data_end, 0, b"abcd"),
            Err(VaultError::DuplicateChunk(0))
        ));
    }

    #[test]
    fn finish_fails_when_chunks_missing() {
        let (_dir, mut f) = open_scratch();
        let dek = generate_dek();
        let file_id = [1u8; 16];
        let mut pending = start(file_id, "a".into(), None, FileType::Binary, dek, 4, 8, 0).unwrap();
        let mut data_end = 0u64;
        write_chunk(&mut pending, &mut f, &mut data_end, 0, b"abcd").unwrap();
        assert!(matches!(finish(pending), Err(VaultError::IncompleteImport)));
    }

    #[test]
    fn inline_seal_open_roundtrips() {
        let dek = generate_dek();
        let file_id = [2u8; 16];
        let blob = seal_inline(&dek, &file_id, b"hello").unwrap();
        let back = read_inline(&dek, &file_id, &blob).unwrap();
        assert_eq!(back, b"hello");
    }

    #[test]
    fn cleanup_old_evicts_stale_entries_only() {
        let mut pending = HashMap::new();
        pending.insert(
            [1u8; 16],
            start([1u8; 16], "old".into(), None, FileType::Binary, generate_dek(), 4, 4, 0).unwrap(),
        );
        pending.insert(
            [2u8; 16],
            start([2u8; 16], "new".into(), None, FileType::Binary, generate_dek(), 4, 4, 900).unwrap(),
        );
        let evicted = cleanup_old(&mut pending, 1000, 500);
        assert_eq!(evicted, vec![[1u8; 16]]);
        assert!(pending.contains_key(&[2u8; 16]));
    }
}
