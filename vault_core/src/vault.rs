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

//! The public facade: a `Vault` is one open container file, guarded by a
//! single [`std::sync::RwLock`] so that many readers (listing entries,
//! reading file contents) can run alongside each other while a mutation
//! (import, delete, rename, compaction, passphrase change) takes the
//! exclusive side. Reads of already-written bytes go through
//! [`std::os::unix::fs::FileExt::read_at`], which does not move a shared
//! file cursor, so they need no lock upgrade beyond the read guard.
//!
//! Every mutation follows the same shape: append new bytes (data, then a
//! fresh index blob), write the *inactive* header slot, `fsync`, and only
//! then update the in-memory state (`active_idx`, `active_slot`,
//! `data_end`, `index`). If the process dies at any point before that last
//! step, the previously active slot is untouched and the vault reopens
//! exactly as it was before the mutation was attempted.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::config::VaultConfig;
use crate::container;
use crate::error::{Result, VaultError};
use crate::header::{self, Slot, Superblock, DATA_REGION_START, KDF_ALG_ARGON2ID};
use crate::index::{Entry, EntrySummary, FileType, Index, Layout};
use crate::keys::{self, Kek, Mk, WrappedKey};
use crate::streaming::{self, PendingImport};

const INDEX_AAD: &[u8] = b"index";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

struct ContainerState {
    file: File,
    active_idx: u8,
    active_slot: Slot,
    mk: Mk,
    kek: Kek,
    index: Index,
    data_end: u64,
    pending: HashMap<[u8; 16], PendingImport>,
}

/// A handle to one open, unlocked container file.
pub struct Vault {
    path: PathBuf,
    config: VaultConfig,
    state: RwLock<ContainerState>,
}

impl Vault {
    /// Creates a brand new container at `path`, which must not already
    /// exist, sealed under `passphrase` with the parameters in `config`.
    pub fn create(path: &Path, passphrase: &[u8], config: VaultConfig) -> Result<Self> {
        let params = config.kdf_profile.params();
        let salt = crypto_random_16();
        let kek = keys::derive_kek(passphrase, &salt, params.mem_kib, params.iters, params.parallelism)?;
        let mk = keys::generate_mk();
        let wrapped_mk = keys::wrap_mk(&kek, &mk)?;

        let index = Index::new();
        let index_plain = index.encode()?;
        let index_blob = crate::crypto::seal_index_blob(&mk.0, INDEX_AAD, &index_plain)?;

        let index_off = DATA_REGION_START;
        let index_len = index_blob.len() as u32;

        let slot = Slot {
            seq: 1,
            kdf_alg: KDF_ALG_ARGON2ID,
            kdf_mem_kib: params.mem_kib,
            kdf_iters: params.iters,
            kdf_parallelism: params.parallelism,
            salt,
            wrap_nonce: wrapped_mk.nonce,
            wrap_ct: wrapped_mk.ct,
            wrap_tag: wrapped_mk.tag,
            index_off,
            index_len,
        };

        let mut sb = Superblock::new();
        sb.index_off = index_off;
        sb.index_len = index_len;

        let mut file = container::create_new(path)?;
        file.set_len(DATA_REGION_START)?;
        container::write_superblock(&mut file, &sb)?;
        container::write_slot(&mut file, 0, &slot)?;
        container::write_at(&mut file, index_off, &index_blob)?;
        container::sync(&mut file)?;

        let data_end = index_off + index_len as u64;
        let tail = container::compute_integrity_tail(&mut file, data_end - DATA_REGION_START)?;
        container::write_integrity_tail(&mut file, data_end, &tail)?;

        info!("created vault at {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            config,
            state: RwLock::new(ContainerState {
                file,
                active_idx: 0,
                active_slot: slot,
                mk,
                kek,
                index,
                data_end,
                pending: HashMap::new(),
            }),
        })
    }

    /// Opens an existing container, choosing whichever of the two header
    /// slots is both CRC-valid and authenticates under `passphrase`.
    pub fn open(path: &Path, passphrase: &[u8], config: VaultConfig) -> Result<Self> {
        let mut file = container::open_rw(path)?;
        let slot0 = container::read_slot(&mut file, 0)?;
        let slot1 = container::read_slot(&mut file, 1)?;

        let mut unwrapped: Option<(Kek, Mk)> = None;
        let (active_idx, active_slot) = header::choose_active(slot0, slot1, |slot| {
            match try_unwrap_slot(slot, passphrase) {
                Ok((kek, mk)) => {
                    unwrapped = Some((kek, mk));
                    true
                }
                Err(_) => false,
            }
        })?;

        let (kek, mk) = unwrapped.expect("choose_active only returns a slot that authenticated");

        let index_blob = container::read_range(&mut file, active_slot.index_off, active_slot.index_len as u64)?;
        let index_plain = crate::crypto::open_index_blob(&mk.0, INDEX_AAD, &index_blob)?;
        let index = Index::decode(&index_plain)?;

        let data_end = active_slot.index_off + active_slot.index_len as u64;
        verify_integrity_tail(&mut file, data_end, path);

        info!("opened vault at {} ({} entries)", path.display(), index.len());

        Ok(Self {
            path: path.to_path_buf(),
            config,
            state: RwLock::new(ContainerState {
                file,
                active_idx,
                active_slot: active_slot.clone(),
                mk,
                kek,
                index,
                data_end,
                pending: HashMap::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> VaultConfig {
        self.config
    }

    pub fn list(&self) -> Vec<EntrySummary> {
        self.state.read().expect("vault lock poisoned").index.list()
    }

    pub fn get_entry(&self, file_id: &[u8; 16]) -> Result<Entry> {
        self.state.read().expect("vault lock poisoned").index.get(file_id).map(Entry::clone)
    }

    pub fn find_by_name(&self, name: &str) -> Vec<[u8; 16]> {
        self.state.read().expect("vault lock poisoned").index.find_by_name(name)
    }

    /// Imports a whole file in one call, stored as a single sealed blob.
    /// Large files should instead use the `streaming_*` family so the
    /// plaintext never needs to be held in memory all at once.
    pub fn import_file(
        &self,
        name: &str,
        mime: Option<&str>,
        file_type: FileType,
        data: &[u8],
    ) -> Result<[u8; 16]> {
        let mut state = self.state.write().expect("vault lock poisoned");

        if state.index.len() >= self.config.max_entries_per_vault {
            return Err(VaultError::InvalidParam("vault has reached its entry limit".into()));
        }

        let file_id = crypto_random_16();
        let dek = keys::generate_dek();
        let blob = streaming::seal_inline(&dek, &file_id, data)?;

        let blob_offset = state.data_end;
        container::write_at(&mut state.file, blob_offset, &blob)?;

        let wrapped_dek = keys::wrap_dek(&state.mk, &dek, &file_id)?;
        let entry = Entry {
            file_id,
            name: name.to_string(),
            mime: mime.map(str::to_string),
            file_type,
            created_ms: now_ms(),
            size: data.len() as u64,
            layout: Layout::Inline {
                blob_offset,
                blob_len: blob.len() as u64,
            },
            wrapped_dek,
            extra: HashMap::new(),
        };

        state.data_end = blob_offset + blob.len() as u64;
        state.index.insert(entry)?;
        commit(&mut state)?;

        debug!("imported {name} as {}", hex_id(&file_id));
        Ok(file_id)
    }

    /// Reads back a whole file imported with [`Vault::import_file`] or
    /// completed via the `streaming_*` family.
    pub fn read_file(&self, file_id: &[u8; 16]) -> Result<Vec<u8>> {
        let state = self.state.read().expect("vault lock poisoned");
        let entry = state.index.get(file_id)?;
        let dek = keys::unwrap_dek(&state.mk, &entry.wrapped_dek, file_id)?;

        match &entry.layout {
            Layout::Inline { blob_offset, blob_len } => {
                let blob = pread(&state.file, *blob_offset, *blob_len)?;
                streaming::read_inline(&dek, file_id, &blob)
            }
            Layout::Chunked { chunks, .. } => {
                let mut out = Vec::with_capacity(entry.size as usize);
                for (i, loc) in chunks.iter().enumerate() {
                    let blob = pread(&state.file, loc.offset, loc.len as u64)?;
                    out.extend(streaming::read_chunk(&dek, file_id, i as u32, &blob)?);
                }
                Ok(out)
            }
        }
    }

    /// Reads a single chunk of a chunked file without reconstructing the
    /// whole plaintext, for callers that stream playback or display.
    pub fn read_chunk(&self, file_id: &[u8; 16], chunk_index: u32) -> Result<Vec<u8>> {
        let state = self.state.read().expect("vault lock poisoned");
        let entry = state.index.get(file_id)?;
        let dek = keys::unwrap_dek(&state.mk, &entry.wrapped_dek, file_id)?;

        match &entry.layout {
            Layout::Inline { .. } => Err(VaultError::InvalidParam("file is not chunked".into())),
            Layout::Chunked { chunks, .. } => {
                let loc = chunks
                    .get(chunk_index as usize)
                    .ok_or_else(|| VaultError::InvalidParam(format!("chunk {chunk_index} out of range")))?;
                let blob = pread(&state.file, loc.offset, loc.len as u64)?;
                streaming::read_chunk(&dek, file_id, chunk_index, &blob)
            }
        }
    }

    /// Begins a chunked streaming import. Chunks may then be written in any
    /// order with [`Vault::streaming_write_chunk`].
    #[allow(clippy::too_many_arguments)]
    pub fn streaming_start(
        &self,
        name: &str,
        mime: Option<&str>,
        file_type: FileType,
        total_size: u64,
    ) -> Result<[u8; 16]> {
        let mut state = self.state.write().expect("vault lock poisoned");

        if state.index.len() >= self.config.max_entries_per_vault {
            return Err(VaultError::InvalidParam("vault has reached its entry limit".into()));
        }

        let file_id = crypto_random_16();
        let dek = keys::generate_dek();
        let chunk_size = self.config.stream_chunk_size.bytes();
        let pending = streaming::start(
            file_id,
            name.to_string(),
            mime.map(str::to_string),
            file_type,
            dek,
            chunk_size,
            total_size,
            now_ms(),
        )?;
        state.pending.insert(file_id, pending);
        Ok(file_id)
    }

    pub fn streaming_write_chunk(&self, file_id: &[u8; 16], chunk_index: u32, plaintext: &[u8]) -> Result<()> {
        let mut state = self.state.write().expect("vault lock poisoned");
        let mut pending = state
            .pending
            .remove(file_id)
            .ok_or_else(|| VaultError::NotFound(format!("pending import {}", hex_id(file_id))))?;

        let result = {
            let data_end = &mut state.data_end;
            streaming::write_chunk(&mut pending, &mut state.file, data_end, chunk_index, plaintext)
        };
        state.pending.insert(*file_id, pending);
        result
    }

    /// Completes a streaming import, committing the finished entry into the
    /// index. Fails with [`VaultError::IncompleteImport`] if any chunk is
    /// still missing.
    pub fn streaming_finish(&self, file_id: &[u8; 16]) -> Result<()> {
        let mut state = self.state.write().expect("vault lock poisoned");
        let pending = state
            .pending
            .remove(file_id)
            .ok_or_else(|| VaultError::NotFound(format!("pending import {}", hex_id(file_id))))?;

        let name = pending.name.clone();
        let mime = pending.mime.clone();
        let file_type = pending.file_type;
        let total_size = pending.total_size;
        let dek = pending.dek.clone();

        let layout = match streaming::finish(pending) {
            Ok(layout) => layout,
            Err(e) => return Err(e),
        };

        let wrapped_dek = keys::wrap_dek(&state.mk, &dek, file_id)?;
        let entry = Entry {
            file_id: *file_id,
            name,
            mime,
            file_type,
            created_ms: now_ms(),
            size: total_size,
            layout,
            wrapped_dek,
            extra: HashMap::new(),
        };

        state.index.insert(entry)?;
        commit(&mut state)?;
        Ok(())
    }

    /// Abandons a streaming import; its appended bytes become unreferenced
    /// garbage reclaimed by the next [`Vault::compact`].
    pub fn streaming_abort(&self, file_id: &[u8; 16]) -> Result<()> {
        let mut state = self.state.write().expect("vault lock poisoned");
        state
            .pending
            .remove(file_id)
            .ok_or_else(|| VaultError::NotFound(format!("pending import {}", hex_id(file_id))))?;
        Ok(())
    }

    /// Garbage-collects streaming imports nobody has touched in longer
    /// than [`VaultConfig::max_pending_import_age_ms`].
    pub fn streaming_cleanup_old(&self) -> Vec<[u8; 16]> {
        let mut state = self.state.write().expect("vault lock poisoned");
        let max_age = self.config.max_pending_import_age_ms;
        let dropped = streaming::cleanup_old(&mut state.pending, now_ms(), max_age);
        if !dropped.is_empty() {
            warn!("dropped {} stale streaming import(s)", dropped.len());
        }
        dropped
    }

    pub fn rename(&self, file_id: &[u8; 16], new_name: &str) -> Result<()> {
        let mut state = self.state.write().expect("vault lock poisoned");
        state.index.get_mut(file_id)?.name = new_name.to_string();
        commit(&mut state)
    }

    pub fn delete(&self, file_id: &[u8; 16]) -> Result<()> {
        let mut state = self.state.write().expect("vault lock poisoned");
        state.index.remove(file_id)?;
        commit(&mut state)
    }

    /// Copies an entry under a freshly generated `file_id` by decrypting its
    /// plaintext and re-importing it under a fresh DEK. Every sealed blob's
    /// AAD is bound to the `file_id` it was sealed under, so simply cloning
    /// the source's layout and ciphertext offsets under a new id would make
    /// every later read fail its AEAD tag check; a real re-import is the
    /// only way to produce a duplicate that can actually be read back.
    pub fn duplicate(&self, file_id: &[u8; 16], new_name: &str) -> Result<[u8; 16]> {
        let source = self.get_entry(file_id)?;
        let data = self.read_file(file_id)?;

        let new_id = match &source.layout {
            Layout::Inline { .. } => {
                self.import_file(new_name, source.mime.as_deref(), source.file_type, &data)?
            }
            Layout::Chunked { chunk_size, .. } => {
                let new_id =
                    self.streaming_start(new_name, source.mime.as_deref(), source.file_type, data.len() as u64)?;
                for (i, chunk) in data.chunks(*chunk_size as usize).enumerate() {
                    self.streaming_write_chunk(&new_id, i as u32, chunk)?;
                }
                self.streaming_finish(&new_id)?;
                new_id
            }
        };

        debug!("duplicated {} as {new_name} ({})", hex_id(file_id), hex_id(&new_id));
        Ok(new_id)
    }

    /// Re-derives the KEK from `new_passphrase` and re-wraps the MK under
    /// it. File contents and the per-file DEKs are untouched. The KDF runs
    /// against a cloned MK taken under a brief read lock, not the write
    /// lock, so concurrent readers don't stall for the full Argon2id pass.
    pub fn change_passphrase(&self, new_passphrase: &[u8]) -> Result<()> {
        let mk = self.state.read().expect("vault lock poisoned").mk.clone();

        let params = self.config.kdf_profile.params();
        let salt = crypto_random_16();
        let new_kek = keys::derive_kek(new_passphrase, &salt, params.mem_kib, params.iters, params.parallelism)?;
        let wrapped_mk = keys::wrap_mk(&new_kek, &mk)?;

        let mut state = self.state.write().expect("vault lock poisoned");
        let mut next = state.active_slot.clone();
        next.seq += 1;
        next.kdf_mem_kib = params.mem_kib;
        next.kdf_iters = params.iters;
        next.kdf_parallelism = params.parallelism;
        next.salt = salt;
        next.wrap_nonce = wrapped_mk.nonce;
        next.wrap_ct = wrapped_mk.ct;
        next.wrap_tag = wrapped_mk.tag;

        flip_to(&mut state, next)?;
        state.kek = new_kek;
        info!("passphrase changed for vault at {}", self.path.display());
        Ok(())
    }

    /// Rebuilds the container file, discarding unreferenced bytes left by
    /// deletions and abandoned streaming imports. Reuses every live blob's
    /// ciphertext verbatim; only offsets change, so no key material beyond
    /// the already-open MK is needed.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.state.write().expect("vault lock poisoned");

        let mut new_index = state.index.clone();
        let entries: Vec<Entry> = state.index.iter().cloned().collect();

        container::rebuild_atomically(&self.path, |new_file| {
            new_file.set_len(DATA_REGION_START)?;
            let mut cursor = DATA_REGION_START;

            for old_entry in &entries {
                let mut new_entry = new_index.get_mut(&old_entry.file_id)?.clone();
                new_entry.layout = match &old_entry.layout {
                    Layout::Inline { blob_offset, blob_len } => {
                        let bytes = pread(&state.file, *blob_offset, *blob_len)?;
                        container::write_at(new_file, cursor, &bytes)?;
                        let new_layout = Layout::Inline {
                            blob_offset: cursor,
                            blob_len: *blob_len,
                        };
                        cursor += *blob_len;
                        new_layout
                    }
                    Layout::Chunked { chunk_size, chunks } => {
                        let mut new_chunks = Vec::with_capacity(chunks.len());
                        for loc in chunks {
                            let bytes = pread(&state.file, loc.offset, loc.len as u64)?;
                            container::write_at(new_file, cursor, &bytes)?;
                            new_chunks.push(crate::index::ChunkLoc {
                                offset: cursor,
                                len: loc.len,
                            });
                            cursor += loc.len as u64;
                        }
                        Layout::Chunked {
                            chunk_size: *chunk_size,
                            chunks: new_chunks,
                        }
                    }
                };
                *new_index.get_mut(&old_entry.file_id)? = new_entry;
            }

            let index_plain = new_index.encode()?;
            let index_blob = crate::crypto::seal_index_blob(&state.mk.0, INDEX_AAD, &index_plain)?;
            container::write_at(new_file, cursor, &index_blob)?;
            let index_off = cursor;
            let index_len = index_blob.len() as u32;
            cursor += index_len as u64;

            let mut slot = state.active_slot.clone();
            slot.seq += 1;
            slot.index_off = index_off;
            slot.index_len = index_len;

            let mut sb = Superblock::new();
            sb.index_off = index_off;
            sb.index_len = index_len;

            container::write_superblock(new_file, &sb)?;
            container::write_slot(new_file, 0, &slot)?;

            let tail = container::compute_integrity_tail(new_file, cursor - DATA_REGION_START)?;
            container::write_integrity_tail(new_file, cursor, &tail)?;

            Ok(cursor)
        })?;

        state.file = container::open_rw(&self.path)?;
        let fresh_slot = container::read_slot(&mut state.file, 0)?
            .ok_or_else(|| VaultError::Corrupt("freshly compacted slot is unreadable".into()))?;
        state.active_idx = 0;
        state.data_end = fresh_slot.index_off + fresh_slot.index_len as u64;
        state.active_slot = fresh_slot;
        state.index = new_index;

        info!("compacted vault at {}", self.path.display());
        Ok(())
    }
}

/// Tries to authenticate a header slot against a passphrase, deriving the
/// KEK with that slot's own recorded KDF parameters and attempting to
/// unwrap the MK. Used both by `open` (via [`header::choose_active`]) and
/// nowhere else -- all later operations reuse the already-unwrapped MK/KEK.
fn try_unwrap_slot(slot: &Slot, passphrase: &[u8]) -> Result<(Kek, Mk)> {
    let kek = keys::derive_kek(passphrase, &slot.salt, slot.kdf_mem_kib, slot.kdf_iters, slot.kdf_parallelism)?;
    let wrapped = WrappedKey {
        nonce: slot.wrap_nonce,
        ct: slot.wrap_ct,
        tag: slot.wrap_tag,
    };
    let mk = keys::unwrap_mk(&kek, &wrapped)?;
    Ok((kek, mk))
}

/// Recomputes the advisory integrity tail over the whole data region and
/// logs a warning on mismatch. Never consulted when deciding whether a
/// container opens -- a missing or stale tail is not an error by itself.
fn verify_integrity_tail(file: &mut std::fs::File, data_end: u64, path: &Path) {
    match container::read_integrity_tail(file, data_end) {
        Ok(stored) => match container::compute_integrity_tail(file, data_end - DATA_REGION_START) {
            Ok(computed) if computed == stored => {}
            Ok(_) => warn!("integrity tail mismatch for vault at {}", path.display()),
            Err(e) => warn!("could not recompute integrity tail for vault at {}: {e}", path.display()),
        },
        Err(_) => debug!("no integrity tail present at {}", path.display()),
    }
}

/// Seals the current in-memory index, appends it, writes the inactive
/// slot, and only then flips the in-memory active state. This is the one
/// place every index-mutating operation funnels through. A fresh advisory
/// integrity tail is written over the whole data region afterward.
fn commit(state: &mut ContainerState) -> Result<()> {
    let index_plain = state.index.encode()?;
    let index_blob = crate::crypto::seal_index_blob(&state.mk.0, INDEX_AAD, &index_plain)?;

    let index_off = state.data_end;
    container::write_at(&mut state.file, index_off, &index_blob)?;
    container::sync(&mut state.file)?;

    let mut next = state.active_slot.clone();
    next.seq += 1;
    next.index_off = index_off;
    next.index_len = index_blob.len() as u32;

    flip_to(state, next)?;
    state.data_end = index_off + index_blob.len() as u64;

    let tail = container::compute_integrity_tail(&mut state.file, state.data_end - DATA_REGION_START)?;
    container::write_integrity_tail(&mut state.file, state.data_end, &tail)?;
    Ok(())
}

/// Writes `next` to the slot that is currently inactive, syncs it, then
/// updates the superblock's advisory mirror and the in-memory active
/// state. The superblock write is best-effort and is never consulted when
/// choosing which slot is active.
fn flip_to(state: &mut ContainerState, next: Slot) -> Result<()> {
    let target_idx = header::inactive_of(state.active_idx);
    container::write_slot(&mut state.file, target_idx, &next)?;

    let mut sb = Superblock::new();
    sb.index_off = next.index_off;
    sb.index_len = next.index_len;
    let _ = container::write_superblock(&mut state.file, &sb);

    state.active_idx = target_idx;
    state.active_slot = next;
    Ok(())
}

/// Reads `len` bytes at `offset` via `pread(2)`, which does not move the
/// file's shared cursor -- this is what lets readers proceed without
/// taking the write side of the vault's lock.
fn pread(file: &File, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len as usize];
    file.read_exact_at(&mut buf, offset)?;
    Ok(buf)
}

fn crypto_random_16() -> [u8; 16] {
    crate::crypto::random_array::<16>()
}

fn hex_id(id: &[u8; 16]) -> String {
    id.iter().map(|b| format!("{b:02x}")).collect()
}
