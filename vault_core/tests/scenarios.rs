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

//! End-to-end scenarios exercising a whole `Vault` lifecycle through the
//! public API, as opposed to the inline `#[cfg(test)]` modules next to each
//! component, which exercise one module in isolation.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

use tempfile::tempdir;

use vault_core::config::{ChunkSize, KdfProfile, VaultConfig};
use vault_core::header;
use vault_core::index::FileType;
use vault_core::{Vault, VaultError};

fn fast_config() -> VaultConfig {
    VaultConfig {
        kdf_profile: KdfProfile::Low,
        stream_chunk_size: ChunkSize::Default4MiB,
        ..VaultConfig::default()
    }
}

#[test]
fn create_import_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v.vault");

    {
        let vault = Vault::create(&path, b"correct horse battery staple", fast_config()).unwrap();
        vault.import_file("hello.txt", None, FileType::Text, &[0x68, 0x65, 0x6c]).unwrap();
    }

    let vault = Vault::open(&path, b"correct horse battery staple", fast_config()).unwrap();
    let entries = vault.list();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "hello.txt");
    assert_eq!(vault.read_file(&entries[0].file_id).unwrap(), vec![0x68, 0x65, 0x6c]);
}

#[test]
fn wrong_passphrase_leaves_container_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v.vault");
    Vault::create(&path, b"correct horse battery staple", fast_config()).unwrap();

    let before = fs::read(&path).unwrap();
    assert!(matches!(Vault::open(&path, b"wrong", fast_config()), Err(VaultError::AuthFail)));
    let after = fs::read(&path).unwrap();
    assert_eq!(before, after);
}

#[test]
fn streaming_10mib_import_out_of_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v.vault");
    let vault = Vault::create(&path, b"pw", fast_config()).unwrap();

    let total: u64 = 10_485_760;
    let chunk = 4 * 1024 * 1024usize;
    let data: Vec<u8> = (0..total).map(|i| (i % 256) as u8).collect();

    let id = vault.streaming_start("big.bin", None, FileType::Binary, total).unwrap();
    vault.streaming_write_chunk(&id, 2, &data[chunk * 2..]).unwrap();
    vault.streaming_write_chunk(&id, 0, &data[..chunk]).unwrap();
    vault.streaming_write_chunk(&id, 1, &data[chunk..chunk * 2]).unwrap();
    vault.streaming_finish(&id).unwrap();

    let mut reassembled = Vec::new();
    reassembled.extend(vault.read_chunk(&id, 0).unwrap());
    reassembled.extend(vault.read_chunk(&id, 1).unwrap());
    reassembled.extend(vault.read_chunk(&id, 2).unwrap());
    assert_eq!(reassembled, data);
    assert_eq!(vault.read_file(&id).unwrap(), data);
}

#[test]
fn duplicate_chunk_is_rejected_without_disturbing_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v.vault");
    let vault = Vault::create(&path, b"pw", fast_config()).unwrap();

    let total: u64 = 10_485_760;
    let chunk = 4 * 1024 * 1024usize;
    let data = vec![7u8; total as usize];

    let id = vault.streaming_start("big.bin", None, FileType::Binary, total).unwrap();
    vault.streaming_write_chunk(&id, 0, &data[..chunk]).unwrap();
    vault.streaming_write_chunk(&id, 1, &data[chunk..chunk * 2]).unwrap();

    assert!(matches!(
        vault.streaming_write_chunk(&id, 1, &data[chunk..chunk * 2]),
        Err(VaultError::DuplicateChunk(1))
    ));

    vault.streaming_write_chunk(&id, 2, &data[chunk * 2..]).unwrap();
    vault.streaming_finish(&id).unwrap();
    assert_eq!(vault.read_file(&id).unwrap(), data);
}

/// Simulates a crash that tears the header slot a mutation was about to
/// flip to, by corrupting it directly on disk instead of going through a
/// real `Vault` mutation. The previously active slot -- and therefore the
/// pre-mutation state -- must still be what a subsequent open observes.
#[test]
fn crash_mid_flip_leaves_previous_state_intact() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v.vault");

    let id = {
        let vault = Vault::create(&path, b"pw", fast_config()).unwrap();
        vault.import_file("a.txt", None, FileType::Text, b"first").unwrap()
    };

    // After create + one mutation, slot 1 is active and slot 0 -- the
    // target of the *next* mutation's flip -- is inactive. Torn garbage
    // there must fail its CRC and be ignored on open.
    {
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(header::SLOT0_OFF)).unwrap();
        f.write_all(&[0xffu8; 16]).unwrap();
        f.sync_all().unwrap();
    }

    let vault = Vault::open(&path, b"pw", fast_config()).unwrap();
    let entries = vault.list();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "a.txt");
    assert_eq!(vault.read_file(&id).unwrap(), b"first");
}

#[test]
fn change_passphrase_scenario() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v.vault");

    let id = {
        let vault = Vault::create(&path, b"correct horse battery staple", fast_config()).unwrap();
        vault.import_file("hello.txt", None, FileType::Text, &[0x68, 0x65, 0x6c]).unwrap()
    };

    {
        let vault = Vault::open(&path, b"correct horse battery staple", fast_config()).unwrap();
        vault.change_passphrase(b"Tr0ub4dor&3").unwrap();
    }

    assert!(matches!(
        Vault::open(&path, b"correct horse battery staple", fast_config()),
        Err(VaultError::AuthFail)
    ));

    let vault = Vault::open(&path, b"Tr0ub4dor&3", fast_config()).unwrap();
    assert_eq!(vault.read_file(&id).unwrap(), vec![0x68, 0x65, 0x6c]);
}

#[test]
fn duplicate_reimports_under_a_fresh_key_and_reads_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v.vault");
    let vault = Vault::create(&path, b"pw", fast_config()).unwrap();

    let inline_id = vault.import_file("hello.txt", None, FileType::Text, b"hello world").unwrap();
    let dup_id = vault.duplicate(&inline_id, "hello-copy.txt").unwrap();
    assert_ne!(dup_id, inline_id);
    assert_eq!(vault.read_file(&dup_id).unwrap(), b"hello world");
    assert_eq!(vault.read_file(&inline_id).unwrap(), b"hello world");

    let total: u64 = 10_485_760;
    let chunk = 4 * 1024 * 1024usize;
    let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let chunked_id = vault.streaming_start("big.bin", None, FileType::Binary, total).unwrap();
    vault.streaming_write_chunk(&chunked_id, 0, &data[..chunk]).unwrap();
    vault.streaming_write_chunk(&chunked_id, 1, &data[chunk..chunk * 2]).unwrap();
    vault.streaming_write_chunk(&chunked_id, 2, &data[chunk * 2..]).unwrap();
    vault.streaming_finish(&chunked_id).unwrap();

    let dup_chunked_id = vault.duplicate(&chunked_id, "big-copy.bin").unwrap();
    assert_ne!(dup_chunked_id, chunked_id);
    assert_eq!(vault.read_file(&dup_chunked_id).unwrap(), data);
    assert_eq!(vault.read_file(&chunked_id).unwrap(), data);

    let names: BTreeSet<_> = vault.list().into_iter().map(|e| e.name).collect();
    assert!(names.contains("hello-copy.txt"));
    assert!(names.contains("big-copy.bin"));
}

#[test]
fn compact_preserves_logical_content() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v.vault");
    let vault = Vault::create(&path, b"pw", fast_config()).unwrap();

    let keep = vault.import_file("keep.txt", None, FileType::Text, b"keep me").unwrap();
    let drop_id = vault.import_file("drop.txt", None, FileType::Text, b"drop me").unwrap();
    vault.delete(&drop_id).unwrap();

    let before: BTreeSet<_> = vault.list().into_iter().map(|e| e.file_id).collect();
    vault.compact().unwrap();
    let after: BTreeSet<_> = vault.list().into_iter().map(|e| e.file_id).collect();

    assert_eq!(before, after);
    assert_eq!(vault.read_file(&keep).unwrap(), b"keep me");
    assert!(vault.read_file(&drop_id).is_err());
}
