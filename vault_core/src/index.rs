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

//! The authenticated catalog of file entries. Loaded fully into memory on
//! unlock, rewritten atomically (new shadow blob + header flip) on every
//! mutation. Unknown bytes inside an entry's `extra` bag round-trip
//! untouched, which is what keeps the format forward compatible.

use std::collections::HashMap;

use crate::error::{Result, VaultError};
use crate::header::Reader;
use crate::keys::WrappedKey;

pub const MAX_NAME_LEN: usize = 1024;
pub const MAX_MIME_LEN: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
    Image = 0,
    Video = 1,
    Audio = 2,
    Document = 3,
    Text = 4,
    Binary = 5,
}

impl FileType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => FileType::Image,
            1 => FileType::Video,
            2 => FileType::Audio,
            3 => FileType::Document,
            4 => FileType::Text,
            5 => FileType::Binary,
            other => return Err(VaultError::Corrupt(format!("unknown file type tag {other}"))),
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ChunkLoc {
    pub offset: u64,
    pub len: u32,
}

#[derive(Clone, Debug)]
pub enum Layout {
    Inline { blob_offset: u64, blob_len: u64 },
    Chunked { chunk_size: u32, chunks: Vec<ChunkLoc> },
}

impl Layout {
    pub fn tag(&self) -> u8 {
        match self {
            Layout::Inline { .. } => 0,
            Layout::Chunked { .. } => 1,
        }
    }

    pub fn chunk_count(&self) -> usize {
        match self {
            Layout::Inline { .. } => 0,
            Layout::Chunked { chunks, .. } => chunks.len(),
        }
    }
}

/// A catalog entry for one logical file.
#[derive(Clone, Debug)]
pub struct Entry {
    pub file_id: [u8; 16],
    pub name: String,
    pub mime: Option<String>,
    pub file_type: FileType,
    pub created_ms: u64,
    pub size: u64,
    pub layout: Layout,
    pub wrapped_dek: WrappedKey,
    pub extra: HashMap<String, Vec<u8>>,
}

/// The subset of an [`Entry`] safe to hand to callers enumerating the
/// vault -- no wrapped key material.
#[derive(Clone, Debug)]
pub struct EntrySummary {
    pub file_id: [u8; 16],
    pub name: String,
    pub mime: Option<String>,
    pub file_type: FileType,
    pub created_ms: u64,
    pub size: u64,
}

impl From<&Entry> for EntrySummary {
    fn from(e: &Entry) -> Self {
        Self {
            file_id: e.file_id,
            name: e.name.clone(),
            mime: e.mime.clone(),
            file_type: e.file_type,
            created_ms: e.created_ms,
            size: e.size,
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.as_bytes().len() > MAX_NAME_LEN {
        return Err(VaultError::InvalidParam(format!(
            "name must be 1..={MAX_NAME_LEN} bytes, got {}",
            name.as_bytes().len()
        )));
    }
    Ok(())
}

fn validate_mime(mime: &Option<String>) -> Result<()> {
    if let Some(m) = mime {
        if m.as_bytes().len() > MAX_MIME_LEN {
            return Err(VaultError::InvalidParam(format!(
                "mime must be <= {MAX_MIME_LEN} bytes, got {}",
                m.as_bytes().len()
            )));
        }
    }
    Ok(())
}

/// The in-memory, decrypted catalog.
#[derive(Clone, Debug, Default)]
pub struct Index {
    entries: Vec<Entry>,
}

impl Index {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn list(&self) -> Vec<EntrySummary> {
        self.entries.iter().map(EntrySummary::from).collect()
    }

    pub fn get(&self, file_id: &[u8; 16]) -> Result<&Entry> {
        self.entries
            .iter()
            .find(|e| &e.file_id == file_id)
            .ok_or_else(|| VaultError::NotFound(format!("file {}", hex_id(file_id))))
    }

    pub fn get_mut(&mut self, file_id: &[u8; 16]) -> Result<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|e| &e.file_id == file_id)
            .ok_or_else(|| VaultError::NotFound(format!("file {}", hex_id(file_id))))
    }

    pub fn find_by_name(&self, name: &str) -> Vec<[u8; 16]> {
        self.entries.iter().filter(|e| e.name == name).map(|e| e.file_id).collect()
    }

    pub fn insert(&mut self, entry: Entry) -> Result<()> {
        validate_name(&entry.name)?;
        validate_mime(&entry.mime)?;
        if self.entries.iter().any(|e| e.file_id == entry.file_id) {
            return Err(VaultError::InvalidParam("file_id already exists".into()));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn remove(&mut self, file_id: &[u8; 16]) -> Result<Entry> {
        let pos = self
            .entries
            .iter()
            .position(|e| &e.file_id == file_id)
            .ok_or_else(|| VaultError::NotFound(format!("file {}", hex_id(file_id))))?;
        Ok(self.entries.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Plaintext layout: `entry_count:u32` followed by that many records.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            encode_entry(entry, &mut buf)?;
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(VaultError::Corrupt("index plaintext truncated".into()));
        }
        let mut r = Reader::new(buf);
        let count = r.u32();
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(decode_entry(&mut r)?);
        }
        Ok(Self { entries })
    }
}

fn hex_id(id: &[u8; 16]) -> String {
    id.iter().map(|b| format!("{b:02x}")).collect()
}

fn encode_entry(entry: &Entry, buf: &mut Vec<u8>) -> Result<()> {
    buf.extend_from_slice(&entry.file_id);

    let name_bytes = entry.name.as_bytes();
    buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(name_bytes);

    let mime_bytes = entry.mime.as_deref().unwrap_or("").as_bytes();
    buf.extend_from_slice(&(mime_bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(mime_bytes);

    buf.push(entry.file_type.as_u8());
    buf.extend_from_slice(&entry.created_ms.to_le_bytes());
    buf.extend_from_slice(&entry.size.to_le_bytes());

    buf.push(entry.layout.tag());
    match &entry.layout {
        Layout::Inline { blob_offset, blob_len } => {
            buf.extend_from_slice(&blob_offset.to_le_bytes());
            buf.extend_from_slice(&blob_len.to_le_bytes());
        }
        Layout::Chunked { chunk_size, chunks } => {
            buf.extend_from_slice(&chunk_size.to_le_bytes());
            buf.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
            for chunk in chunks {
                buf.extend_from_slice(&chunk.offset.to_le_bytes());
                buf.extend_from_slice(&chunk.len.to_le_bytes());
            }
        }
    }

    buf.extend_from_slice(&entry.wrapped_dek.nonce);
    buf.extend_from_slice(&entry.wrapped_dek.ct);
    buf.extend_from_slice(&entry.wrapped_dek.tag);

    let extra_bytes = bincode::serialize(&entry.extra)?;
    buf.extend_from_slice(&(extra_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(&extra_bytes);

    Ok(())
}

fn decode_entry(r: &mut Reader) -> Result<Entry> {
    let file_id: [u8; 16] = r
        .take(16)
        .try_into()
        .map_err(|_| VaultError::Corrupt("truncated entry".into()))?;

    let name_len = r.u16() as usize;
    let name = String::from_utf8(r.take(name_len).to_vec())
        .map_err(|_| VaultError::Corrupt("entry name is not valid UTF-8".into()))?;

    let mime_len = r.u16() as usize;
    let mime_raw = String::from_utf8(r.take(mime_len).to_vec())
        .map_err(|_| VaultError::Corrupt("entry mime is not valid UTF-8".into()))?;
    let mime = if mime_raw.is_empty() { None } else { Some(mime_raw) };

    let file_type = FileType::from_u8(r.u8())?;
    let created_ms = r.u64();
    let size = r.u64();

    let layout_tag = r.u8();
    let layout = match layout_tag {
        0 => Layout::Inline {
            blob_offset: r.u64(),
            blob_len: r.u64(),
        },
        1 => {
            let chunk_size = r.u32();
            let chunk_count = r.u32();
            let mut chunks = Vec::with_capacity(chunk_count as usize);
            for _ in 0..chunk_count {
                chunks.push(ChunkLoc {
                    offset: r.u64(),
                    len: r.u32(),
                });
            }
            Layout::Chunked { chunk_size, chunks }
        }
        other => return Err(VaultError::Corrupt(format!("unknown layout tag {other}"))),
    };

    let wrapped_dek = WrappedKey {
        nonce: r
            .take(24)
            .try_into()
            .map_err(|_| VaultError::Corrupt("truncated dek wrap".into()))?,
        ct: r
            .take(32)
            .try_into()
            .map_err(|_| VaultError::Corrupt("truncated dek wrap".into()))?,
        tag: r
            .take(16)
            .try_into()
            .map_err(|_| VaultError::Corrupt("truncated dek wrap".into()))?,
    };

    let extra_len = r.u32() as usize;
    let extra_bytes = r.take(extra_len);
    let extra: HashMap<String, Vec<u8>> = bincode::deserialize(extra_bytes)?;

    Ok(Entry {
        file_id,
        name,
        mime,
        file_type,
        created_ms,
        size,
        layout,
        wrapped_dek,
        extra,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(file_id: [u8; 16], name: &str) -> Entry {
        Entry {
            file_id,
            name: name.to_string(),
            mime: Some("text/plain".to_string()),
            file_type: FileType::Text,
            created_ms: 1_700_000_000_000,
            size: 3,
            layout: Layout::Inline {
                blob_offset: 294,
                blob_len: 19,
            },
            wrapped_dek: WrappedKey {
                nonce: [1u8; 24],
                ct: [2u8; 32],
                tag: [3u8; 16],
            },
            extra: HashMap::new(),
        }
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let mut idx = Index::new();
        idx.insert(sample_entry([1u8; 16], "hello.txt")).unwrap();
        let entry = idx.get(&[1u8; 16]).unwrap();
        assert_eq!(entry.name, "hello.txt");
    }

    #[test]
    fn duplicate_file_id_is_rejected() {
        let mut idx = Index::new();
        idx.insert(sample_entry([1u8; 16], "a")).unwrap();
        assert!(idx.insert(sample_entry([1u8; 16], "b")).is_err());
    }

    #[test]
    fn encode_decode_roundtrips_with_chunked_layout_and_extra() {
        let mut idx = Index::new();
        let mut entry = sample_entry([9u8; 16], "movie.mp4");
        entry.mime = None;
        entry.layout = Layout::Chunked {
            chunk_size: 4 * 1024 * 1024,
            chunks: vec![
                ChunkLoc { offset: 294, len: 100 },
                ChunkLoc { offset: 394, len: 200 },
            ],
        };
        entry.extra.insert("thumb".to_string(), vec![1, 2, 3]);
        idx.insert(entry).unwrap();

        let encoded = idx.encode().unwrap();
        let decoded = Index::decode(&encoded).unwrap();

        assert_eq!(decoded.len(), 1);
        let got = decoded.get(&[9u8; 16]).unwrap();
        assert_eq!(got.name, "movie.mp4");
        assert!(got.mime.is_none());
        assert_eq!(got.extra.get("thumb"), Some(&vec![1, 2, 3]));
        match &got.layout {
            Layout::Chunked { chunk_size, chunks } => {
                assert_eq!(*chunk_size, 4 * 1024 * 1024);
                assert_eq!(chunks.len(), 2);
            }
            _ => panic!("expected chunked layout"),
        }
    }

    #[test]
    fn find_by_name_returns_all_matches() {
        let mut idx = Index::new();
        idx.insert(sample_entry([1u8; 16], "dup")).unwrap();
        idx.insert(sample_entry([2u8; 16], "dup")).unwrap();
        idx.insert(sample_entry([3u8; 16], "other")).unwrap();
        let mut ids = idx.find_by_name("dup");
        ids.sort();
        assert_eq!(ids, vec![[1u8; 16], [2u8; 16]]);
    }

    #[test]
    fn oversize_name_is_rejected() {
        let mut idx = Index::new();
        let big_name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(idx.insert(sample_entry([1u8; 16], &big_name)).is_err());
    }
}
