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

use std::io;

use thiserror::Error;

/// A `VaultError` indicates an error condition raised by the vault engine.
///
/// `AuthFail` deliberately conflates "wrong passphrase" with "tampered
/// header or payload": both indicate that authenticated decryption did not
/// succeed, and distinguishing them in the error surface would leak a
/// tamper signal to whoever holds the container file.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Any AEAD open failure: wrong passphrase, tampered ciphertext, or wrong key.
    #[error("authentication failed (wrong passphrase or tampered data)")]
    AuthFail,
    /// A structural invariant of the container was violated.
    #[error("container is corrupt: {0}")]
    Corrupt(String),
    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// An unknown `file_id` or `import_id` was referenced.
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed caller input.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    /// The same chunk index was written twice during a streaming import.
    #[error("chunk {0} was already received")]
    DuplicateChunk(u32),
    /// `streaming_finish` was called before every chunk arrived.
    #[error("streaming import is missing chunks")]
    IncompleteImport,
    /// An operation was attempted while the vault is not open.
    #[error("vault is locked")]
    Locked,
    /// An external environment check refused the operation.
    #[error("security gate refused the operation: {0}")]
    SecurityGate(String),

    /// Password-based key derivation using Argon2id failed.
    #[error("key derivation failed: {0}")]
    Argon2(#[from] argon2::Error),
    /// A bincode (de)serialization error occured while encoding the `extra` bag.
    #[error("serialization error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),
}

pub type Result<T> = std::result::Result<T, VaultError>;
