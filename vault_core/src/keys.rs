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

//! Passphrase -> KEK -> MK -> per-file DEK. Every key type zeroizes its
//! buffer on drop so that closing a vault leaves no recoverable key
//! material in process memory.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto;
use crate::error::Result;

/// The 32-byte master key. Generated once per container, persisted only
/// wrapped, alive in memory only while the vault is open.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Mk(pub [u8; crypto::KEY_LEN]);

/// The 32-byte key-encryption-key derived from the passphrase. Cached for
/// the session so `compact` and `change_passphrase` don't need the
/// passphrase again to re-wrap the MK.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Kek(pub [u8; crypto::KEY_LEN]);

/// A per-file 32-byte data encryption key.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Dek(pub [u8; crypto::KEY_LEN]);

/// A wrapped key as stored on disk: a fresh nonce, the 32-byte ciphertext,
/// and its 16-byte authentication tag.
#[derive(Clone, Copy, Debug)]
pub struct WrappedKey {
    pub nonce: [u8; crypto::NONCE_LEN],
    pub ct: [u8; crypto::KEY_LEN],
    pub tag: [u8; crypto::TAG_LEN],
}

impl WrappedKey {
    fn seal(key: &[u8; crypto::KEY_LEN], aad: &[u8], plaintext: &[u8; crypto::KEY_LEN]) -> Result<Self> {
        let nonce = crypto::random_array::<{ crypto::NONCE_LEN }>();
        let sealed = crypto::aead_seal(key, &nonce, aad, plaintext)?;
        let (ct, tag) = sealed.split_at(crypto::KEY_LEN);
        Ok(Self {
            nonce,
            ct: ct.try_into().expect("ciphertext is exactly KEY_LEN bytes"),
            tag: tag.try_into().expect("tag is exactly TAG_LEN bytes"),
        })
    }

    fn open(&self, key: &[u8; crypto::KEY_LEN], aad: &[u8]) -> Result<[u8; crypto::KEY_LEN]> {
        let mut combined = Vec::with_capacity(crypto::KEY_LEN + crypto::TAG_LEN);
        combined.extend_from_slice(&self.ct);
        combined.extend_from_slice(&self.tag);
        let plaintext = crypto::aead_open(key, &self.nonce, aad, &combined)?;
        plaintext.try_into().map_err(|_| crate::error::VaultError::Corrupt("unwrapped key has wrong length".into()))
    }
}

/// Derives the KEK from a passphrase using the KDF parameters recorded in
/// a header slot (chosen once, at create time, by device RAM).
pub fn derive_kek(passphrase: &[u8], salt: &[u8; 16], mem_kib: u32, iters: u32, parallelism: u8) -> Result<Kek> {
    Ok(Kek(crypto::kdf(passphrase, salt, mem_kib, iters, parallelism)?))
}

/// Wraps the MK under the KEK. No AAD: the slot's CRC and AEAD tag are
/// already sufficient to detect tamper of the wrapped key material itself.
pub fn wrap_mk(kek: &Kek, mk: &Mk) -> Result<WrappedKey> {
    WrappedKey::seal(&kek.0, b"", &mk.0)
}

pub fn unwrap_mk(kek: &Kek, wrapped: &WrappedKey) -> Result<Mk> {
    Ok(Mk(wrapped.open(&kek.0, b"")?))
}

/// Wraps a DEK under the MK, bound to the entry's `file_id` as AAD so a
/// wrapped DEK cannot be silently reattached to a different entry.
pub fn wrap_dek(mk: &Mk, dek: &Dek, file_id: &[u8; 16]) -> Result<WrappedKey> {
    WrappedKey::seal(&mk.0, file_id, &dek.0)
}

pub fn unwrap_dek(mk: &Mk, wrapped: &WrappedKey, file_id: &[u8; 16]) -> Result<Dek> {
    Ok(Dek(wrapped.open(&mk.0, file_id)?))
}

pub fn generate_mk() -> Mk {
    let mut bytes = [0u8; crypto::KEY_LEN];
    bytes.copy_from_slice(&crypto::random(crypto::KEY_LEN));
    Mk(bytes)
}

pub fn generate_dek() -> Dek {
    let mut bytes = [0u8; crypto::KEY_LEN];
    bytes.copy_from_slice(&crypto::random(crypto::KEY_LEN));
    Dek(bytes)
}

impl Drop for WrappedKey {
    fn drop(&mut self) {
        self.nonce.zeroize();
        self.ct.zeroize();
        self.tag.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mk_wrap_unwrap_roundtrips() {
        let kek = Kek([9u8; crypto::KEY_LEN]);
        let mk = generate_mk();
        let wrapped = wrap_mk(&kek, &mk).unwrap();
        let back = unwrap_mk(&kek, &wrapped).unwrap();
        assert_eq!(back.0, mk.0);
    }

    #[test]
    fn dek_unwrap_fails_for_wrong_file_id() {
        let mk = generate_mk();
        let dek = generate_dek();
        let file_id = [1u8; 16];
        let other_id = [2u8; 16];
        let wrapped = wrap_dek(&mk, &dek, &file_id).unwrap();
        assert!(unwrap_dek(&mk, &wrapped, &other_id).is_err());
    }

    #[test]
    fn mk_unwrap_fails_for_wrong_kek() {
        let kek = Kek([1u8; crypto::KEY_LEN]);
        let other_kek = Kek([2u8; crypto::KEY_LEN]);
        let mk = generate_mk();
        let wrapped = wrap_mk(&kek, &mk).unwrap();
        assert!(unwrap_mk(&other_kek, &wrapped).is_err());
    }
}
