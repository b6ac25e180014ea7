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

//! Uniform adapter over the primitives the rest of the crate composes:
//! XChaCha20-Poly1305 AEAD, Argon2id KDF, a CSPRNG, SHA-256, and constant-time
//! comparison. Nothing here re-implements a primitive; it only fixes the
//! call conventions (nonce length, key length, error mapping) used
//! everywhere else.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{Result, VaultError};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Seals `plaintext` under `key`/`nonce`/`aad`, returning `ciphertext || tag`.
pub fn aead_seal(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| VaultError::AuthFail)
}

/// Opens `ciphertext_with_tag` under `key`/`nonce`/`aad`. Any failure here
/// -- wrong key, wrong nonce, tampered bytes, wrong AAD -- surfaces as
/// `AuthFail` without distinguishing the cause.
pub fn aead_open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext_with_tag: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload { msg: ciphertext_with_tag, aad },
        )
        .map_err(|_| VaultError::AuthFail)
}

/// Derives a 32-byte key from a passphrase using Argon2id.
pub fn kdf(passphrase: &[u8], salt: &[u8; 16], mem_kib: u32, iters: u32, parallelism: u8) -> Result<[u8; KEY_LEN]> {
    let params = Params::new(mem_kib, iters, parallelism as u32, Some(KEY_LEN))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::default(), params);

    let mut out = [0u8; KEY_LEN];
    argon2.hash_password_into(passphrase, salt, &mut out)?;
    Ok(out)
}

/// Returns `n` bytes sampled from the OS CSPRNG.
pub fn random(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Returns a fixed-size array sampled from the OS CSPRNG. Nonces are always
/// generated this way, at every seal call -- the design does not rely on
/// counters, so a nonce collision would require a 192-bit birthday event.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Overwrites `buf` with zeroes. Uses the `zeroize` crate so the write
/// survives compiler dead-store elimination.
pub fn zeroize(buf: &mut [u8]) {
    buf.zeroize();
}

/// Constant-time byte comparison.
pub fn const_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Seals the index plaintext as `nonce24 || pt_len:u32 || ciphertext || tag16`,
/// the bit-exact layout the index region uses (the explicit length field
/// lets a reader validate the AEAD output against the declared size before
/// trusting it, even though XChaCha20-Poly1305 already preserves length).
pub fn seal_index_blob(key: &[u8; KEY_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = random_array::<NONCE_LEN>();
    let sealed = aead_seal(key, &nonce, aad, plaintext)?;
    let mut out = Vec::with_capacity(NONCE_LEN + 4 + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Inverse of [`seal_index_blob`].
pub fn open_index_blob(key: &[u8; KEY_LEN], aad: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN + 4 {
        return Err(VaultError::Corrupt("index blob truncated".into()));
    }
    let nonce: [u8; NONCE_LEN] = blob[..NONCE_LEN].try_into().expect("split at NONCE_LEN");
    let pt_len = u32::from_le_bytes(blob[NONCE_LEN..NONCE_LEN + 4].try_into().unwrap()) as usize;
    let sealed = &blob[NONCE_LEN + 4..];

    let plaintext = aead_open(key, &nonce, aad, sealed)?;
    if plaintext.len() != pt_len {
        return Err(VaultError::Corrupt("index plaintext length mismatch".into()));
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_roundtrips() {
        let key = random_array::<KEY_LEN>();
        let nonce = random_array::<NONCE_LEN>();
        let aad = b"entry-aad";
        let pt = b"hello vault";

        let ct = aead_seal(&key, &nonce, aad, pt).unwrap();
        assert_eq!(ct.len(), pt.len() + TAG_LEN);

        let back = aead_open(&key, &nonce, aad, &ct).unwrap();
        assert_eq!(back, pt);
    }

    #[test]
    fn open_fails_on_tamper() {
        let key = random_array::<KEY_LEN>();
        let nonce = random_array::<NONCE_LEN>();
        let mut ct = aead_seal(&key, &nonce, b"", b"payload").unwrap();
        *ct.last_mut().unwrap() ^= 0xff;

        assert!(matches!(aead_open(&key, &nonce, b"", &ct), Err(VaultError::AuthFail)));
    }

    #[test]
    fn open_fails_on_wrong_aad() {
        let key = random_array::<KEY_LEN>();
        let nonce = random_array::<NONCE_LEN>();
        let ct = aead_seal(&key, &nonce, b"a", b"payload").unwrap();

        assert!(matches!(aead_open(&key, &nonce, b"b", &ct), Err(VaultError::AuthFail)));
    }

    #[test]
    fn kdf_is_deterministic_for_same_salt() {
        let salt = [7u8; 16];
        let a = kdf(b"correct horse battery staple", &salt, 32 * 1024, 3, 1).unwrap();
        let b = kdf(b"correct horse battery staple", &salt, 32 * 1024, 3, 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn const_time_eq_matches_equality() {
        assert!(const_time_eq(b"abc", b"abc"));
        assert!(!const_time_eq(b"abc", b"abd"));
        assert!(!const_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn index_blob_roundtrips() {
        let key = random_array::<KEY_LEN>();
        let blob = seal_index_blob(&key, b"index", b"plaintext bytes").unwrap();
        let back = open_index_blob(&key, b"index", &blob).unwrap();
        assert_eq!(back, b"plaintext bytes");
    }
}
