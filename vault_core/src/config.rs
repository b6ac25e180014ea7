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

//! Configuration recognized by the vault engine. None of it is persisted by
//! the core itself (the surrounding application decides where container
//! files live and how options are remembered between runs).

/// Selects the Argon2id cost parameters used to derive the KEK at vault
/// creation. The choice is recorded in the header slot and is therefore
/// fixed for the lifetime of the container; a passphrase change may pick a
/// new profile without affecting the MK or any file data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KdfProfile {
    /// 32 MiB, 3 iterations.
    Low,
    /// 128 MiB, 10 iterations.
    Medium,
    /// 256 MiB, 12 iterations.
    High,
}

/// Argon2id cost parameters in the units the slot stores them in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KdfParams {
    pub mem_kib: u32,
    pub iters: u32,
    pub parallelism: u8,
}

impl KdfProfile {
    pub fn params(self) -> KdfParams {
        match self {
            KdfProfile::Low => KdfParams {
                mem_kib: 32 * 1024,
                iters: 3,
                parallelism: 1,
            },
            KdfProfile::Medium => KdfParams {
                mem_kib: 128 * 1024,
                iters: 10,
                parallelism: 1,
            },
            KdfProfile::High => KdfParams {
                mem_kib: 256 * 1024,
                iters: 12,
                parallelism: 1,
            },
        }
    }

    /// Recovers the profile's identity from stored parameters, falling back
    /// to `None` for values that don't match any of the three reference
    /// tiers (e.g. a container created by a future version of the format).
    pub fn from_params(params: KdfParams) -> Option<Self> {
        [Self::Low, Self::Medium, Self::High]
            .into_iter()
            .find(|p| p.params() == params)
    }
}

/// The chunk size used for a single imported file's streaming layout. Each
/// file is stored entirely under one chunk size; different files in the
/// same container may use different sizes, and the size is recorded per
/// entry so a reader never has to guess which a given file used.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChunkSize {
    /// 1 MiB, kept for files imported by older versions of the format.
    Legacy1MiB,
    /// 4 MiB, the current default.
    Default4MiB,
}

impl ChunkSize {
    pub const fn bytes(self) -> u32 {
        match self {
            ChunkSize::Legacy1MiB => 1024 * 1024,
            ChunkSize::Default4MiB => 4 * 1024 * 1024,
        }
    }

    pub fn from_bytes(n: u32) -> Option<Self> {
        match n {
            n if n == Self::Legacy1MiB.bytes() => Some(Self::Legacy1MiB),
            n if n == Self::Default4MiB.bytes() => Some(Self::Default4MiB),
            _ => None,
        }
    }
}

/// The default threshold after which an abandoned streaming import is
/// garbage-collected by [`crate::vault::Vault::streaming_cleanup_old`].
pub const DEFAULT_MAX_PENDING_IMPORT_AGE_MS: u64 = 24 * 60 * 60 * 1000;

/// Soft cap on the number of live entries a vault is expected to hold.
pub const DEFAULT_MAX_ENTRIES_PER_VAULT: usize = 100_000;

/// Options selected once, at [`crate::vault::Vault::create`] time (kdf
/// profile, max entries) or once per imported file (chunk size).
#[derive(Clone, Copy, Debug)]
pub struct VaultConfig {
    pub kdf_profile: KdfProfile,
    pub stream_chunk_size: ChunkSize,
    pub max_pending_import_age_ms: u64,
    pub max_entries_per_vault: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            kdf_profile: KdfProfile::Medium,
            stream_chunk_size: ChunkSize::Default4MiB,
            max_pending_import_age_ms: DEFAULT_MAX_PENDING_IMPORT_AGE_MS,
            max_entries_per_vault: DEFAULT_MAX_ENTRIES_PER_VAULT,
        }
    }
}
