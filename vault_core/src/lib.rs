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

//! An offline, zero-knowledge encrypted vault container: a single file
//! holding a crash-safe journaled header, an encrypted catalog of entries,
//! and the sealed file data itself. See [`vault::Vault`] for the entry
//! point.

mod error;
pub use error::*;

pub mod config;
pub mod container;
pub mod crypto;
pub mod header;
pub mod index;
pub mod keys;
pub mod streaming;
pub mod vault;

pub use vault::Vault;
