// vault_cli is a command-line front end for the vault container engine.
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

mod error;
use error::*;

use vault_core::config::{KdfProfile, VaultConfig};
use vault_core::index::FileType;
use vault_core::{Vault, VaultError};

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the vault container file.
    #[arg(short, long, global = true)]
    vault: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new, empty vault container.
    Create {
        /// Argon2id cost tier used to derive the passphrase key: low, medium, or high.
        #[arg(long, default_value = "medium")]
        kdf_profile: String,
    },
    /// Import a file from the local file system into the vault.
    Import {
        /// The file to import.
        file: PathBuf,
        /// The name to store the file under. Defaults to the file's own name.
        #[arg(short, long)]
        name: Option<String>,
        /// The MIME type to record for the file.
        #[arg(short, long)]
        mime: Option<String>,
        /// One of image, video, audio, document, text, binary.
        #[arg(short = 't', long, default_value = "binary")]
        file_type: String,
    },
    /// List the entries currently in the vault.
    List,
    /// Decrypt a file from the vault back onto the local file system.
    Export {
        /// A file id (hex) or, if it names exactly one entry, an entry name.
        id: String,
        /// Where to write the decrypted file.
        out: PathBuf,
    },
    /// Rename an entry.
    Rename {
        id: String,
        new_name: String,
    },
    /// Remove an entry. The space it occupied is reclaimed by `compact`.
    Delete { id: String },
    /// Copy an entry under a new name, re-encrypting its contents under a fresh key.
    Duplicate { id: String, new_name: String },
    /// Rebuild the container, discarding space left by deletions and abandoned imports.
    Compact,
    /// Change the passphrase the vault is sealed under.
    ChangePassphrase,
}

fn logic() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Create { kdf_profile } => {
            let passphrase = prompt_new_passphrase()?;
            let config = VaultConfig {
                kdf_profile: parse_kdf_profile(&kdf_profile)?,
                ..VaultConfig::default()
            };
            Vault::create(&cli.vault, passphrase.as_bytes(), config)?;
            println!("Created vault at {}", cli.vault.display());
        }
        Commands::Import {
            file,
            name,
            mime,
            file_type,
        } => {
            let vault = open_vault(&cli.vault)?;
            let file_type = parse_file_type(&file_type)?;
            let name = name.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "unnamed".to_string())
            });

            let metadata = std::fs::metadata(&file)?;
            let chunk_size = vault.config().stream_chunk_size.bytes() as u64;

            let id = if metadata.len() > chunk_size {
                import_streaming(&vault, &file, &name, mime.as_deref(), file_type, metadata.len())?
            } else {
                let mut data = Vec::new();
                File::open(&file)?.read_to_end(&mut data)?;
                vault.import_file(&name, mime.as_deref(), file_type, &data)?
            };
            println!("Imported \"{name}\" as {}", hex::encode(id));
        }
        Commands::List => {
            let vault = open_vault(&cli.vault)?;
            for entry in vault.list() {
                let created = chrono::DateTime::from_timestamp_millis(entry.created_ms as i64)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| "?".to_string());
                println!("{}  {:>12}  {:<32}  {}", hex::encode(entry.file_id), entry.size, entry.name, created);
            }
        }
        Commands::Export { id, out } => {
            let vault = open_vault(&cli.vault)?;
            let file_id = resolve_id(&vault, &id)?;
            let data = vault.read_file(&file_id)?;
            File::create(&out)?.write_all(&data)?;
            println!("Exported to {}", out.display());
        }
        Commands::Rename { id, new_name } => {
            let vault = open_vault(&cli.vault)?;
            let file_id = resolve_id(&vault, &id)?;
            vault.rename(&file_id, &new_name)?;
        }
        Commands::Delete { id } => {
            let vault = open_vault(&cli.vault)?;
            let file_id = resolve_id(&vault, &id)?;
            vault.delete(&file_id)?;
        }
        Commands::Duplicate { id, new_name } => {
            let vault = open_vault(&cli.vault)?;
            let file_id = resolve_id(&vault, &id)?;
            let new_id = vault.duplicate(&file_id, &new_name)?;
            println!("Duplicated as {}", hex::encode(new_id));
        }
        Commands::Compact => {
            let vault = open_vault(&cli.vault)?;
            vault.compact()?;
        }
        Commands::ChangePassphrase => {
            let vault = open_vault(&cli.vault)?;
            let new_passphrase = prompt_new_passphrase()?;
            vault.change_passphrase(new_passphrase.as_bytes())?;
        }
    }

    Ok(())
}

fn main() {
    match logic() {
        Ok(_) => {}
        Err(e) => eprintln!("Error: {e}"),
    }
}

fn open_vault(path: &Path) -> Result<Vault> {
    let passphrase = rpassword::prompt_password("Enter passphrase: ")?;
    Ok(Vault::open(path, passphrase.as_bytes(), VaultConfig::default())?)
}

fn prompt_new_passphrase() -> Result<String> {
    let first = rpassword::prompt_password("Enter new passphrase: ")?;
    let second = rpassword::prompt_password("Confirm new passphrase: ")?;
    if first != second {
        return Err(Error::PassphraseMismatch);
    }
    Ok(first)
}

fn parse_kdf_profile(s: &str) -> Result<KdfProfile> {
    match s.to_ascii_lowercase().as_str() {
        "low" => Ok(KdfProfile::Low),
        "medium" => Ok(KdfProfile::Medium),
        "high" => Ok(KdfProfile::High),
        other => Err(Error::Vault(VaultError::InvalidParam(format!("unknown kdf profile \"{other}\"")))),
    }
}

fn parse_file_type(s: &str) -> Result<FileType> {
    match s.to_ascii_lowercase().as_str() {
        "image" => Ok(FileType::Image),
        "video" => Ok(FileType::Video),
        "audio" => Ok(FileType::Audio),
        "document" => Ok(FileType::Document),
        "text" => Ok(FileType::Text),
        "binary" => Ok(FileType::Binary),
        other => Err(Error::Vault(VaultError::InvalidParam(format!("unknown file type \"{other}\"")))),
    }
}

/// Accepts either a hex-encoded file id or, if it names exactly one entry, a
/// plain name lookup.
fn resolve_id(vault: &Vault, id: &str) -> Result<[u8; 16]> {
    if let Ok(bytes) = hex::decode(id) {
        if let Ok(arr) = <[u8; 16]>::try_from(bytes.as_slice()) {
            return Ok(arr);
        }
    }
    match vault.find_by_name(id).as_slice() {
        [] => Err(Error::UnknownName(id.to_string())),
        [only] => Ok(*only),
        matches => Err(Error::AmbiguousName(id.to_string(), matches.len())),
    }
}

#[allow(clippy::too_many_arguments)]
fn import_streaming(
    vault: &Vault,
    file: &Path,
    name: &str,
    mime: Option<&str>,
    file_type: FileType,
    total_size: u64,
) -> Result<[u8; 16]> {
    let chunk_size = vault.config().stream_chunk_size.bytes() as usize;
    let file_id = vault.streaming_start(name, mime, file_type, total_size)?;

    let mut f = File::open(file)?;
    let mut buf = vec![0u8; chunk_size];
    let mut index = 0u32;
    loop {
        let n = read_fully(&mut f, &mut buf)?;
        if n == 0 {
            break;
        }
        vault.streaming_write_chunk(&file_id, index, &buf[..n])?;
        index += 1;
        if n < chunk_size {
            break;
        }
    }
    vault.streaming_finish(&file_id)?;
    Ok(file_id)
}

/// Reads until `buf` is full or the file is exhausted, since `Read::read`
/// alone may return short of a full chunk.
fn read_fully(f: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = f.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
