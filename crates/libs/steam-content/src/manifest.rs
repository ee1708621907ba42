//! Depot manifest decoding.
//!
//! An unzipped manifest is a run of `[magic:4 LE][len:4 LE][len bytes]`
//! sections closed by [`END_MAGIC`], which carries no length.

use std::fmt;
use std::io::{Cursor, Read};

use base64::Engine as _;
use prost::Message as _;
use steam_cm::SessionKey;

use crate::error::ManifestError;
use crate::proto::{ContentManifestMetadata, ContentManifestPayload, FileMapping};

pub const PAYLOAD_MAGIC: u32 = 0x71F6_17D0;
pub const METADATA_MAGIC: u32 = 0x1F48_12BE;
pub const SIGNATURE_MAGIC: u32 = 0x1B81_B817;
pub const END_MAGIC: u32 = 0x32C4_15AB;

/// Depot keys use the same cipher as CM session keys.
pub type DepotKey = SessionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepotFileFlags(pub u32);

impl DepotFileFlags {
    pub const USER_CONFIG: Self = Self(1);
    pub const VERSIONED_USER_CONFIG: Self = Self(2);
    pub const ENCRYPTED: Self = Self(4);
    pub const READ_ONLY: Self = Self(8);
    pub const HIDDEN: Self = Self(16);
    pub const EXECUTABLE: Self = Self(32);
    pub const DIRECTORY: Self = Self(64);
    pub const CUSTOM_EXECUTABLE: Self = Self(128);
    pub const INSTALL_SCRIPT: Self = Self(256);
    pub const SYMLINK: Self = Self(512);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// SHA-1 content id of a chunk.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub Vec<u8>);

impl ChunkId {
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.0)
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.to_hex())
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub crc: u32,
    pub offset: u64,
    pub original_size: u32,
    pub compressed_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Relative path with forward slashes.
    pub path: String,
    pub size: u64,
    pub flags: DepotFileFlags,
    pub chunks: Vec<ChunkRecord>,
    pub link_target: Option<String>,
    pub sha_content: Vec<u8>,
}

impl FileRecord {
    pub fn is_directory(&self) -> bool {
        self.flags.contains(DepotFileFlags::DIRECTORY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestMetadata {
    pub depot_id: u32,
    pub manifest_id: u64,
    pub creation_time: u32,
    pub filenames_encrypted: bool,
    pub original_size: u64,
    pub compressed_size: u64,
    pub unique_chunks: u32,
    pub crc_encrypted: u32,
    pub crc_clear: u32,
}

impl From<ContentManifestMetadata> for ManifestMetadata {
    fn from(raw: ContentManifestMetadata) -> Self {
        Self {
            depot_id: raw.depot_id.unwrap_or(0),
            manifest_id: raw.gid_manifest.unwrap_or(0),
            creation_time: raw.creation_time.unwrap_or(0),
            filenames_encrypted: raw.filenames_encrypted.unwrap_or(true),
            original_size: raw.cb_disk_original.unwrap_or(0),
            compressed_size: raw.cb_disk_compressed.unwrap_or(0),
            unique_chunks: raw.unique_chunks.unwrap_or(0),
            crc_encrypted: raw.crc_encrypted.unwrap_or(0),
            crc_clear: raw.crc_clear.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub files: Vec<FileRecord>,
    pub metadata: Option<ManifestMetadata>,
    /// Raw signature section, not verified.
    pub signature: Option<Vec<u8>>,
}

impl Manifest {
    /// Decodes an unzipped manifest body.
    pub fn decode(data: &[u8], depot_key: &DepotKey) -> Result<Self, ManifestError> {
        let mut payload = None;
        let mut metadata = None;
        let mut signature = None;

        for (magic, section) in sections(data)? {
            match magic {
                PAYLOAD_MAGIC => payload = Some(ContentManifestPayload::decode(section)?),
                METADATA_MAGIC => {
                    let raw = ContentManifestMetadata::decode(section)?;
                    metadata = Some(ManifestMetadata::from(raw));
                }
                SIGNATURE_MAGIC => signature = Some(section.to_vec()),
                other => {
                    log::debug!("skipping section {other:#010x} ({} bytes)", section.len());
                }
            }
        }

        let payload = payload.ok_or(ManifestError::MissingPayload)?;
        let encrypted = metadata.as_ref().map_or(true, |m| m.filenames_encrypted);
        let files = payload
            .mappings
            .into_iter()
            .map(|mapping| file_record(mapping, encrypted.then_some(depot_key)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { files, metadata, signature })
    }

    /// Sum of the declared sizes of all files.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }
}

fn sections(data: &[u8]) -> Result<Vec<(u32, &[u8])>, ManifestError> {
    let mut out = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let magic = read_u32(rest, 0, 0)?;
        if magic == END_MAGIC {
            break;
        }
        let len = read_u32(rest, 4, magic)? as usize;
        let body = &rest[8..];
        if body.len() < len {
            return Err(ManifestError::Truncated { magic, needed: len, available: body.len() });
        }
        out.push((magic, &body[..len]));
        rest = &body[len..];
    }
    Ok(out)
}

fn read_u32(data: &[u8], at: usize, magic: u32) -> Result<u32, ManifestError> {
    let bytes = data
        .get(at..at + 4)
        .ok_or(ManifestError::Truncated { magic, needed: at + 4, available: data.len() })?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(raw))
}

fn file_record(
    mapping: FileMapping,
    depot_key: Option<&DepotKey>,
) -> Result<FileRecord, ManifestError> {
    let name = mapping.filename.unwrap_or_default();
    let path = match depot_key {
        Some(key) => decrypt_filename(&name, key)?,
        None => name,
    };

    let chunks = mapping
        .chunks
        .into_iter()
        .map(|chunk| ChunkRecord {
            id: ChunkId(chunk.sha.unwrap_or_default()),
            crc: chunk.crc.unwrap_or(0),
            offset: chunk.offset.unwrap_or(0),
            original_size: chunk.cb_original.unwrap_or(0),
            compressed_size: chunk.cb_compressed.unwrap_or(0),
        })
        .collect();

    Ok(FileRecord {
        path: path.replace('\\', "/"),
        size: mapping.size.unwrap_or(0),
        flags: DepotFileFlags(mapping.flags.unwrap_or(0)),
        chunks,
        link_target: mapping.linktarget.filter(|target| !target.is_empty()),
        sha_content: mapping.sha_content.unwrap_or_default(),
    })
}

/// base64, then the depot cipher, then one trailing NUL dropped.
pub fn decrypt_filename(encoded: &str, depot_key: &DepotKey) -> Result<String, ManifestError> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let ciphertext = base64::engine::general_purpose::STANDARD.decode(compact)?;
    let mut plain = depot_key.decrypt(&ciphertext).map_err(ManifestError::Filename)?;
    if plain.last() == Some(&0) {
        plain.pop();
    }
    Ok(String::from_utf8(plain)?)
}

/// Extracts the single entry of a zipped response body.
pub fn unzip(data: &[u8]) -> Result<Vec<u8>, ManifestError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    if archive.len() != 1 {
        let found = archive.len();
        return Err(ManifestError::Decompress(format!("expected one archive entry, found {found}")));
    }
    let mut entry = archive.by_index(0)?;
    let mut out = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut out).map_err(|err| ManifestError::Decompress(err.to_string()))?;
    Ok(out)
}
