//! Binary storage for the product catalog.
//!
//! File format: catalog.bin
//!
//! Header (55 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of the embedding model name)
//! - dimensions: u16 (little-endian, 0 while no embedding is stored)
//! - entry_count: u64 (little-endian)
//! - next_id: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - id: u64 (little-endian)
//! - name, category, image_ref: u32 byte length + UTF-8 bytes
//! - embedding_len: u16 (0 = pending, otherwise `dimensions`)
//! - embedding: [f32; embedding_len] (little-endian)
//!
//! Trailer:
//! - body_checksum: u32 (CRC32 of all entry bytes)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::catalog::{CatalogEntry, Embedding};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + next_id(8) + checksum(4)
const HEADER_SIZE: usize = 55;

/// Upper bound for a single string field, guards against reading garbage lengths.
const MAX_FIELD_LEN: u32 = 64 * 1024;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,
}

/// Everything persisted in one catalog file.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogSnapshot {
    pub model_id: [u8; 32],
    pub dimensions: Option<usize>,
    pub next_id: u64,
    pub entries: Vec<CatalogEntry>,
}

/// Storage manager for the catalog file.
pub struct CatalogStorage {
    path: PathBuf,
}

impl CatalogStorage {
    /// Create a new storage manager for the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Get the storage file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the storage file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the catalog from storage.
    pub fn load(&self) -> Result<CatalogSnapshot, CatalogStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = Self::read_header(&mut reader)?;

        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        if body.len() < 4 {
            return Err(CatalogStorageError::InvalidFormat(
                "missing body checksum".to_string(),
            ));
        }
        let (entry_bytes, trailer) = body.split_at(body.len() - 4);
        let stored_checksum = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if crc32fast::hash(entry_bytes) != stored_checksum {
            return Err(CatalogStorageError::ChecksumMismatch);
        }

        let dimensions = match header.dimensions {
            0 => None,
            d => Some(d as usize),
        };

        let mut cursor = entry_bytes;
        let mut entries = Vec::with_capacity(header.entry_count.min(1 << 20) as usize);
        for _ in 0..header.entry_count {
            entries.push(Self::read_entry(&mut cursor, dimensions)?);
        }
        if !cursor.is_empty() {
            return Err(CatalogStorageError::InvalidFormat(format!(
                "{} trailing bytes after last entry",
                cursor.len()
            )));
        }

        Ok(CatalogSnapshot {
            model_id: header.model_id,
            dimensions,
            next_id: header.next_id,
            entries,
        })
    }

    /// Save the catalog to storage.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, snapshot: &CatalogSnapshot) -> Result<(), CatalogStorageError> {
        let temp_path = self.path.with_extension("tmp");

        let result = Self::write_to_file(&temp_path, snapshot);

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    fn write_to_file(path: &Path, snapshot: &CatalogSnapshot) -> Result<(), CatalogStorageError> {
        let dimensions = match snapshot.dimensions {
            Some(d) => u16::try_from(d).map_err(|_| {
                CatalogStorageError::InvalidFormat(format!("dimensions {d} exceed u16"))
            })?,
            None => 0,
        };

        let mut body = Vec::new();
        for entry in &snapshot.entries {
            Self::write_entry(&mut body, entry)?;
        }

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: snapshot.model_id,
            dimensions,
            entry_count: snapshot.entries.len() as u64,
            next_id: snapshot.next_id,
        };
        Self::write_header(&mut writer, &header)?;
        writer.write_all(&body)?;
        writer.write_all(&crc32fast::hash(&body).to_le_bytes())?;

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<Header, CatalogStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CatalogStorageError::InvalidFormat("truncated header".to_string())
            } else {
                e.into()
            }
        })?;

        let version = header_bytes[0];
        if version > FORMAT_VERSION || version == 0 {
            return Err(CatalogStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes([
            header_bytes[51],
            header_bytes[52],
            header_bytes[53],
            header_bytes[54],
        ]);
        if stored_checksum != crc32fast::hash(&header_bytes[0..51]) {
            return Err(CatalogStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);
        let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]);
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&header_bytes[35..43]);
        let mut next_id_bytes = [0u8; 8];
        next_id_bytes.copy_from_slice(&header_bytes[43..51]);

        Ok(Header {
            version,
            model_id,
            dimensions,
            entry_count: u64::from_le_bytes(count_bytes),
            next_id: u64::from_le_bytes(next_id_bytes),
        })
    }

    fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), CatalogStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes[0] = header.version;
        header_bytes[1..33].copy_from_slice(&header.model_id);
        header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());
        header_bytes[43..51].copy_from_slice(&header.next_id.to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[0..51]);
        header_bytes[51..55].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_entry(
        cursor: &mut &[u8],
        dimensions: Option<usize>,
    ) -> Result<CatalogEntry, CatalogStorageError> {
        let id = u64::from_le_bytes(take::<8>(cursor)?);
        let name = read_string(cursor)?;
        let category = read_string(cursor)?;
        let image_ref = read_string(cursor)?;

        let embedding_len = u16::from_le_bytes(take::<2>(cursor)?) as usize;
        let embedding = if embedding_len == 0 {
            Embedding::Pending
        } else {
            if dimensions != Some(embedding_len) {
                return Err(CatalogStorageError::InvalidFormat(format!(
                    "entry {id} has {embedding_len} components, header says {dimensions:?}"
                )));
            }
            let mut vector = Vec::with_capacity(embedding_len);
            for _ in 0..embedding_len {
                vector.push(f32::from_le_bytes(take::<4>(cursor)?));
            }
            Embedding::Computed(vector)
        };

        Ok(CatalogEntry {
            id,
            name,
            category,
            image_ref,
            embedding,
        })
    }

    fn write_entry(buf: &mut Vec<u8>, entry: &CatalogEntry) -> Result<(), CatalogStorageError> {
        buf.extend_from_slice(&entry.id.to_le_bytes());
        write_string(buf, &entry.name)?;
        write_string(buf, &entry.category)?;
        write_string(buf, &entry.image_ref)?;

        let vector = entry.embedding.as_slice().unwrap_or(&[]);
        let len = u16::try_from(vector.len()).map_err(|_| {
            CatalogStorageError::InvalidFormat(format!("entry {} embedding too long", entry.id))
        })?;
        buf.extend_from_slice(&len.to_le_bytes());
        for &value in vector {
            buf.extend_from_slice(&value.to_le_bytes());
        }

        Ok(())
    }
}

fn take<const N: usize>(cursor: &mut &[u8]) -> Result<[u8; N], CatalogStorageError> {
    if cursor.len() < N {
        return Err(CatalogStorageError::InvalidFormat(
            "unexpected end of entries".to_string(),
        ));
    }
    let (head, rest) = cursor.split_at(N);
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    *cursor = rest;
    Ok(out)
}

fn read_string(cursor: &mut &[u8]) -> Result<String, CatalogStorageError> {
    let len = u32::from_le_bytes(take::<4>(cursor)?);
    if len > MAX_FIELD_LEN || len as usize > cursor.len() {
        return Err(CatalogStorageError::InvalidFormat(format!(
            "string field length {len} out of range"
        )));
    }
    let (bytes, rest) = cursor.split_at(len as usize);
    *cursor = rest;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| CatalogStorageError::InvalidFormat(format!("invalid utf8: {e}")))
}

fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<(), CatalogStorageError> {
    let len = u32::try_from(value.len())
        .ok()
        .filter(|len| *len <= MAX_FIELD_LEN)
        .ok_or_else(|| {
            CatalogStorageError::InvalidFormat(format!("string field of {} bytes", value.len()))
        })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
    next_id: u64,
}
