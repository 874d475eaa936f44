//! Binary storage for a collection's vector index.
//!
//! File format:
//!
//! Header (49 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u32 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated `entry_count` times, in position order):
//! - embedding: [f32; dimensions] (little-endian)
//!
//! Positions are implicit: the n-th entry is position n. Bytes after the
//! last counted entry are leftovers of an interrupted append and are ignored.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::semantic::index::VectorIndex;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(4) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 49;

/// Offset of the checksum inside the header
const CHECKSUM_OFFSET: usize = 45;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Storage manager for one index file.
#[derive(Debug, Clone)]
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the vector index from storage.
    ///
    /// A missing file yields an empty index, so a first run looks exactly
    /// like an explicitly empty one.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<VectorIndex, VectorStorageError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(VectorIndex::new(expected_dimensions));
            }
            Err(err) => return Err(err.into()),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        validate_header(&header, expected_model_id, expected_dimensions)?;

        let dimensions = header.dimensions as usize;
        let body_len = header
            .entry_count
            .checked_mul(entry_size(dimensions))
            .ok_or_else(|| VectorStorageError::InvalidFormat("entry count overflow".into()))?;
        let available = file_len.saturating_sub(HEADER_SIZE as u64);

        if available < body_len {
            return Err(VectorStorageError::InvalidFormat(format!(
                "file truncated: header announces {} entries ({} bytes), found {} bytes",
                header.entry_count, body_len, available
            )));
        }
        if available > body_len {
            log::warn!(
                "{}: ignoring {} trailing bytes after {} entries",
                self.path.display(),
                available - body_len,
                header.entry_count
            );
        }

        let mut index = VectorIndex::with_capacity(dimensions, header.entry_count as usize);
        let mut embedding = vec![0f32; dimensions];
        for _ in 0..header.entry_count {
            read_entry(&mut reader, &mut embedding)?;
            index.append(&embedding).map_err(|e| {
                VectorStorageError::InvalidFormat(format!("bad entry at {}: {e}", index.len()))
            })?;
        }

        Ok(index)
    }

    /// Save the whole index.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let temp_path = temp_path_for(&self.path);

        let result = write_to_file(&temp_path, index, model_id);

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Persist the entries `from..index.len()` in place.
    ///
    /// Entries are written first and the header (with the new count) last, both
    /// fsynced. A crash in between leaves the old count in the header, so the
    /// partially written tail is never read back. Falls back to a full `save`
    /// when no file exists yet.
    pub fn append(
        &self,
        index: &VectorIndex,
        from: usize,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        if !self.exists() {
            return self.save(index, model_id);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let header = read_header(&mut BufReader::new(&mut file))?;
        validate_header(&header, model_id, index.dimensions())?;

        if header.entry_count != from as u64 {
            return Err(VectorStorageError::InvalidFormat(format!(
                "append from {} but file holds {} entries",
                from, header.entry_count
            )));
        }

        let offset = HEADER_SIZE as u64 + header.entry_count * entry_size(index.dimensions());
        file.seek(SeekFrom::Start(offset))?;
        {
            let mut writer = BufWriter::new(&mut file);
            for embedding in index.iter().skip(from) {
                write_entry(&mut writer, embedding)?;
            }
            writer.flush()?;
        }
        file.sync_data()?;

        file.seek(SeekFrom::Start(0))?;
        write_header(&mut file, &Header::for_index(index, model_id))?;
        file.sync_all()?;

        Ok(())
    }

    /// Number of entries the durable file currently holds, read from the header only.
    pub fn durable_len(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<usize, VectorStorageError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let header = read_header(&mut BufReader::new(file))?;
        validate_header(&header, expected_model_id, expected_dimensions)?;
        Ok(header.entry_count as usize)
    }
}

/// Sibling path used for atomic rewrites of `path`, e.g. `res.index.tmp`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn entry_size(dimensions: usize) -> u64 {
    dimensions as u64 * 4
}

fn write_to_file(path: &Path, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    write_header(&mut writer, &Header::for_index(index, model_id))?;

    for embedding in index.iter() {
        write_entry(&mut writer, embedding)?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
    file.sync_all()?;

    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<Header, VectorStorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => VectorStorageError::InvalidFormat("file shorter than header".into()),
        _ => err.into(),
    })?;

    let version = header_bytes[0];

    if version > FORMAT_VERSION {
        return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes(le_array(&header_bytes[CHECKSUM_OFFSET..HEADER_SIZE]));
    let computed_checksum = crc32fast::hash(&header_bytes[..CHECKSUM_OFFSET]);
    if stored_checksum != computed_checksum {
        return Err(VectorStorageError::ChecksumMismatch);
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&header_bytes[1..33]);

    Ok(Header {
        model_id,
        dimensions: u32::from_le_bytes(le_array(&header_bytes[33..37])),
        entry_count: u64::from_le_bytes(le_array(&header_bytes[37..45])),
    })
}

fn validate_header(
    header: &Header,
    expected_model_id: &[u8; 32],
    expected_dimensions: usize,
) -> Result<(), VectorStorageError> {
    if header.model_id != *expected_model_id {
        return Err(VectorStorageError::ModelMismatch);
    }

    if header.dimensions as usize != expected_dimensions {
        return Err(VectorStorageError::DimensionMismatch {
            expected: expected_dimensions,
            got: header.dimensions as usize,
        });
    }

    Ok(())
}

fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = FORMAT_VERSION;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..37].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[37..45].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[..CHECKSUM_OFFSET]);
    header_bytes[CHECKSUM_OFFSET..HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}

fn read_entry(reader: &mut impl Read, embedding: &mut [f32]) -> Result<(), VectorStorageError> {
    let mut float_bytes = [0u8; 4];
    for value in embedding.iter_mut() {
        reader.read_exact(&mut float_bytes)?;
        *value = f32::from_le_bytes(float_bytes);
    }
    Ok(())
}

fn write_entry(writer: &mut impl Write, embedding: &[f32]) -> Result<(), VectorStorageError> {
    for &value in embedding {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[derive(Debug)]
struct Header {
    model_id: [u8; 32],
    dimensions: u32,
    entry_count: u64,
}

impl Header {
    fn for_index(index: &VectorIndex, model_id: &[u8; 32]) -> Self {
        Self {
            model_id: *model_id,
            dimensions: index.dimensions() as u32,
            entry_count: index.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_storage() -> (VectorStorage, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("flat.index"));
        (storage, tmp)
    }

    fn test_model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn sample_index() -> VectorIndex {
        let mut index = VectorIndex::new(3);
        index.append(&[1.0, 0.0, 0.0]).unwrap();
        index.append(&[0.0, 1.0, 0.0]).unwrap();
        index.append(&[0.0, 0.0, 1.0]).unwrap();
        index
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let (storage, _tmp) = temp_storage();
        let index = storage.load(&test_model_id(), 384).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.dimensions(), 384);
        assert_eq!(storage.durable_len(&test_model_id(), 384).unwrap(), 0);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (storage, _tmp) = temp_storage();
        let model_id = test_model_id();
        let index = sample_index();

        storage.save(&index, &model_id).unwrap();
        let loaded = storage.load(&model_id, 3).unwrap();

        assert_eq!(loaded.len(), index.len());
        let probe = [0.1, 0.9, 0.0];
        assert_eq!(
            loaded.search(&probe, 3).unwrap(),
            index.search(&probe, 3).unwrap()
        );
    }

    #[test]
    fn test_append_extends_file_in_place() {
        let (storage, _tmp) = temp_storage();
        let model_id = test_model_id();

        let mut index = VectorIndex::new(3);
        index.append(&[1.0, 0.0, 0.0]).unwrap();
        storage.append(&index, 0, &model_id).unwrap();
        assert_eq!(storage.durable_len(&model_id, 3).unwrap(), 1);

        index.append(&[0.0, 1.0, 0.0]).unwrap();
        index.append(&[0.0, 0.0, 1.0]).unwrap();
        storage.append(&index, 1, &model_id).unwrap();
        assert_eq!(storage.durable_len(&model_id, 3).unwrap(), 3);

        let loaded = storage.load(&model_id, 3).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.get(2).unwrap(), &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_append_rejects_gap() {
        let (storage, _tmp) = temp_storage();
        let model_id = test_model_id();
        let index = sample_index();
        storage.save(&index, &model_id).unwrap();

        let result = storage.append(&index, 1, &model_id);
        assert!(matches!(result, Err(VectorStorageError::InvalidFormat(_))));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let (storage, _tmp) = temp_storage();
        let model_id = test_model_id();
        storage.save(&sample_index(), &model_id).unwrap();

        // half of an entry left behind by an interrupted append
        let mut file = OpenOptions::new().append(true).open(storage.path()).unwrap();
        file.write_all(&[0u8; 6]).unwrap();

        let loaded = storage.load(&model_id, 3).unwrap();
        assert_eq!(loaded.len(), 3);
    }

    #[test]
    fn test_truncated_body_rejected() {
        let (storage, _tmp) = temp_storage();
        let model_id = test_model_id();
        storage.save(&sample_index(), &model_id).unwrap();

        let len = std::fs::metadata(storage.path()).unwrap().len();
        let file = OpenOptions::new().write(true).open(storage.path()).unwrap();
        file.set_len(len - 4).unwrap();

        let result = storage.load(&model_id, 3);
        assert!(matches!(result, Err(VectorStorageError::InvalidFormat(_))));
    }

    #[test]
    fn test_model_mismatch() {
        let (storage, _tmp) = temp_storage();
        storage.save(&VectorIndex::new(3), &test_model_id()).unwrap();

        let mut wrong_model_id = [0u8; 32];
        wrong_model_id[0] = 0xFF;

        let result = storage.load(&wrong_model_id, 3);
        assert!(matches!(result, Err(VectorStorageError::ModelMismatch)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let (storage, _tmp) = temp_storage();
        storage.save(&VectorIndex::new(3), &test_model_id()).unwrap();

        let result = storage.load(&test_model_id(), 384);
        assert!(matches!(result, Err(VectorStorageError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_atomic_write_cleans_up_on_error() {
        let path = PathBuf::from("/nonexistent/directory/flat.index");
        let storage = VectorStorage::new(path.clone());

        let result = storage.save(&VectorIndex::new(3), &test_model_id());

        assert!(result.is_err());
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_temp_path_keeps_the_full_file_name() {
        assert_eq!(temp_path_for(Path::new("/data/res.index")), PathBuf::from("/data/res.index.tmp"));
        assert_ne!(temp_path_for(Path::new("res.index")), temp_path_for(Path::new("res.bin")));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let (storage, _tmp) = temp_storage();
        let model_id = test_model_id();
        storage.save(&sample_index(), &model_id).unwrap();

        let mut file = OpenOptions::new().write(true).open(storage.path()).unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        let result = storage.load(&model_id, 3);
        assert!(matches!(result, Err(VectorStorageError::ChecksumMismatch)));
    }
}
