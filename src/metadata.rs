use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
    time::Instant,
};

use crate::semantic::{temp_path_for, Position};

/// Ordered set of named text fields describing one item.
///
/// The position is not part of the record; it is the key the record is stored under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataRecord(IndexMap<String, String>);

impl MetadataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Drop fields with an empty value. The table stores those as absent.
    pub fn without_empty(mut self) -> Self {
        self.0.retain(|_, value| !value.is_empty());
        self
    }
}

impl FromIterator<(String, String)> for MetadataRecord {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("position {0} already exists")]
    DuplicateKey(Position),

    #[error("position {0} not found")]
    NotFound(Position),

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("table header {found:?} does not match expected {expected:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("bad row {row}: {reason}")]
    BadRow { row: usize, reason: String },

    #[error("table lock poisoned")]
    Poisoned,

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl<T> From<PoisonError<T>> for MetadataError {
    fn from(_: PoisonError<T>) -> Self {
        MetadataError::Poisoned
    }
}

/// Table of metadata rows keyed by a caller-assigned position.
///
/// Keys are never generated here: the writer passes the index position, which
/// is what joins a row to its vector.
pub trait MetadataStore: Send + Sync {
    /// Column names, in table order, excluding the position key.
    fn fields(&self) -> &[String];

    /// Stage a row under `position`. Fails with `DuplicateKey` if taken.
    fn insert_at(&self, position: Position, record: MetadataRecord) -> Result<(), MetadataError>;

    /// Stage many rows. Either every row is staged or none is.
    fn bulk_insert(&self, rows: Vec<(Position, MetadataRecord)>) -> Result<(), MetadataError>;

    fn get(&self, position: Position) -> Result<MetadataRecord, MetadataError>;

    fn row_count(&self) -> usize;

    /// Highest stored position, if any.
    fn max_position(&self) -> Option<Position>;

    /// Make staged rows durable.
    fn commit(&self) -> Result<(), MetadataError>;
}

/// CSV file backed table. Header is `position,<fields...>`.
#[derive(Debug)]
pub struct CsvTable {
    rows: RwLock<BTreeMap<Position, MetadataRecord>>,
    dirty: RwLock<bool>,
    fields: Vec<String>,
    path: PathBuf,
}

const POSITION_COLUMN: &str = "position";

impl CsvTable {
    /// Load the table at `path`, creating an empty one if the file is missing.
    pub fn load(path: &Path, fields: Vec<String>) -> Result<Self, MetadataError> {
        if let Err(err) = std::fs::metadata(path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("Creating new table at {}", path.display());
                    let mut csv_wrt = csv::Writer::from_path(path)?;
                    csv_wrt.write_record(&headers(&fields))?;
                    csv_wrt.flush()?;
                }
                _ => Err(err)?,
            }
        }

        Self::read(path, fields)
    }

    /// Load without writing anything; a missing file reads as an empty table.
    pub fn load_read_only(path: &Path, fields: Vec<String>) -> Result<Self, MetadataError> {
        match std::fs::metadata(path) {
            Ok(_) => Self::read(path, fields),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(CsvTable {
                rows: RwLock::new(BTreeMap::new()),
                dirty: RwLock::new(false),
                fields,
                path: path.to_path_buf(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn read(path: &Path, fields: Vec<String>) -> Result<Self, MetadataError> {
        let headers = headers(&fields);

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(path)?;

        let found: Vec<String> = csv_reader.headers()?.iter().map(String::from).collect();
        if found != headers {
            return Err(MetadataError::SchemaMismatch {
                expected: headers,
                found,
            });
        }

        let mut rows = BTreeMap::new();
        for (idx, record) in csv_reader.records().enumerate() {
            let record = record?;
            let row = idx + 1;

            let position = record
                .get(0)
                .ok_or_else(|| bad_row(row, "missing position"))?
                .parse::<Position>()
                .map_err(|err| bad_row(row, &format!("invalid position: {err}")))?;

            let mut meta = MetadataRecord::new();
            for (field, value) in fields.iter().zip(record.iter().skip(1)) {
                if !value.is_empty() {
                    meta.insert(field.clone(), value);
                }
            }

            if rows.insert(position, meta).is_some() {
                return Err(MetadataError::DuplicateKey(position));
            }
        }

        log::debug!(
            "took {}ms to read {} rows from {}",
            now.elapsed().as_micros() as f64 / 1000.0,
            rows.len(),
            path.display()
        );

        Ok(CsvTable {
            rows: RwLock::new(rows),
            dirty: RwLock::new(false),
            fields,
            path: path.to_path_buf(),
        })
    }

    fn check_fields(&self, record: &MetadataRecord) -> Result<(), MetadataError> {
        match record.fields().find(|f| !self.fields.iter().any(|known| known == f)) {
            Some(unknown) => Err(MetadataError::UnknownField(unknown.to_string())),
            None => Ok(()),
        }
    }

    fn save(&self, rows: &BTreeMap<Position, MetadataRecord>) -> Result<(), MetadataError> {
        let temp_path = temp_path_for(&self.path);

        let result = (|| -> Result<(), MetadataError> {
            let mut csv_wrt = csv::Writer::from_writer(std::fs::File::create(&temp_path)?);
            csv_wrt.write_field(POSITION_COLUMN)?;
            csv_wrt.write_record(&self.fields)?;
            for (position, record) in rows {
                csv_wrt.write_field(position.to_string())?;
                csv_wrt.write_record(self.fields.iter().map(|f| record.get(f).unwrap_or_default()))?;
            }
            let file = csv_wrt.into_inner().map_err(|err| err.into_error())?;
            file.sync_all()?;
            Ok(())
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

fn headers(fields: &[String]) -> Vec<String> {
    std::iter::once(POSITION_COLUMN.to_string())
        .chain(fields.iter().cloned())
        .collect()
}

fn bad_row(row: usize, reason: &str) -> MetadataError {
    MetadataError::BadRow {
        row,
        reason: reason.to_string(),
    }
}

impl MetadataStore for CsvTable {
    fn fields(&self) -> &[String] {
        &self.fields
    }

    fn insert_at(&self, position: Position, record: MetadataRecord) -> Result<(), MetadataError> {
        self.check_fields(&record)?;

        let mut rows = self.rows.write()?;
        if rows.contains_key(&position) {
            return Err(MetadataError::DuplicateKey(position));
        }
        rows.insert(position, record.without_empty());
        *self.dirty.write()? = true;

        Ok(())
    }

    fn bulk_insert(&self, rows: Vec<(Position, MetadataRecord)>) -> Result<(), MetadataError> {
        let mut table = self.rows.write()?;

        let mut seen = std::collections::HashSet::new();
        for (position, record) in &rows {
            self.check_fields(record)?;
            if table.contains_key(position) || !seen.insert(*position) {
                return Err(MetadataError::DuplicateKey(*position));
            }
        }

        table.extend(
            rows.into_iter()
                .map(|(position, record)| (position, record.without_empty())),
        );
        *self.dirty.write()? = true;

        Ok(())
    }

    fn get(&self, position: Position) -> Result<MetadataRecord, MetadataError> {
        self.rows
            .read()?
            .get(&position)
            .cloned()
            .ok_or(MetadataError::NotFound(position))
    }

    fn row_count(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or_default()
    }

    fn max_position(&self) -> Option<Position> {
        self.rows
            .read()
            .ok()
            .and_then(|rows| rows.keys().next_back().copied())
    }

    fn commit(&self) -> Result<(), MetadataError> {
        // readers keep going while the file is rewritten; writers are
        // serialized by the collection lock
        let rows = self.rows.read()?;
        let mut dirty = self.dirty.write()?;
        if !*dirty {
            return Ok(());
        }

        self.save(&rows)?;
        *dirty = false;

        Ok(())
    }
}
