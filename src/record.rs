//! # Record file: package name to version.
//!
//! ```json
//! { "packages": { "foo": "2", "bar": "1.4.0" } }
//! ```
//!
//! Updates are read whole, change one entry, write whole. Writes go to a temp file in the same
//! directory and are renamed over the record, so a reader never sees a half-written file and
//! concurrent writers are last-writer-wins. There is no locking: two concurrent updates of
//! different packages can lose one of them.

use std::{
    collections::BTreeMap,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RecordError;

/// Parsed record file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub packages: BTreeMap<String, String>,
    /// Unrelated top-level keys, preserved on rewrite.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    pub fn version(&self, package: &str) -> Option<&str> {
        self.packages.get(package).map(String::as_str)
    }
}

/// Record file on disk.
#[derive(Clone, Debug)]
pub struct RecordFile {
    path: PathBuf,
}

impl RecordFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole record; a missing or empty file is an empty record.
    pub async fn read(&self) -> Result<Record, RecordError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Record::default()),
            Err(source) => {
                return Err(RecordError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Record::default());
        }
        serde_json::from_slice(&bytes).map_err(|source| RecordError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Replaces the whole record atomically.
    pub async fn write(&self, record: &Record) -> Result<(), RecordError> {
        let bytes = encode(&self.path, record)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || replace(&path, &bytes))
            .await
            .map_err(io::Error::other)
            .and_then(|res| res)
            .map_err(|source| RecordError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Read whole, set one entry, write whole. Returns the record as written.
    pub async fn set_version(&self, package: &str, version: &str) -> Result<Record, RecordError> {
        let mut record = self.read().await?;
        record
            .packages
            .insert(package.to_string(), version.to_string());
        self.write(&record).await?;
        Ok(record)
    }
}

/// Pretty JSON plus a trailing newline.
fn encode<T: Serialize>(path: &Path, value: &T) -> Result<Vec<u8>, RecordError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| RecordError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn replace(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
