//! JSON Lines sink.
//!
//! [`JsonlSink`] appends one compact JSON document per record. A batch is
//! serialized in full before the file is touched, written with a single append,
//! and synced; if the write or sync fails the file is truncated back to its
//! previous length, so a failed commit leaves no partial lines behind.
//!
//! The sink is append-only. Restarting a job whose chunks committed out of order
//! can re-append records that were already written; consumers that need
//! exactly-once output deduplicate on a record key.

use crate::error::ItemError;
use crate::item::ItemSink;
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{File, OpenOptions, create_dir_all};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Appends committed batches to a JSON Lines file.
#[derive(Debug)]
pub struct JsonlSink<T> {
    path: PathBuf,
    file: Mutex<File>,
    _marker: PhantomData<fn(&T)>,
}

impl<T> JsonlSink<T> {
    /// Creates (or truncates) the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directories or the file cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), true)
    }

    /// Opens `path` for appending, creating it if needed. Use this when resuming
    /// a job so earlier chunks stay in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directories or the file cannot be opened.
    pub fn append(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), false)
    }

    fn open_with(path: &Path, truncate: bool) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
        }
        let file = if truncate {
            // Truncate first, then reopen in append mode for the commits.
            File::create(path).with_context(|| format!("create {}", path.display()))?;
            OpenOptions::new().append(true).open(path)
        } else {
            OpenOptions::new().create(true).append(true).open(path)
        }
        .with_context(|| format!("open {} for append", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            _marker: PhantomData,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: Serialize> ItemSink<T> for JsonlSink<T> {
    fn commit(&self, batch: &[T]) -> Result<(), ItemError> {
        let mut buf = Vec::new();
        for (i, item) in batch.iter().enumerate() {
            serde_json::to_writer(&mut buf, item)
                .map_err(|e| ItemError::invalid(format!("serialize item #{i}: {e}")))?;
            buf.push(b'\n');
        }

        let mut file = self
            .file
            .lock()
            .map_err(|_| ItemError::io(format!("{} writer lock poisoned", self.path.display())))?;
        let len = file.metadata()?.len();
        let written = file.write_all(&buf).and_then(|()| file.sync_data());
        if let Err(e) = written {
            if let Err(rollback) = file.set_len(len) {
                warn!(path = %self.path.display(), error = %rollback, "could not truncate partial batch");
            }
            return Err(ItemError::io(format!("append to {}: {e}", self.path.display())));
        }
        Ok(())
    }
}

/// Reads a JSONL file into a typed `Vec<T>`, skipping blank lines.
///
/// # Errors
///
/// Returns an error if the file cannot be read or any line fails to parse into
/// `T`. Errors include the line number.
pub fn read_jsonl_vec<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut out = Vec::<T>::new();
    for (i, line) in BufReader::new(f).lines().enumerate() {
        let line = line.with_context(|| format!("read line {} in {}", i + 1, path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let v: T = serde_json::from_str(&line).with_context(|| {
            format!("parse JSONL line {} in {}: {}", i + 1, path.display(), line)
        })?;
        out.push(v);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Rec {
        id: u32,
    }

    #[test]
    fn batches_append_in_commit_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out").join("recs.jsonl");
        let sink = JsonlSink::<Rec>::create(&path).unwrap();
        sink.commit(&[Rec { id: 1 }, Rec { id: 2 }]).unwrap();
        sink.commit(&[Rec { id: 3 }]).unwrap();

        let back: Vec<Rec> = read_jsonl_vec(&path).unwrap();
        assert_eq!(back, vec![Rec { id: 1 }, Rec { id: 2 }, Rec { id: 3 }]);
    }

    #[test]
    fn append_keeps_existing_lines_and_create_truncates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("recs.jsonl");
        JsonlSink::<Rec>::create(&path)
            .unwrap()
            .commit(&[Rec { id: 1 }])
            .unwrap();
        JsonlSink::<Rec>::append(&path)
            .unwrap()
            .commit(&[Rec { id: 2 }])
            .unwrap();
        assert_eq!(read_jsonl_vec::<Rec>(&path).unwrap().len(), 2);

        JsonlSink::<Rec>::create(&path).unwrap();
        assert!(read_jsonl_vec::<Rec>(&path).unwrap().is_empty());
    }

    #[test]
    fn unserializable_batch_writes_nothing() {
        #[derive(Serialize)]
        struct Bad(std::collections::HashMap<(u8, u8), u8>);

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.jsonl");
        let sink = JsonlSink::<Bad>::create(&path).unwrap();
        let bad = Bad([((1, 2), 3)].into_iter().collect());
        let err = sink.commit(&[bad]).unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Invalid);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
