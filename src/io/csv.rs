//! Delimited text source.
//!
//! [`CsvSource`] deserializes each record into `T` with Serde. Positions count
//! data records (skipped header lines excluded), so resuming at position `n`
//! re-reads the file and discards the first `n` records.
//!
//! Record-level problems are reported per record and classified by the step's
//! skip policy:
//! - a record with the wrong number of fields (strict mode) or one that does not
//!   deserialize into `T` is [`ErrorKind::Malformed`](crate::ErrorKind::Malformed);
//! - an I/O failure is [`ErrorKind::Io`](crate::ErrorKind::Io) and ends the cursor.
//!
//! ```no_run
//! use ironbatch::io::csv::CsvSource;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Row { id: u64, name: String }
//!
//! let source = CsvSource::<Row>::builder("people.csv")
//!     .delimiter(b';')
//!     .build();
//! ```

use crate::error::{ErrorKind, ItemError};
use crate::execution::Position;
use crate::item::{ItemCursor, ItemSource};
use csv::{Reader, ReaderBuilder, StringRecord};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::BufReader;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reads typed records from a delimited text file.
#[derive(Debug, Clone)]
pub struct CsvSource<T> {
    path: PathBuf,
    delimiter: u8,
    lines_to_skip: usize,
    names: Option<Vec<String>>,
    strict: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CsvSource<T> {
    /// Comma-delimited, one header line supplying the field names, strict.
    pub fn builder(path: impl AsRef<Path>) -> CsvSourceBuilder<T> {
        CsvSourceBuilder {
            source: CsvSource {
                path: path.as_ref().to_path_buf(),
                delimiter: b',',
                lines_to_skip: 1,
                names: None,
                strict: true,
                _marker: PhantomData,
            },
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Builder for [`CsvSource`].
#[derive(Debug, Clone)]
pub struct CsvSourceBuilder<T> {
    source: CsvSource<T>,
}

impl<T> CsvSourceBuilder<T> {
    #[must_use]
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.source.delimiter = delimiter;
        self
    }

    /// Leading lines to discard. Unless [`names`](Self::names) is set, the first
    /// skipped line is used as the header.
    #[must_use]
    pub fn lines_to_skip(mut self, lines: usize) -> Self {
        self.source.lines_to_skip = lines;
        self
    }

    /// Field names used to map columns onto `T`, overriding any header line.
    #[must_use]
    pub fn names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// In strict mode (the default) a record whose field count differs from the
    /// header is malformed.
    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.source.strict = strict;
        self
    }

    pub fn build(self) -> CsvSource<T> {
        self.source
    }
}

impl<T> ItemSource for CsvSource<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Item = T;
    type Cursor = CsvCursor<T>;

    fn open(&self, resume_from: Option<Position>) -> Result<CsvCursor<T>, ItemError> {
        let file = File::open(&self.path)
            .map_err(|e| ItemError::io(format!("open {}: {e}", self.path.display())))?;
        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(BufReader::new(file));

        let mut headers = self.names.as_ref().map(|n| StringRecord::from(n.clone()));
        let mut record = StringRecord::new();
        for line in 0..self.lines_to_skip {
            let more = reader
                .read_record(&mut record)
                .map_err(|e| ItemError::io(format!("read header of {}: {e}", self.path.display())))?;
            if !more {
                break;
            }
            if line == 0 && headers.is_none() {
                headers = Some(record.clone());
            }
        }

        let mut cursor = CsvCursor {
            reader,
            headers,
            record,
            strict: self.strict,
            position: Position::START,
            finished: false,
            _marker: PhantomData,
        };

        if let Some(target) = resume_from {
            while cursor.position < target {
                match cursor.advance() {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) if e.kind == ErrorKind::Io => return Err(e),
                    // Already counted when it was first read.
                    Err(_) => {}
                }
            }
            debug!(path = %self.path.display(), position = cursor.position.0, "resumed CSV source");
        }
        Ok(cursor)
    }
}

/// Open read handle of a [`CsvSource`].
pub struct CsvCursor<T> {
    reader: Reader<BufReader<File>>,
    headers: Option<StringRecord>,
    record: StringRecord,
    strict: bool,
    position: Position,
    finished: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> CsvCursor<T> {
    /// Reads the next raw record into the buffer. Parse errors still consume the record.
    fn advance(&mut self) -> Result<bool, ItemError> {
        if self.finished {
            return Ok(false);
        }
        match self.reader.read_record(&mut self.record) {
            Ok(true) => {
                self.position = self.position.next();
                Ok(true)
            }
            Ok(false) => {
                self.finished = true;
                Ok(false)
            }
            Err(e) if e.is_io_error() => {
                self.finished = true;
                Err(ItemError::io(e.to_string()))
            }
            Err(e) => {
                self.position = self.position.next();
                Err(ItemError::malformed(e.to_string()))
            }
        }
    }

    fn decode(&self) -> Result<T, ItemError> {
        if self.strict
            && let Some(headers) = &self.headers
            && headers.len() != self.record.len()
        {
            return Err(ItemError::malformed(format!(
                "expected {} fields, found {}",
                headers.len(),
                self.record.len()
            )));
        }
        self.record
            .deserialize(self.headers.as_ref())
            .map_err(|e| ItemError::malformed(e.to_string()))
    }
}

impl<T: DeserializeOwned> ItemCursor for CsvCursor<T> {
    type Item = T;

    fn next(&mut self) -> Option<Result<T, ItemError>> {
        match self.advance() {
            Ok(true) => Some(self.decode()),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }

    fn position(&self) -> Position {
        self.position
    }
}
