//! Temporary files for I/O tests.

use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A temporary file that is deleted when dropped.
pub struct TempFilePath {
    #[allow(dead_code)]
    temp_file: NamedTempFile,
    path: PathBuf,
}

impl TempFilePath {
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be created.
    pub fn new() -> std::io::Result<Self> {
        let temp_file = NamedTempFile::new()?;
        let path = temp_file.path().to_path_buf();
        Ok(Self { temp_file, path })
    }

    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be created.
    pub fn with_extension(extension: &str) -> std::io::Result<Self> {
        let temp_file = tempfile::Builder::new()
            .suffix(&format!(".{extension}"))
            .tempfile()?;
        let path = temp_file.path().to_path_buf();
        Ok(Self { temp_file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates a temporary file holding `contents` verbatim.
///
/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub fn mock_text_file(contents: &str) -> std::io::Result<TempFilePath> {
    let temp = TempFilePath::new()?;
    let mut file = std::fs::File::create(temp.path())?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(temp)
}

/// Creates a temporary CSV file from serializable records.
///
/// ```
/// use ironbatch::testing::{mock_csv_file, sample_customers};
///
/// let file = mock_csv_file(&sample_customers(5), true).unwrap();
/// let text = std::fs::read_to_string(file.path()).unwrap();
/// assert!(text.starts_with("id,firstName,lastName"));
/// ```
///
/// # Errors
///
/// Returns an error if the file cannot be created or a record fails to serialize.
#[cfg(feature = "io-csv")]
pub fn mock_csv_file<T: serde::Serialize>(data: &[T], with_header: bool) -> std::io::Result<TempFilePath> {
    let temp = TempFilePath::with_extension("csv")?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(with_header)
        .from_path(temp.path())?;
    for record in data {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(temp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_file_round_trips() {
        let temp = mock_text_file("a,b\n1,2\n").unwrap();
        assert_eq!(std::fs::read_to_string(temp.path()).unwrap(), "a,b\n1,2\n");
    }

    #[test]
    fn extension_is_applied() {
        let temp = TempFilePath::with_extension("csv").unwrap();
        assert_eq!(temp.path().extension().unwrap(), "csv");
    }
}
