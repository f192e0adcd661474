//! Append-only sample log on local disk.
//!
//! Each sample is one postcard COBS frame, so a zero byte always marks a
//! record boundary. A crash mid-append leaves at most one unterminated frame
//! at the tail, which readers skip. A frame that fails to decode is logged
//! and skipped; the records after it are still read.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::{Sample, StoreError, TimeRange, TimeSeriesStore};

pub struct FileStore {
    path: PathBuf,
    /// Opened in append mode; `&File` writes need no lock and the
    /// acquisition worker is the only writer.
    file: File,
}

impl FileStore {
    /// Open (or create) the sample log at `path`.
    ///
    /// Fails if the file cannot be opened for both appending and reading,
    /// which callers treat as fatal at startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        debug!("Opened sample log {}", path.display());
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<u8>, StoreError> {
        let mut bytes = Vec::new();
        File::open(&self.path)?.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl TimeSeriesStore for FileStore {
    fn append(&self, sample: &Sample) -> Result<(), StoreError> {
        let frame = postcard::to_allocvec_cobs(sample)?;
        let mut file = &self.file;
        file.write_all(&frame)?;
        file.sync_data()?;
        Ok(())
    }

    fn query(&self, range: TimeRange) -> Result<Vec<Sample>, StoreError> {
        let mut bytes = self.read_all()?;
        let mut samples = Vec::new();
        let mut start = 0;

        while start < bytes.len() {
            let Some(len) = bytes[start..].iter().position(|&b| b == 0) else {
                warn!(
                    "Ignoring {} trailing bytes of an unterminated record in {}",
                    bytes.len() - start,
                    self.path.display()
                );
                break;
            };
            let end = start + len + 1;

            match postcard::from_bytes_cobs::<Sample>(&mut bytes[start..end]) {
                Ok(sample) if range.contains(sample.captured_at) => samples.push(sample),
                Ok(_) => {}
                Err(e) => warn!(
                    "Skipping corrupt record at byte {} of {}: {}",
                    start,
                    self.path.display(),
                    e
                ),
            }

            start = end;
        }

        samples.sort_by_key(|s| s.captured_at);
        Ok(samples)
    }
}
