use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Append-only text file of measurements: one value per line, a blank line
/// closing each batch. Existing contents are never truncated.
#[derive(Debug)]
pub struct MeasurementSink {
    path: PathBuf,
    out: BufWriter<File>,
}

impl MeasurementSink {
    /// # Errors
    ///
    /// Fails when the file cannot be created or opened for appending.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one batch and flushes it.
    ///
    /// # Errors
    ///
    /// Any write or flush failure.
    pub fn append_batch(&mut self, values: &[f32]) -> io::Result<()> {
        for value in values {
            writeln!(self.out, "{value}")?;
        }
        writeln!(self.out)?;
        self.out.flush()
    }
}
