//! Append-only per-host output files.

use std::fs::File;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir, fs_utf8::OpenOptions};

/// Output file owned by exactly one remote session.
///
/// The file is opened in append mode so repeated runs accumulate history.
/// Closing is idempotent; writes after close fail with
/// [`io::ErrorKind::BrokenPipe`].
#[derive(Debug)]
pub struct OutputSink {
    path: Utf8PathBuf,
    file: Option<File>,
}

impl OutputSink {
    /// Opens (creating if needed) `path` for appending.
    ///
    /// The parent directory must already exist.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the directory or file cannot be
    /// opened.
    pub fn open_append(path: &Utf8Path) -> io::Result<Self> {
        let parent = path
            .parent()
            .filter(|dir| !dir.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let file_name = path.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("output path {path} is missing a file name"),
            )
        })?;

        let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
        let mut options = OpenOptions::new();
        options.append(true).create(true);
        let file = dir.open_with(file_name, &options)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file.into_std()),
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns `true` once [`OutputSink::close`] has run.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Clones the file handle so a child process can write to it directly.
    ///
    /// # Errors
    ///
    /// Fails when the sink is closed or the handle cannot be duplicated.
    pub fn duplicate_handle(&self) -> io::Result<File> {
        self.open_file()?.try_clone()
    }

    /// Flushes anything written through [`Write`] so far.
    ///
    /// # Errors
    ///
    /// Fails when the sink is closed or the flush fails.
    pub fn flush_pending(&mut self) -> io::Result<()> {
        self.open_file_mut()?.flush()
    }

    /// Flushes and releases the file. Calling this twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the error from the final flush; the handle is released either
    /// way.
    pub fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }

    fn open_file(&self) -> io::Result<&File> {
        self.file.as_ref().ok_or_else(|| self.closed_error())
    }

    fn open_file_mut(&mut self) -> io::Result<&mut File> {
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("output sink {} is closed", self.path),
            )),
        }
    }

    fn closed_error(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("output sink {} is closed", self.path),
        )
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.open_file_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_pending()
    }
}
