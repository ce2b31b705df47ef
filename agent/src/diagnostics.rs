//! Closeable diagnostic log file.
//!
//! [`DiagnosticLog`] is the writer behind the file layer of the tracing
//! subscriber. It is uploaded as the last artifact of a session, so it must
//! be finalized while the process is still logging: after [`close`], lines
//! written through it are discarded and the file is never written again.
//! The binary keeps a separate stderr layer, so nothing goes unseen.
//!
//! [`close`]: DiagnosticLog::close

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing_subscriber::fmt::MakeWriter;

/// Shared handle to the session's diagnostic log file.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl DiagnosticLog {
    /// Creates (or truncates) the log file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Syncs and closes the file. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn close(&self) -> io::Result<()> {
        match self.lock().take() {
            Some(mut file) => {
                file.flush()?;
                file.sync_all()
            }
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Writer handed out per log line.
#[derive(Debug)]
pub struct DiagnosticWriter {
    log: DiagnosticLog,
}

impl Write for DiagnosticWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.log.lock().as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        // One lock per line so concurrent lines never interleave.
        match self.log.lock().as_mut() {
            Some(file) => file.write_all(buf),
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.log.lock().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DiagnosticLog {
    type Writer = DiagnosticWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DiagnosticWriter { log: self.clone() }
    }
}
