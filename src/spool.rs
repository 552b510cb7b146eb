// ============================================================================
// Stream Spooling
// ============================================================================
//
// A stream argument can be consumed once, but a broadcast hands it to every
// replica. FileSupport drains the source into a temp file once; each replica
// then opens its own reader positioned at the start of that file.
//
// ============================================================================

use crate::core::{DbError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader};
use tracing::debug;

/// Handle to one spooled argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpooledFile {
    path: PathBuf,
    len: u64,
}

impl SpooledFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Temp files backing one statement's stream arguments.
pub struct FileSupport {
    dir: Option<PathBuf>,
    files: Mutex<Vec<TempPath>>,
    closed: AtomicBool,
}

impl FileSupport {
    /// Spool into the system temp directory
    pub fn new() -> Self {
        Self {
            dir: None,
            files: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            files: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Drain `source` into a new temp file.
    pub async fn create_file<R>(&self, mut source: R) -> Result<SpooledFile>
    where
        R: AsyncRead + Unpin,
    {
        self.ensure_open()?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("dbcluster-").suffix(".spool");
        let named = match &self.dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let (file, temp_path) = named.into_parts();

        let mut file = File::from_std(file);
        let len = tokio::io::copy(&mut source, &mut file).await?;
        file.flush().await?;

        let spooled = SpooledFile {
            path: temp_path.to_path_buf(),
            len,
        };
        debug!(path = %spooled.path.display(), bytes = len, "spooled stream argument");

        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            // Closed while draining; the temp path deletes itself on drop
            return Err(DbError::Closed("file support".to_string()));
        }
        files.push(temp_path);
        Ok(spooled)
    }

    /// Fresh binary stream over the whole file
    pub async fn input_stream(&self, file: &SpooledFile) -> Result<File> {
        self.ensure_open()?;
        Ok(File::open(&file.path).await?)
    }

    /// Fresh buffered reader over the whole file
    pub async fn reader(&self, file: &SpooledFile) -> Result<BufReader<File>> {
        Ok(BufReader::new(self.input_stream(file).await?))
    }

    /// Number of files currently spooled
    pub fn file_count(&self) -> usize {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Delete every spooled file. Safe to call more than once.
    pub fn close(&self) {
        let files: Vec<TempPath> = {
            let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::SeqCst);
            files.drain(..).collect()
        };

        for file in files {
            let path = file.to_path_buf();
            match file.close() {
                Ok(()) => debug!(path = %path.display(), "deleted spool file"),
                Err(error) => {
                    debug!(path = %path.display(), %error, "failed to delete spool file")
                }
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::Closed("file support".to_string()));
        }
        Ok(())
    }
}

impl Default for FileSupport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FileSupport {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for FileSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSupport")
            .field("files", &self.file_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
