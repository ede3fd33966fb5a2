//! Filesystem storage for backed-up files.
//!
//! Every user id owns one directory under the base directory and every
//! backed-up name is one regular file inside it:
//!
//! ```text
//! <base_dir>/<user_id>/<name>
//! ```
//!
//! Provides:
//! - Filename validation that keeps every resolved path inside the user's directory
//! - Chunked payload copies from the connection straight to disk
//! - Staged writes renamed into place so readers never see a partial file
//! - Optional per-path locking for store and delete

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, trace, warn};

/// Longest filename accepted, matching common filesystem limits.
pub const MAX_NAME_LENGTH: usize = 255;

/// Directory under the base directory that holds in-flight uploads.
const STAGING_DIR: &str = ".staging";

/// Tunables for [`Storage`].
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Bytes moved per read/write while copying a payload
    pub chunk_size: usize,
    /// Write to a staging file and rename into place
    pub atomic_store: bool,
    /// Serialize store/delete on the same path
    pub serialize_writes: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            atomic_store: true,
            serialize_writes: false,
        }
    }
}

/// Errors surfaced by storage operations
#[derive(Debug)]
pub enum StorageError {
    /// Filename would escape the user's directory or is otherwise unusable
    InvalidName(String),
    /// Target file does not exist or is not a regular file
    NotFound,
    /// The user's directory holds no files
    NoFilesForUser,
    /// File is too large to describe with a 32-bit length
    TooLarge(u64),
    /// Underlying filesystem failure
    Io(io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::InvalidName(reason) => write!(f, "Invalid filename: {}", reason),
            StorageError::NotFound => write!(f, "File not found"),
            StorageError::NoFilesForUser => write!(f, "No files stored for user"),
            StorageError::TooLarge(len) => write!(f, "File too large: {} bytes", len),
            StorageError::Io(e) => write!(f, "Storage I/O error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound
        } else {
            StorageError::Io(e)
        }
    }
}

/// Failure of a store operation.
///
/// The two cases differ in what is left on the connection: a transport
/// failure means the payload can no longer be read, a storage failure leaves
/// `unread` payload bytes that the caller must drain to stay framed.
#[derive(Debug)]
pub enum StoreError {
    /// Reading the payload from the connection failed
    Transport(io::Error),
    /// The payload could not be persisted
    Storage { error: StorageError, unread: u64 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Transport(e) => write!(f, "Payload read failed: {}", e),
            StoreError::Storage { error, unread } => {
                write!(f, "{} ({} payload bytes unread)", error, unread)
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Result of a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The file existed and was removed
    Deleted,
    /// There was nothing to remove
    Absent,
}

/// A file opened for restore.
#[derive(Debug)]
pub struct StoredFile {
    /// Size at the time of opening
    pub len: u32,
    pub file: File,
}

/// Per-user file storage rooted at a base directory
pub struct Storage {
    base_dir: PathBuf,
    staging_dir: PathBuf,
    options: StorageOptions,
    locks: Option<PathLocks>,
}

impl Storage {
    /// Create a storage instance, creating the base and staging directories.
    pub fn new(base_dir: impl Into<PathBuf>, options: StorageOptions) -> io::Result<Arc<Self>> {
        let base_dir = base_dir.into();
        let staging_dir = base_dir.join(STAGING_DIR);
        std::fs::create_dir_all(&staging_dir)?;

        info!(
            base_dir = %base_dir.display(),
            chunk_size = options.chunk_size,
            atomic_store = options.atomic_store,
            serialize_writes = options.serialize_writes,
            "Initializing storage"
        );

        let locks = options.serialize_writes.then(PathLocks::default);
        Ok(Arc::new(Self {
            base_dir,
            staging_dir,
            options,
            locks,
        }))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn chunk_size(&self) -> usize {
        self.options.chunk_size.max(1)
    }

    /// Directory holding every file of `user_id`
    pub fn user_dir(&self, user_id: u32) -> PathBuf {
        self.base_dir.join(user_id.to_string())
    }

    /// Map `(user_id, name)` to a path inside the user's directory.
    ///
    /// Fails closed: the joined path must have the user directory as its
    /// direct parent.
    pub fn resolve(&self, user_id: u32, name: &[u8]) -> Result<PathBuf, StorageError> {
        let name = validate_name(name)?;
        let user_dir = self.user_dir(user_id);
        let path = user_dir.join(name);

        if path.parent() != Some(user_dir.as_path()) || path.file_name().is_none() {
            return Err(StorageError::InvalidName(format!(
                "'{}' does not resolve inside the user directory",
                name
            )));
        }
        Ok(path)
    }

    /// Copy exactly `length` bytes from `body` into `(user_id, name)`.
    ///
    /// The payload is moved in chunks of the configured size. On any failure
    /// the partial file is removed before returning.
    pub async fn store<R>(
        &self,
        user_id: u32,
        name: &[u8],
        length: u32,
        body: &mut R,
    ) -> Result<(), StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let length = u64::from(length);
        let path = self
            .resolve(user_id, name)
            .map_err(|error| StoreError::Storage {
                error,
                unread: length,
            })?;

        if let Err(e) = tokio::fs::create_dir_all(self.user_dir(user_id)).await {
            return Err(StoreError::Storage {
                error: StorageError::Io(e),
                unread: length,
            });
        }

        let _guard = self.lock(&path).await;

        let mut partial = match self.open_partial(&path).await {
            Ok(partial) => partial,
            Err(e) => {
                return Err(StoreError::Storage {
                    error: StorageError::Io(e),
                    unread: length,
                })
            }
        };

        let mut buf = vec![0u8; self.chunk_size().min(length as usize).max(1)];
        let mut remaining = length;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            if let Err(e) = body.read_exact(&mut buf[..want]).await {
                warn!(user_id, path = %path.display(), remaining, "Payload read failed, discarding partial file");
                partial.discard().await;
                return Err(StoreError::Transport(e));
            }
            remaining -= want as u64;

            if let Err(e) = partial.file.write_all(&buf[..want]).await {
                warn!(user_id, path = %path.display(), error = %e, "Write failed, discarding partial file");
                partial.discard().await;
                return Err(StoreError::Storage {
                    error: StorageError::Io(e),
                    unread: remaining,
                });
            }
        }

        if let Err(e) = partial.commit().await {
            return Err(StoreError::Storage {
                error: StorageError::Io(e),
                unread: 0,
            });
        }

        debug!(user_id, path = %path.display(), bytes = length, "Stored file");
        Ok(())
    }

    /// Open a stored file for reading.
    pub async fn retrieve(&self, user_id: u32, name: &[u8]) -> Result<StoredFile, StorageError> {
        let path = self.resolve(user_id, name)?;
        let file = File::open(&path).await?;
        let metadata = file.metadata().await?;

        if !metadata.is_file() {
            return Err(StorageError::NotFound);
        }
        let len = u32::try_from(metadata.len()).map_err(|_| StorageError::TooLarge(metadata.len()))?;

        trace!(user_id, path = %path.display(), len, "Opened file for restore");
        Ok(StoredFile { len, file })
    }

    /// Delete a stored file. Deleting a missing file is not an error.
    pub async fn remove(&self, user_id: u32, name: &[u8]) -> Result<Removal, StorageError> {
        let path = self.resolve(user_id, name)?;
        let _guard = self.lock(&path).await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(user_id, path = %path.display(), "Deleted file");
                Ok(Removal::Deleted)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Removal::Absent),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Names of the regular files directly under the user's directory, sorted.
    pub async fn list_names(&self, user_id: u32) -> Result<Vec<String>, StorageError> {
        let mut entries = match tokio::fs::read_dir(self.user_dir(user_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NoFilesForUser)
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(StorageError::Io)? {
            if entry.file_type().await.map_err(StorageError::Io)?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        if names.is_empty() {
            return Err(StorageError::NoFilesForUser);
        }
        names.sort();
        Ok(names)
    }

    /// The listing sent to clients: each name followed by `\n`.
    pub async fn list(&self, user_id: u32) -> Result<Bytes, StorageError> {
        let names = self.list_names(user_id).await?;
        let mut content = BytesMut::with_capacity(names.iter().map(|n| n.len() + 1).sum());
        for name in &names {
            content.put_slice(name.as_bytes());
            content.put_u8(b'\n');
        }
        Ok(content.freeze())
    }

    async fn lock(&self, path: &Path) -> Option<PathGuard<'_>> {
        match &self.locks {
            Some(locks) => Some(locks.lock(path).await),
            None => None,
        }
    }

    async fn open_partial(&self, target: &Path) -> io::Result<PartialFile> {
        if self.options.atomic_store {
            let mut builder = tempfile::Builder::new();
            builder.prefix("upload-");
            // Same creation mode as File::create, so the umask decides either way
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                builder.permissions(std::fs::Permissions::from_mode(0o666));
            }
            let (file, staged) = builder.tempfile_in(&self.staging_dir)?.into_parts();
            Ok(PartialFile {
                file: File::from_std(file),
                staged: Some(staged),
                target: target.to_path_buf(),
            })
        } else {
            Ok(PartialFile {
                file: File::create(target).await?,
                staged: None,
                target: target.to_path_buf(),
            })
        }
    }
}

/// A file being written by a store operation.
struct PartialFile {
    file: File,
    /// Staging path when writing atomically; removed when dropped
    staged: Option<TempPath>,
    target: PathBuf,
}

impl PartialFile {
    /// Flush everything to disk and make the file visible under its name.
    async fn commit(mut self) -> io::Result<()> {
        let written = match self.file.flush().await {
            Ok(()) => self.file.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.discard().await;
            return Err(e);
        }

        let PartialFile {
            file,
            staged,
            target,
        } = self;
        drop(file);

        if let Some(staged) = staged {
            tokio::task::spawn_blocking(move || staged.persist(&target))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                .map_err(|e| e.error)?;
        }
        Ok(())
    }

    /// Remove whatever was written so far.
    async fn discard(self) {
        let PartialFile {
            file,
            staged,
            target,
        } = self;
        drop(file);

        match staged {
            // Dropping the staged path unlinks it
            Some(staged) => drop(staged),
            None => {
                if let Err(e) = tokio::fs::remove_file(&target).await {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(path = %target.display(), error = %e, "Failed to remove partial file");
                    }
                }
            }
        }
    }
}

/// Async mutexes keyed by resolved path, dropped once nobody holds or waits on them.
#[derive(Default)]
struct PathLocks {
    inner: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    async fn lock(&self, path: &Path) -> PathGuard<'_> {
        let entry = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(path.to_path_buf()).or_default())
        };
        let guard = entry.lock_owned().await;
        PathGuard {
            locks: self,
            path: path.to_path_buf(),
            guard: Some(guard),
        }
    }
}

struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map
            .get(&self.path)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            map.remove(&self.path);
        }
    }
}

/// Check that `name` is a single plain path component.
pub fn validate_name(name: &[u8]) -> Result<&str, StorageError> {
    let name = std::str::from_utf8(name)
        .map_err(|_| StorageError::InvalidName("not valid UTF-8".to_string()))?;

    if name.is_empty() {
        return Err(StorageError::InvalidName("empty".to_string()));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(StorageError::InvalidName(format!(
            "longer than {} bytes",
            MAX_NAME_LENGTH
        )));
    }
    if name == "." || name == ".." {
        return Err(StorageError::InvalidName(format!("'{}' is reserved", name)));
    }
    if let Some(c) = name.chars().find(|c| matches!(c, '/' | '\\' | ':' | '\0')) {
        return Err(StorageError::InvalidName(format!(
            "contains forbidden character {:?}",
            c
        )));
    }
    Ok(name)
}
