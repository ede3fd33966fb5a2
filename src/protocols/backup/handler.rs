//! Backup protocol connection handler.
//!
//! Reads one request at a time, runs it against the storage backend and
//! writes exactly one response before reading the next request. Storage and
//! protocol failures become error responses; transport failures end the
//! connection.

use super::parser::{read_request, skip_payload, FrameError, Request, RequestHeader};
use super::response::{ResponseWriter, Status};
use crate::storage::{Removal, Storage, StorageError, StoreError, StoredFile};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, trace, warn};

/// Handle a single client connection
pub async fn handle_connection<S>(
    stream: S,
    storage: Arc<Storage>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut handler = BackupHandler::new(BufReader::new(reader), writer, storage);
    handler.run().await?;
    Ok(())
}

/// Per-connection handler state
struct BackupHandler<R, W> {
    reader: R,
    responses: ResponseWriter<W>,
    storage: Arc<Storage>,
    /// User id from the most recent request header
    user_id: u32,
}

impl<R, W> BackupHandler<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn new(reader: R, writer: W, storage: Arc<Storage>) -> Self {
        let chunk_size = storage.chunk_size();
        BackupHandler {
            reader,
            responses: ResponseWriter::new(writer, chunk_size),
            storage,
            user_id: 0,
        }
    }

    /// Serve requests until the peer closes the connection.
    async fn run(&mut self) -> Result<(), FrameError> {
        while let Some((header, request)) = read_request(&mut self.reader).await? {
            self.dispatch(header, request).await?;
        }
        trace!(user_id = self.user_id, "Connection closed by client");
        Ok(())
    }

    async fn dispatch(&mut self, header: RequestHeader, request: Request) -> Result<(), FrameError> {
        self.user_id = header.user_id;
        debug!(
            user_id = header.user_id,
            version = header.version,
            op = header.op,
            "Received request"
        );

        match request {
            Request::Backup { name, payload_len } => self.handle_backup(name, payload_len).await,
            Request::Restore { name } => self.handle_restore(name).await,
            Request::Delete { name } => self.handle_delete(name).await,
            Request::List => self.handle_list().await,
            Request::Unknown(op) => {
                warn!(user_id = self.user_id, op, "Unknown operation code");
                self.responses.full(Status::ErrorGeneral, b"").await
            }
        }
    }

    async fn handle_backup(&mut self, name: Bytes, payload_len: u32) -> Result<(), FrameError> {
        debug!(
            user_id = self.user_id,
            name = %String::from_utf8_lossy(&name),
            payload_len,
            "Handling backup"
        );

        match self
            .storage
            .store(self.user_id, &name, payload_len, &mut self.reader)
            .await
        {
            Ok(()) => self.responses.full(Status::GeneralSuccess, &name).await,
            Err(StoreError::Transport(e)) => Err(FrameError::Io(e)),
            Err(StoreError::Storage { error, unread }) => {
                warn!(
                    user_id = self.user_id,
                    name = %String::from_utf8_lossy(&name),
                    error = %error,
                    unread,
                    "Backup failed"
                );
                skip_payload(&mut self.reader, unread).await?;
                self.responses.full(Status::ErrorGeneral, &name).await
            }
        }
    }

    async fn handle_restore(&mut self, name: Bytes) -> Result<(), FrameError> {
        match self.storage.retrieve(self.user_id, &name).await {
            Ok(StoredFile { len, mut file }) => {
                debug!(
                    user_id = self.user_id,
                    name = %String::from_utf8_lossy(&name),
                    len,
                    "Restoring file"
                );
                self.responses
                    .stream(Status::RestoreSuccess, &name, len, &mut file)
                    .await
            }
            Err(StorageError::NotFound) => {
                debug!(
                    user_id = self.user_id,
                    name = %String::from_utf8_lossy(&name),
                    "File not found for restore"
                );
                self.responses.full(Status::ErrorNoFile, &name).await
            }
            Err(e) => {
                warn!(user_id = self.user_id, error = %e, "Restore failed");
                self.responses.full(Status::ErrorGeneral, &name).await
            }
        }
    }

    async fn handle_delete(&mut self, name: Bytes) -> Result<(), FrameError> {
        match self.storage.remove(self.user_id, &name).await {
            Ok(removal) => {
                if removal == Removal::Absent {
                    debug!(
                        user_id = self.user_id,
                        name = %String::from_utf8_lossy(&name),
                        "File not found for deletion"
                    );
                }
                self.responses.full(Status::GeneralSuccess, &name).await
            }
            Err(e) => {
                warn!(user_id = self.user_id, error = %e, "Delete failed");
                self.responses.full(Status::ErrorGeneral, &name).await
            }
        }
    }

    async fn handle_list(&mut self) -> Result<(), FrameError> {
        let content = match self.storage.list(self.user_id).await {
            Ok(content) => content,
            Err(StorageError::NoFilesForUser) => {
                return self.responses.simple(Status::ErrorNoFilesForClient).await
            }
            Err(e) => {
                warn!(user_id = self.user_id, error = %e, "List failed");
                return self.responses.full(Status::ErrorGeneral, b"").await;
            }
        };

        let len = match u32::try_from(content.len()) {
            Ok(len) => len,
            Err(_) => {
                warn!(user_id = self.user_id, len = content.len(), "File list too large");
                return self.responses.full(Status::ErrorGeneral, b"").await;
            }
        };

        debug!(user_id = self.user_id, len, "Sending file list");
        self.responses
            .stream(Status::ListSuccess, b"", len, &mut &content[..])
            .await
    }
}
