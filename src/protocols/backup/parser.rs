//! Backup protocol request codec.
//!
//! All multi-byte integers are little-endian. Variable-length fields are
//! always preceded by their exact byte count; nothing is delimited.
//!
//! ```text
//! header:   user_id:u32 version:u8 op:u8
//! BACKUP:   name_len:u16 name payload_len:u32 payload
//! RESTORE:  name_len:u16 name
//! DELETE:   name_len:u16 name
//! LIST:     (no body)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Size of the fixed request header
pub const REQUEST_HEADER_LEN: usize = 6;

/// Operation codes carried in the request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Backup = 100,
    Restore = 200,
    DeleteFile = 201,
    ListFiles = 202,
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(op: u8) -> Result<Self, Self::Error> {
        match op {
            100 => Ok(OpCode::Backup),
            200 => Ok(OpCode::Restore),
            201 => Ok(OpCode::DeleteFile),
            202 => Ok(OpCode::ListFiles),
            other => Err(other),
        }
    }
}

/// Fixed request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub user_id: u32,
    /// Carried but never checked against the server version
    pub version: u8,
    pub op: u8,
}

impl RequestHeader {
    pub fn decode(bytes: &[u8; REQUEST_HEADER_LEN]) -> Self {
        let mut bytes = &bytes[..];
        RequestHeader {
            user_id: bytes.get_u32_le(),
            version: bytes.get_u8(),
            op: bytes.get_u8(),
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.user_id);
        buf.put_u8(self.version);
        buf.put_u8(self.op);
    }
}

/// A decoded request.
///
/// For `Backup` only the payload length has been read; the payload itself is
/// still on the wire and belongs to whoever handles the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Backup { name: Bytes, payload_len: u32 },
    Restore { name: Bytes },
    Delete { name: Bytes },
    List,
    /// Unrecognized op code; no body was consumed
    Unknown(u8),
}

impl Request {
    pub fn op(&self) -> u8 {
        match self {
            Request::Backup { .. } => OpCode::Backup as u8,
            Request::Restore { .. } => OpCode::Restore as u8,
            Request::Delete { .. } => OpCode::DeleteFile as u8,
            Request::List => OpCode::ListFiles as u8,
            Request::Unknown(op) => *op,
        }
    }

    /// Encode header and body. A `Backup` payload is not included and must
    /// follow on the wire.
    pub fn encode_into(&self, user_id: u32, version: u8, buf: &mut BytesMut) -> Result<(), FrameError> {
        RequestHeader {
            user_id,
            version,
            op: self.op(),
        }
        .encode_into(buf);

        match self {
            Request::Backup { name, payload_len } => {
                put_name(buf, name)?;
                buf.put_u32_le(*payload_len);
            }
            Request::Restore { name } | Request::Delete { name } => put_name(buf, name)?,
            Request::List | Request::Unknown(_) => {}
        }
        Ok(())
    }
}

/// Codec failures
#[derive(Debug)]
pub enum FrameError {
    /// The transport failed or closed mid-frame
    Io(io::Error),
    /// A stream source ran dry before the declared length was sent
    ShortContent { declared: u32, sent: u64 },
    /// A field does not fit its length prefix
    FieldTooLong { field: &'static str, len: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "Transport error: {}", e),
            FrameError::ShortContent { declared, sent } => {
                write!(f, "Content truncated: declared {} bytes, sent {}", declared, sent)
            }
            FrameError::FieldTooLong { field, len } => {
                write!(f, "Field '{}' too long: {} bytes", field, len)
            }
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Read a request header.
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// any byte of a new header. EOF after a partial header is an error.
pub async fn read_header<R>(reader: &mut R) -> Result<Option<RequestHeader>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; REQUEST_HEADER_LEN];
    let mut filled = 0;

    while filled < REQUEST_HEADER_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed after {} header bytes", filled),
            )));
        }
        filled += n;
    }

    trace!(bytes = %hex::encode(buf), "< header");
    Ok(Some(RequestHeader::decode(&buf)))
}

/// Read a `name_len:u16` prefixed filename.
pub async fn read_name<R>(reader: &mut R) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16_le().await?;
    let mut name = vec![0u8; usize::from(len)];
    reader.read_exact(&mut name).await?;

    trace!(len, name = %hex::encode(&name), "< name");
    Ok(Bytes::from(name))
}

/// Read one full request up to, but not including, any BACKUP payload.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<(RequestHeader, Request)>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let header = match read_header(reader).await? {
        Some(header) => header,
        None => return Ok(None),
    };

    let request = match OpCode::try_from(header.op) {
        Ok(OpCode::Backup) => {
            let name = read_name(reader).await?;
            let payload_len = reader.read_u32_le().await?;
            trace!(payload_len, "< payload length");
            Request::Backup { name, payload_len }
        }
        Ok(OpCode::Restore) => Request::Restore {
            name: read_name(reader).await?,
        },
        Ok(OpCode::DeleteFile) => Request::Delete {
            name: read_name(reader).await?,
        },
        Ok(OpCode::ListFiles) => Request::List,
        Err(op) => Request::Unknown(op),
    };

    Ok(Some((header, request)))
}

/// Consume and discard `len` payload bytes so the stream stays framed.
pub async fn skip_payload<R>(reader: &mut R, len: u64) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    let skipped = tokio::io::copy(&mut reader.take(len), &mut tokio::io::sink()).await?;
    if skipped < len {
        return Err(FrameError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("connection closed with {} payload bytes unread", len - skipped),
        )));
    }
    Ok(())
}

/// Write a `u16` length prefix followed by the name bytes.
pub fn put_name(buf: &mut BytesMut, name: &[u8]) -> Result<(), FrameError> {
    let len = u16::try_from(name.len()).map_err(|_| FrameError::FieldTooLong {
        field: "name",
        len: name.len(),
    })?;
    buf.put_u16_le(len);
    buf.put_slice(name);
    Ok(())
}
