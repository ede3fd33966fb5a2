//! Backup protocol responses.
//!
//! Every response starts with `version:u8 status:u16` (little-endian) and
//! takes one of three shapes depending on the status:
//!
//! ```text
//! simple:  version status
//! full:    version status name_len:u16 name
//! stream:  version status name_len:u16 name content_len:u32 content
//! ```

use super::parser::{put_name, read_name, FrameError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Protocol version written into every response
pub const SERVER_VERSION: u8 = 1;

/// Size of the fixed response header
pub const RESPONSE_HEADER_LEN: usize = 3;

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    RestoreSuccess = 210,
    ListSuccess = 211,
    GeneralSuccess = 212,
    ErrorNoFile = 1001,
    ErrorNoFilesForClient = 1002,
    ErrorGeneral = 1003,
}

/// Body layout that follows the response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Simple,
    Full,
    Stream,
}

impl Status {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn shape(self) -> Shape {
        match self {
            Status::RestoreSuccess | Status::ListSuccess => Shape::Stream,
            Status::GeneralSuccess | Status::ErrorNoFile | Status::ErrorGeneral => Shape::Full,
            Status::ErrorNoFilesForClient => Shape::Simple,
        }
    }
}

impl TryFrom<u16> for Status {
    type Error = u16;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            210 => Ok(Status::RestoreSuccess),
            211 => Ok(Status::ListSuccess),
            212 => Ok(Status::GeneralSuccess),
            1001 => Ok(Status::ErrorNoFile),
            1002 => Ok(Status::ErrorNoFilesForClient),
            1003 => Ok(Status::ErrorGeneral),
            other => Err(other),
        }
    }
}

/// Fixed response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: u8,
    pub status: u16,
}

impl ResponseHeader {
    pub fn new(status: Status) -> Self {
        ResponseHeader {
            version: SERVER_VERSION,
            status: status.code(),
        }
    }

    pub fn decode(bytes: &[u8; RESPONSE_HEADER_LEN]) -> Self {
        let mut bytes = &bytes[..];
        ResponseHeader {
            version: bytes.get_u8(),
            status: bytes.get_u16_le(),
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u16_le(self.status);
    }
}

/// Writes response frames to the connection.
pub struct ResponseWriter<W> {
    writer: W,
    chunk_size: usize,
}

impl<W> ResponseWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W, chunk_size: usize) -> Self {
        ResponseWriter {
            writer,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Header only.
    pub async fn simple(&mut self, status: Status) -> Result<(), FrameError> {
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN);
        ResponseHeader::new(status).encode_into(&mut buf);
        self.send(&buf).await
    }

    /// Header plus the echoed filename.
    pub async fn full(&mut self, status: Status, name: &[u8]) -> Result<(), FrameError> {
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN + 2 + name.len());
        ResponseHeader::new(status).encode_into(&mut buf);
        put_name(&mut buf, name)?;
        self.send(&buf).await
    }

    /// Header, filename and `content_len` bytes copied from `source` in chunks.
    ///
    /// If `source` runs dry early the frame is left truncated on the wire and
    /// `ShortContent` is returned; the connection cannot be reused after that.
    pub async fn stream<R>(
        &mut self,
        status: Status,
        name: &[u8],
        content_len: u32,
        source: &mut R,
    ) -> Result<(), FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN + 2 + name.len() + 4);
        ResponseHeader::new(status).encode_into(&mut buf);
        put_name(&mut buf, name)?;
        buf.put_u32_le(content_len);
        trace!(bytes = %hex::encode(&buf), "> stream prefix");
        self.writer.write_all(&buf).await?;

        let declared = u64::from(content_len);
        let mut chunk = vec![0u8; self.chunk_size.min(content_len as usize).max(1)];
        let mut sent = 0u64;
        while sent < declared {
            let want = (declared - sent).min(chunk.len() as u64) as usize;
            let n = source.read(&mut chunk[..want]).await?;
            if n == 0 {
                self.writer.flush().await?;
                return Err(FrameError::ShortContent {
                    declared: content_len,
                    sent,
                });
            }
            self.writer.write_all(&chunk[..n]).await?;
            sent += n as u64;
        }

        self.writer.flush().await?;
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), FrameError> {
        trace!(bytes = %hex::encode(frame), "> response");
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// A response read back off the wire, content buffered in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: ResponseHeader,
    pub name: Option<Bytes>,
    pub content: Option<Bytes>,
}

impl Response {
    pub fn status(&self) -> Option<Status> {
        Status::try_from(self.header.status).ok()
    }
}

/// Read one response frame. A content section shorter than its declared
/// length is a transport error, never a short file.
pub async fn read_response<R>(reader: &mut R) -> Result<Response, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; RESPONSE_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let header = ResponseHeader::decode(&header);

    let status = Status::try_from(header.status).map_err(|code| {
        FrameError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown status code {}", code),
        ))
    })?;

    let mut response = Response {
        header,
        name: None,
        content: None,
    };
    if status.shape() == Shape::Simple {
        return Ok(response);
    }

    response.name = Some(read_name(reader).await?);
    if status.shape() == Shape::Stream {
        let len = reader.read_u32_le().await?;
        let mut content = vec![0u8; len as usize];
        reader.read_exact(&mut content).await?;
        response.content = Some(Bytes::from(content));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> ResponseWriter<Vec<u8>> {
        ResponseWriter::new(Vec::new(), 4)
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::RestoreSuccess.code(), 210);
        assert_eq!(Status::ErrorGeneral.code(), 1003);
        assert_eq!(Status::try_from(1002), Ok(Status::ErrorNoFilesForClient));
        assert_eq!(Status::try_from(500), Err(500));
        assert_eq!(Status::ErrorNoFilesForClient.shape(), Shape::Simple);
        assert_eq!(Status::ErrorGeneral.shape(), Shape::Full);
        assert_eq!(Status::ListSuccess.shape(), Shape::Stream);
    }

    #[tokio::test]
    async fn test_simple_response() {
        let mut w = writer();
        w.simple(Status::ErrorNoFilesForClient).await.unwrap();
        assert_eq!(w.writer, [1, 0xea, 0x03]);
    }

    #[tokio::test]
    async fn test_full_response() {
        let mut w = writer();
        w.full(Status::GeneralSuccess, b"a.txt").await.unwrap();
        assert_eq!(w.writer, [1, 212, 0, 5, 0, b'a', b'.', b't', b'x', b't']);
    }

    #[tokio::test]
    async fn test_stream_response_in_chunks() {
        let mut w = writer();
        let mut source: &[u8] = b"hello world";
        w.stream(Status::RestoreSuccess, b"f", 11, &mut source)
            .await
            .unwrap();

        let mut expected = vec![1, 210, 0, 1, 0, b'f', 11, 0, 0, 0];
        expected.extend_from_slice(b"hello world");
        assert_eq!(w.writer, expected);

        let response = read_response(&mut &w.writer[..]).await.unwrap();
        assert_eq!(response.status(), Some(Status::RestoreSuccess));
        assert_eq!(response.name.as_deref(), Some(&b"f"[..]));
        assert_eq!(response.content.as_deref(), Some(&b"hello world"[..]));
    }

    #[tokio::test]
    async fn test_stream_never_sends_past_declared_length() {
        let mut w = writer();
        let mut source: &[u8] = b"abcdefgh";
        w.stream(Status::ListSuccess, b"", 5, &mut source)
            .await
            .unwrap();
        assert!(w.writer.ends_with(b"\x05\x00\x00\x00abcde"));
    }

    #[tokio::test]
    async fn test_short_source_truncates() {
        let mut w = writer();
        let mut source: &[u8] = b"abc";
        let result = w.stream(Status::RestoreSuccess, b"f", 10, &mut source).await;

        match result {
            Err(FrameError::ShortContent { declared, sent }) => {
                assert_eq!(declared, 10);
                assert_eq!(sent, 3);
            }
            other => panic!("unexpected: {:?}", other),
        }

        // The receiver sees a short content section and fails
        assert!(matches!(
            read_response(&mut &w.writer[..]).await,
            Err(FrameError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_read_simple_has_no_body() {
        let wire = [1u8, 0xea, 0x03, 0xff];
        let mut reader = &wire[..];
        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.status(), Some(Status::ErrorNoFilesForClient));
        assert!(response.name.is_none());
        assert_eq!(reader, &[0xff]);
    }
}
