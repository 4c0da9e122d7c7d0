//! Frame/parse length-prefixed messages of the origin protocol (spec.md
//! §4.1): one-byte kind + 4-byte big-endian length (length includes the
//! length bytes themselves) + payload. Startup and SSL-request packets
//! have no kind byte.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame length {0}")]
    BadLength(i32),
    #[error("connection closed mid-frame")]
    Truncated,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single kind-tagged message read off the wire. `payload` excludes the
/// kind byte and the 4-byte length.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: u8,
    pub payload: Bytes,
}

/// Reads one tagged frame: kind byte, then 4-byte length (inclusive of
/// itself), then `length - 4` payload bytes.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, WireError> {
    let kind = r.read_u8().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Truncated
        } else {
            WireError::Io(e)
        }
    })?;
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = BigEndian::read_i32(&len_buf);
    if len < 4 {
        return Err(WireError::BadLength(len));
    }
    let body_len = (len - 4) as usize;
    let mut body = vec![0u8; body_len];
    r.read_exact(&mut body).await?;
    Ok(Frame {
        kind,
        payload: Bytes::from(body),
    })
}

/// Writes one tagged frame, looping through partial writes (spec.md §4.1:
/// "partial I/O is resumed").
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: u8,
    payload: &[u8],
) -> Result<(), WireError> {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(kind);
    buf.put_i32((payload.len() + 4) as i32);
    buf.put_slice(payload);
    w.write_all(&buf).await?;
    Ok(())
}

/// Startup-family packets (`StartupMessage`, `SSLRequest`) carry no kind
/// byte: just a 4-byte length followed by the body.
pub async fn write_untagged<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<(), WireError> {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_i32((payload.len() + 4) as i32);
    buf.put_slice(payload);
    w.write_all(&buf).await?;
    Ok(())
}

pub async fn read_untagged<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes, WireError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = BigEndian::read_i32(&len_buf);
    if len < 4 {
        return Err(WireError::BadLength(len));
    }
    let mut body = vec![0u8; (len - 4) as usize];
    r.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

/// Parses (kind, length) out of a byte slice without consuming it; used by
/// the stream-buffer dispatcher (C3), which must peek the header before it
/// commits to reading a whole frame.
pub fn peek_header(buf: &[u8]) -> Option<(u8, usize)> {
    if buf.len() < 5 {
        return None;
    }
    let kind = buf[0];
    let len = BigEndian::read_i32(&buf[1..5]);
    if len < 4 {
        return None;
    }
    Some((kind, len as usize + 1))
}

pub trait PutCString {
    fn put_cstring(&mut self, s: &str);
}

impl PutCString for BytesMut {
    fn put_cstring(&mut self, s: &str) {
        self.put_slice(s.as_bytes());
        self.put_u8(0);
    }
}

/// Reads a NUL-terminated string out of a cursor-style buffer, advancing
/// past the terminator.
pub fn get_cstring(buf: &mut Bytes) -> Result<String, WireError> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::Truncated)?;
    let s = String::from_utf8_lossy(&buf[..pos]).into_owned();
    buf.advance(pos + 1);
    Ok(s)
}
