//! Endian-neutral field codec over any `AsyncRead`/`AsyncWrite` stream.
//!
//! Integers are fixed-width big-endian. Byte payloads are
//! `[i64 big-endian length][length bytes]`; a zero length has no body.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default cap on a single length-prefixed payload read from the peer.
pub const DEFAULT_MAX_LENGTH: usize = 4096;

/// Errors raised while reading or writing protocol fields.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The stream ended before the field was complete.
    #[error("unexpected end of stream")]
    UnexpectedEnd,

    /// A declared payload length exceeds the configured maximum.
    #[error("read string/bytes too long ({len}, max {max})")]
    TooLong {
        /// Length declared by the peer.
        len: i64,
        /// Configured maximum.
        max: usize,
    },

    /// A declared payload length is negative.
    #[error("negative payload length {0}")]
    NegativeLength(i64),

    /// A string payload is not valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,

    /// Any other transport error.
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::UnexpectedEnd
        } else {
            Self::Io(e)
        }
    }
}

/// Reads a big-endian `i16`.
pub async fn read_i16<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<i16, CodecError> {
    Ok(r.read_i16().await?)
}

/// Reads a big-endian `i32`.
pub async fn read_i32<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<i32, CodecError> {
    Ok(r.read_i32().await?)
}

/// Reads a big-endian `i64`.
pub async fn read_i64<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<i64, CodecError> {
    Ok(r.read_i64().await?)
}

/// Reads a length-prefixed byte payload of at most `max` bytes.
///
/// An oversized declaration fails after consuming only the 8-byte prefix.
pub async fn read_bytes<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
    max: usize,
) -> Result<Vec<u8>, CodecError> {
    let declared = read_i64(r).await?;
    let len = usize::try_from(declared).map_err(|_| CodecError::NegativeLength(declared))?;
    if len > max {
        return Err(CodecError::TooLong { len: declared, max });
    }
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reads a length-prefixed UTF-8 string of at most `max` bytes.
pub async fn read_string<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
    max: usize,
) -> Result<String, CodecError> {
    let buf = read_bytes(r, max).await?;
    String::from_utf8(buf).map_err(|_| CodecError::InvalidUtf8)
}

/// Writes a big-endian `i16`.
pub async fn write_i16<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    v: i16,
) -> Result<(), CodecError> {
    Ok(w.write_all(&v.to_be_bytes()).await?)
}

/// Writes a big-endian `i32`.
pub async fn write_i32<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    v: i32,
) -> Result<(), CodecError> {
    Ok(w.write_all(&v.to_be_bytes()).await?)
}

/// Writes a big-endian `i64`.
pub async fn write_i64<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    v: i64,
) -> Result<(), CodecError> {
    Ok(w.write_all(&v.to_be_bytes()).await?)
}

/// Writes `data` with its `i64` length prefix. Empty payloads write the prefix only.
pub async fn write_bytes<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    data: &[u8],
) -> Result<(), CodecError> {
    let len = i64::try_from(data.len())
        .map_err(|_| CodecError::Io(io::Error::other("payload exceeds i64::MAX")))?;
    write_i64(w, len).await?;
    if data.is_empty() {
        return Ok(());
    }
    Ok(w.write_all(data).await?)
}

/// Writes a string with its `i64` length prefix.
pub async fn write_string<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    s: &str,
) -> Result<(), CodecError> {
    write_bytes(w, s.as_bytes()).await
}
