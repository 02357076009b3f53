//! Per-connection session state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rmake_proto::{CodecError, DEFAULT_MAX_LENGTH, MsgKind};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::Result;
use crate::config::DEFAULT_MAX_FILE_LEN;
use crate::recipe::Recipe;

/// Limits and locations applied to every connection.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnOptions {
    /// Maximum length of a string or byte field read from the peer.
    pub max_length: usize,
    /// Maximum size of one uploaded file.
    pub max_file_len: u64,
    /// Parent directory for per-request working directories.
    pub scratch_root: PathBuf,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            max_file_len: DEFAULT_MAX_FILE_LEN,
            scratch_root: std::env::temp_dir(),
        }
    }
}

impl ConnOptions {
    /// Uses `root` as the parent of per-request working directories.
    #[must_use]
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }
}

/// One accepted make request.
///
/// Its fields are what command templates are rendered against.
#[derive(Debug, Clone)]
pub struct Request {
    /// The matched recipe.
    pub recipe: Option<Arc<Recipe>>,
    /// The recipe type named by the client, possibly empty.
    pub recipe_type: String,
    /// The first uploaded file name.
    pub filename: String,
    /// Client-supplied options.
    pub options: BTreeMap<String, String>,
    /// Working directory while a make is running.
    pub(crate) scratch_dir: Option<PathBuf>,
}

impl Request {
    /// Creates a request bound to `recipe`.
    pub fn new(
        recipe: Arc<Recipe>,
        recipe_type: impl Into<String>,
        filename: impl Into<String>,
        options: BTreeMap<String, String>,
    ) -> Self {
        Self {
            recipe: Some(recipe),
            recipe_type: recipe_type.into(),
            filename: filename.into(),
            options,
            scratch_dir: None,
        }
    }

    /// Working directory of the running make, if any.
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch_dir.as_deref()
    }
}

/// An rmake connection: the byte stream plus its session state.
///
/// Reads are buffered; writes are not, and every logical message is
/// flushed before the connection waits for the peer.
#[derive(Debug)]
pub struct Conn<R, W> {
    /// Buffered read half.
    pub(crate) reader: R,
    /// Write half; flushed after every message.
    pub(crate) writer: W,
    /// Whether the peer has authenticated.
    pub authed: bool,
    /// Authenticated user name.
    pub user: String,
    /// The request in flight, if any.
    pub request: Option<Request>,
    /// Limits and scratch location.
    pub(crate) options: ConnOptions,
}

impl Conn<BufReader<OwnedReadHalf>, OwnedWriteHalf> {
    /// Wraps an accepted TCP stream.
    pub fn from_tcp(stream: TcpStream, options: ConnOptions) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(BufReader::new(reader), writer, options)
    }
}

impl<R, W> Conn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Creates an unauthenticated session over a reader/writer pair.
    pub fn new(reader: R, writer: W, options: ConnOptions) -> Self {
        Self {
            reader,
            writer,
            authed: false,
            user: String::new(),
            request: None,
            options,
        }
    }

    /// Connection options.
    pub const fn options(&self) -> &ConnOptions {
        &self.options
    }

    /// Reads the kind code of the next message.
    pub async fn read_kind(&mut self) -> Result<i16> {
        Ok(rmake_proto::read_kind(&mut self.reader).await?)
    }

    /// Sends a payload-less message.
    pub async fn send(&mut self, kind: MsgKind) -> Result<()> {
        Ok(send_control(&mut self.writer, kind).await?)
    }

    /// Sends a message carrying a single length-prefixed payload.
    pub async fn send_text(&mut self, kind: MsgKind, text: &[u8]) -> Result<()> {
        rmake_proto::write_text(&mut self.writer, kind, text).await?;
        self.writer.flush().await.map_err(CodecError::from)?;
        Ok(())
    }

    /// Flushes and shuts down the write side.
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Writes a payload-less message and flushes it.
pub(crate) async fn send_control<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    kind: MsgKind,
) -> std::result::Result<(), CodecError> {
    rmake_proto::write_kind(w, kind).await?;
    w.flush().await?;
    Ok(())
}
