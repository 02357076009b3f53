//! Client side of the protocol: authenticate, upload, collect outputs.

use rmake_proto::{Authenticate, CodecError, HashType, MakeRequest, MsgKind};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::Result;
use crate::auth::hash_password;
use crate::config::DEFAULT_MAX_FILE_LEN;
use crate::error::Error;

/// Progress reported while a make runs.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MakeEvent {
    /// Daemon status text, usually the command about to run.
    Status(String),
    /// A chunk of a command's stdout.
    Stdout(Vec<u8>),
    /// A chunk of a command's stderr.
    Stderr(Vec<u8>),
}

/// An output file sent back by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Output {
    /// Name relative to the daemon's working directory.
    pub name: String,
    /// File contents.
    pub data: Vec<u8>,
}

impl Output {
    /// Creates an output record.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Result of a completed make.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct MakeResult {
    /// Name of the recipe the daemon selected.
    pub recipe: String,
    /// Output files, in delivery order.
    pub outputs: Vec<Output>,
}

/// A connection to an rmake daemon.
#[derive(Debug)]
pub struct Client<R, W> {
    /// Read half of the connection.
    reader: R,
    /// Write half of the connection.
    writer: W,
    /// Cap on string and text fields from the daemon.
    max_length: usize,
    /// Cap on a single output file.
    max_file_len: u64,
}

impl Client<BufReader<OwnedReadHalf>, OwnedWriteHalf> {
    /// Connects to a daemon over TCP.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(BufReader::new(reader), writer))
    }
}

impl<R, W> Client<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps a reader/writer pair.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            max_length: rmake_proto::DEFAULT_MAX_LENGTH,
            max_file_len: DEFAULT_MAX_FILE_LEN,
        }
    }

    /// Sets the largest output file accepted from the daemon.
    #[must_use]
    pub const fn max_file_len(mut self, len: u64) -> Self {
        self.max_file_len = len;
        self
    }

    /// Authenticates with a SHA-256 hash of `password ‖ salt`.
    pub async fn authenticate(&mut self, username: &str, password: &str, salt: &str) -> Result<()> {
        let hash_type = HashType::Sha256;
        let hash = hash_password(hash_type, password, salt).unwrap_or_default();
        self.authenticate_with(hash_type.code(), username, hash).await
    }

    /// Sends a pre-computed credential hash.
    ///
    /// Fails with [`Error::Rejected`] carrying `AuthFailed` or `UnsupportedHash`.
    pub async fn authenticate_with(
        &mut self,
        hash_type: i16,
        username: &str,
        hash: Vec<u8>,
    ) -> Result<()> {
        let msg = Authenticate {
            hash_type,
            username: username.to_owned(),
            hash,
        };
        msg.write(&mut self.writer).await?;
        self.flush().await?;

        match self.read_reply().await? {
            MsgKind::Ok => Ok(()),
            kind => Err(Error::Rejected(kind)),
        }
    }

    /// Requests a make, uploads `files`, and collects the outputs.
    ///
    /// Status and console output are passed to `on_event` as they arrive.
    /// A request no recipe matches fails with
    /// `Error::Rejected(MsgKind::MakeRequestNoRecipe)`; the connection stays usable.
    pub async fn make(
        &mut self,
        request: &MakeRequest,
        files: &[(String, Vec<u8>)],
        mut on_event: impl FnMut(MakeEvent) + Send,
    ) -> Result<MakeResult> {
        request.write(&mut self.writer).await?;
        self.flush().await?;

        let recipe = match self.read_reply().await? {
            MsgKind::MakeRequestOk => rmake_proto::read_string(&mut self.reader, self.max_length).await?,
            kind => return Err(Error::Rejected(kind)),
        };

        for (name, data) in files {
            rmake_proto::write_kind(&mut self.writer, MsgKind::MakeSendFile).await?;
            rmake_proto::write_string(&mut self.writer, name).await?;
            rmake_proto::write_bytes(&mut self.writer, data).await?;
        }
        rmake_proto::write_kind(&mut self.writer, MsgKind::MakeSendFileEnd).await?;
        self.flush().await?;

        let mut outputs = Vec::new();
        loop {
            match self.read_reply().await? {
                MsgKind::Stdmsg => {
                    let text = rmake_proto::read_bytes(&mut self.reader, self.max_length).await?;
                    on_event(MakeEvent::Status(String::from_utf8_lossy(&text).into_owned()));
                }
                MsgKind::Stdout => {
                    let data = rmake_proto::read_bytes(&mut self.reader, self.max_length).await?;
                    on_event(MakeEvent::Stdout(data));
                }
                MsgKind::Stderr => {
                    let data = rmake_proto::read_bytes(&mut self.reader, self.max_length).await?;
                    on_event(MakeEvent::Stderr(data));
                }
                MsgKind::MakeOutput => {
                    let name = rmake_proto::read_string(&mut self.reader, self.max_length).await?;
                    let max = usize::try_from(self.max_file_len).unwrap_or(usize::MAX);
                    let data = rmake_proto::read_bytes(&mut self.reader, max).await?;
                    outputs.push(Output::new(name, data));
                }
                MsgKind::MakeOutputEnd => return Ok(MakeResult { recipe, outputs }),
                kind => return Err(Error::Rejected(kind)),
            }
        }
    }

    /// Says goodbye and closes the write side.
    pub async fn goodbye(mut self) -> Result<()> {
        rmake_proto::write_kind(&mut self.writer, MsgKind::Goodbye).await?;
        self.writer.shutdown().await.map_err(CodecError::from)?;
        Ok(())
    }

    /// Flushes buffered writes to the daemon.
    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await.map_err(CodecError::from)?;
        Ok(())
    }

    /// Reads the next kind, turning `ErrorMessage` and unknown codes into errors.
    async fn read_reply(&mut self) -> Result<MsgKind> {
        let code = rmake_proto::read_kind(&mut self.reader).await?;
        match MsgKind::from_code(code) {
            Some(MsgKind::ErrorMessage) => {
                let text = rmake_proto::read_bytes(&mut self.reader, self.max_length).await?;
                Err(Error::Remote(String::from_utf8_lossy(&text).into_owned()))
            }
            Some(kind) => Ok(kind),
            None => Err(Error::InvalidMsg(code)),
        }
    }
}
