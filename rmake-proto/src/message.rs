//! Message catalog: kind codes and the payload shapes they carry.

use std::collections::BTreeMap;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{self, CodecError};

/// Default TCP port for the rmake daemon.
pub const DEFAULT_PORT: u16 = 25386;

/// Message kind, sent as the leading `i16` of every message.
///
/// Codes are grouped into reserved bands (see [`Band`]) so new kinds can be
/// appended to a band without renumbering the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
#[non_exhaustive]
pub enum MsgKind {
    /// Success.
    Ok = 0,
    /// Unexpected message kind. The connection is closed right after.
    InvalidMsg = 1,
    /// Malformed parameters. The connection is closed right after.
    InvalidParam = 2,
    /// Wrong password or not authenticated. The connection is closed right after.
    AuthFailed = 3,
    /// The requested hash type is not supported; the peer may retry.
    UnsupportedHash = 4,
    /// `[string]` diagnostic. The connection is closed right after.
    ErrorMessage = 5,

    /// `[HashType i16][Username string][Hash bytes]`, client to server.
    ///
    /// The hash covers the password with the salt appended.
    Authenticate = 100,
    /// `[Type string][FilenameCount i32][Filename string]...`
    /// `[OptionCount i32][Key string][Value string]...`, client to server.
    MakeRequest = 101,
    /// `[RecipeType string]`, server to client.
    MakeRequestOk = 102,
    /// No recipe matched the request; the connection stays open.
    MakeRequestNoRecipe = 103,
    /// `[Name string][Data bytes]`, client to server.
    MakeSendFile = 104,
    /// Every file in the request has been sent.
    MakeSendFileEnd = 105,
    /// `[Name string][Data bytes]`, server to client.
    MakeOutput = 106,
    /// Every output file has been sent; the make is complete.
    MakeOutputEnd = 107,
    /// Either side may close after sending this.
    Goodbye = 108,

    /// `[string]` daemon status, usually the next command to run.
    Stdmsg = 200,
    /// `[string]` chunk of a command's stdout.
    Stdout = 201,
    /// `[string]` chunk of a command's stderr.
    Stderr = 202,
}

/// Reserved numeric band of a message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Band {
    /// 0..=99: result and error codes.
    Control,
    /// 100..=199: authentication and the make request lifecycle.
    Session,
    /// 200..=299: text messages, each followed by one length-prefixed payload.
    Informational,
}

impl Band {
    /// Classifies a raw code, or `None` outside every reserved band.
    pub const fn of(code: i16) -> Option<Self> {
        match code {
            0..=99 => Some(Self::Control),
            100..=199 => Some(Self::Session),
            200..=299 => Some(Self::Informational),
            _ => None,
        }
    }
}

impl MsgKind {
    /// Every kind, in code order.
    const ALL: [Self; 18] = [
        Self::Ok,
        Self::InvalidMsg,
        Self::InvalidParam,
        Self::AuthFailed,
        Self::UnsupportedHash,
        Self::ErrorMessage,
        Self::Authenticate,
        Self::MakeRequest,
        Self::MakeRequestOk,
        Self::MakeRequestNoRecipe,
        Self::MakeSendFile,
        Self::MakeSendFileEnd,
        Self::MakeOutput,
        Self::MakeOutputEnd,
        Self::Goodbye,
        Self::Stdmsg,
        Self::Stdout,
        Self::Stderr,
    ];

    /// Wire code of this kind.
    pub const fn code(self) -> i16 {
        self as i16
    }

    /// Looks up a kind by wire code.
    pub fn from_code(code: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    /// Band this kind belongs to.
    pub const fn band(self) -> Band {
        match Band::of(self.code()) {
            Some(band) => band,
            None => Band::Control,
        }
    }

    /// Whether the sender closes the connection right after this kind.
    pub const fn closes_connection(self) -> bool {
        matches!(
            self,
            Self::InvalidMsg | Self::InvalidParam | Self::AuthFailed | Self::ErrorMessage
        )
    }
}

/// Password hash algorithm named in [`Authenticate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
#[non_exhaustive]
pub enum HashType {
    /// SHA-256 over `password ‖ salt`.
    Sha256 = 0,
}

impl HashType {
    /// Wire code of this hash type.
    pub const fn code(self) -> i16 {
        self as i16
    }

    /// Looks up a hash type by wire code.
    pub const fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// Reads the kind code of the next message.
///
/// Returned raw so that unknown codes can still be reported.
pub async fn read_kind<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<i16, CodecError> {
    codec::read_i16(r).await
}

/// Writes a kind code.
pub async fn write_kind<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    kind: MsgKind,
) -> Result<(), CodecError> {
    codec::write_i16(w, kind.code()).await
}

/// Writes a kind followed by a single length-prefixed payload.
///
/// Used for [`MsgKind::ErrorMessage`] and the informational band.
pub async fn write_text<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    kind: MsgKind,
    text: &[u8],
) -> Result<(), CodecError> {
    write_kind(w, kind).await?;
    codec::write_bytes(w, text).await
}

/// Payload of [`MsgKind::Authenticate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticate {
    /// Raw [`HashType`] code, kept raw so unsupported types can be answered.
    pub hash_type: i16,
    /// User name.
    pub username: String,
    /// Hash of the password with the salt appended.
    pub hash: Vec<u8>,
}

impl Authenticate {
    /// Reads the payload (the kind code has already been consumed).
    pub async fn read<R: AsyncRead + Unpin + ?Sized>(
        r: &mut R,
        max: usize,
    ) -> Result<Self, CodecError> {
        let hash_type = codec::read_i16(r).await?;
        let username = codec::read_string(r, max).await?;
        let hash = codec::read_bytes(r, max).await?;
        Ok(Self {
            hash_type,
            username,
            hash,
        })
    }

    /// Writes the full message, kind code included.
    pub async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, w: &mut W) -> Result<(), CodecError> {
        write_kind(w, MsgKind::Authenticate).await?;
        codec::write_i16(w, self.hash_type).await?;
        codec::write_string(w, &self.username).await?;
        codec::write_bytes(w, &self.hash).await
    }
}

/// Payload of [`MsgKind::MakeRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MakeRequest {
    /// Recipe type; empty to select by filename.
    pub recipe_type: String,
    /// Uploaded filenames. The daemon currently requires exactly one.
    pub filenames: Vec<String>,
    /// Free-form options passed to command templates.
    pub options: BTreeMap<String, String>,
}

impl MakeRequest {
    /// Reads the payload (the kind code has already been consumed).
    pub async fn read<R: AsyncRead + Unpin + ?Sized>(
        r: &mut R,
        max: usize,
    ) -> Result<Self, CodecError> {
        let recipe_type = codec::read_string(r, max).await?;

        let count = read_count(r).await?;
        let mut filenames = Vec::new();
        for _ in 0..count {
            filenames.push(codec::read_string(r, max).await?);
        }

        let count = read_count(r).await?;
        let mut options = BTreeMap::new();
        for _ in 0..count {
            let key = codec::read_string(r, max).await?;
            let value = codec::read_string(r, max).await?;
            options.insert(key, value);
        }

        Ok(Self {
            recipe_type,
            filenames,
            options,
        })
    }

    /// Writes the full message, kind code included.
    pub async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, w: &mut W) -> Result<(), CodecError> {
        write_kind(w, MsgKind::MakeRequest).await?;
        codec::write_string(w, &self.recipe_type).await?;

        codec::write_i32(w, to_count(self.filenames.len())?).await?;
        for name in &self.filenames {
            codec::write_string(w, name).await?;
        }

        codec::write_i32(w, to_count(self.options.len())?).await?;
        for (key, value) in &self.options {
            codec::write_string(w, key).await?;
            codec::write_string(w, value).await?;
        }
        Ok(())
    }
}

/// Reads an `i32` repeat count, rejecting negatives.
async fn read_count<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<u32, CodecError> {
    let count = codec::read_i32(r).await?;
    u32::try_from(count).map_err(|_| CodecError::NegativeLength(i64::from(count)))
}

/// Converts a list length to its `i32` wire count.
fn to_count(len: usize) -> Result<i32, CodecError> {
    i32::try_from(len).map_err(|_| CodecError::Io(std::io::Error::other("too many entries")))
}
