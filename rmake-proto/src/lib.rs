//! Wire protocol for the rmake remote build daemon.
//!
//! Every message is a big-endian `i16` kind code followed by a payload whose
//! shape is fixed by the kind. There is no outer length envelope: strings and
//! byte blobs carry their own `i64` length prefix, so framing depends on each
//! field being read exactly as declared.

mod codec;
mod message;

pub use codec::{
    CodecError, DEFAULT_MAX_LENGTH, read_bytes, read_i16, read_i32, read_i64, read_string,
    write_bytes, write_i16, write_i32, write_i64, write_string,
};
pub use message::{
    Authenticate, Band, DEFAULT_PORT, HashType, MakeRequest, MsgKind, read_kind, write_kind,
    write_text,
};
