//! Line-oriented text wire protocol for subject-based pub/sub.
//!
//! Every frame starts with a `\n`-terminated command line. Frames that carry
//! a payload (`PUB`, `MSG`) declare its exact byte length on the command line,
//! and the raw payload bytes are followed by one more line terminator:
//!
//! ```text
//! SUB <subject>
//! UNSUB <subject>
//! PUB <subject> <n>\n<n bytes>
//! INFO <json-object>
//! MSG <subject> <n>\n<n bytes>
//! +OK
//! -ERR <json-quoted message>
//! ```
//!
//! [`ServerCodec`] sits on the backend end of a stream (decodes client
//! operations, encodes server operations); [`ClientCodec`] is its mirror.

pub mod codec;
pub mod error;
pub mod framed;
pub mod operation;

pub use codec::{
    encode_client_op, encode_server_op, is_valid_subject, CodecConfig, FrameDecoder,
    DEFAULT_MAX_LINE, DEFAULT_MAX_PAYLOAD,
};
pub use error::{CodecError, ParseError, Result};
pub use framed::{ClientCodec, ServerCodec};
pub use operation::{ClientOperation, InfoMap, ServerOperation};
