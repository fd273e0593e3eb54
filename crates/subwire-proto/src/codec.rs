use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::value::RawValue;
use tracing::trace;

use crate::error::{CodecError, ParseError, Result};
use crate::operation::{ClientOperation, InfoMap, ServerOperation};

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Default maximum command line length: 64 KiB.
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// Configuration for the text codec.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Maximum command line length in bytes, excluding the terminator. Default: 64 KiB.
    pub max_line_length: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_line_length: DEFAULT_MAX_LINE,
        }
    }
}

/// Returns true if `subject` can be carried on the wire.
pub fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty() && !subject.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Incremental frame decoder shared by both stream directions.
///
/// Returns `Ok(None)` while the buffer holds an incomplete frame. After a
/// parse error the offending input is dropped up to the next line terminator,
/// so decoding can resume with the following frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    config: CodecConfig,
    /// Payload bytes still to be dropped after an oversized declaration.
    skip: usize,
    /// Drop input up to and including the next `\n` before decoding again.
    discard_line: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_config(CodecConfig::default())
    }

    pub fn with_config(config: CodecConfig) -> Self {
        Self {
            config,
            skip: 0,
            discard_line: false,
        }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Decode the next client-to-backend frame (`SUB`, `UNSUB`, `PUB`).
    pub fn decode_client(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<ClientOperation>, ParseError> {
        let decoded = self.decode_with(src, parse_client_line)?;
        Ok(decoded.map(|(header, payload)| match header {
            ClientHeader::Subscribe(subject) => ClientOperation::Subscribe { subject },
            ClientHeader::Unsubscribe(subject) => ClientOperation::Unsubscribe { subject },
            ClientHeader::Publish(subject) => ClientOperation::Publish { subject, payload },
        }))
    }

    /// Decode the next backend-to-client frame (`INFO`, `MSG`, `+OK`, `-ERR`).
    pub fn decode_server(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<ServerOperation>, ParseError> {
        let decoded = self.decode_with(src, parse_server_line)?;
        Ok(decoded.map(|(header, payload)| match header {
            ServerHeader::Info(map) => ServerOperation::Info(map),
            ServerHeader::Message(subject) => ServerOperation::Message { subject, payload },
            ServerHeader::Ok => ServerOperation::Ok,
            ServerHeader::Error(message) => ServerOperation::Error(message),
        }))
    }

    /// Check the remaining input at end of stream.
    ///
    /// Leftover bytes that do not form a frame are a truncation error; bytes
    /// that were already scheduled for discarding are dropped silently.
    pub fn finish(&mut self, src: &mut BytesMut) -> std::result::Result<(), ParseError> {
        let resyncing = self.skip > 0 || self.discard_line;
        self.skip = 0;
        self.discard_line = false;
        if src.is_empty() || resyncing {
            src.clear();
            return Ok(());
        }
        src.clear();
        Err(ParseError::Truncated)
    }

    fn decode_with<H>(
        &mut self,
        src: &mut BytesMut,
        parse: impl FnOnce(&str) -> std::result::Result<(H, Option<usize>), ParseError>,
    ) -> std::result::Result<Option<(H, Bytes)>, ParseError> {
        if !self.resync(src) {
            return Ok(None);
        }

        let max_line = self.config.max_line_length;
        // Line content, optional '\r', then '\n'.
        let scan = src.len().min(max_line.saturating_add(2));
        let Some(newline) = src[..scan].iter().position(|&b| b == b'\n') else {
            if src.len() >= max_line.saturating_add(2) {
                src.clear();
                self.discard_line = true;
                return Err(ParseError::LineTooLong { max: max_line });
            }
            return Ok(None);
        };

        let mut line_end = newline;
        if line_end > 0 && src[line_end - 1] == b'\r' {
            line_end -= 1;
        }
        if line_end > max_line {
            src.advance(newline + 1);
            return Err(ParseError::LineTooLong { max: max_line });
        }

        let parsed = std::str::from_utf8(&src[..line_end])
            .map_err(|_| ParseError::InvalidUtf8)
            .and_then(parse);
        let (header, payload_len) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                src.advance(newline + 1);
                return Err(err);
            }
        };

        let Some(len) = payload_len else {
            src.advance(newline + 1);
            return Ok(Some((header, Bytes::new())));
        };

        if len > self.config.max_payload_size {
            src.advance(newline + 1);
            self.skip = len;
            self.discard_line = true;
            return Err(ParseError::PayloadTooLarge {
                size: len,
                max: self.config.max_payload_size,
            });
        }

        let start = newline + 1;
        let end = start + len;
        if src.len() <= end {
            src.reserve(end + 2 - src.len());
            return Ok(None);
        }

        let terminator = match (src[end], src.get(end + 1)) {
            (b'\n', _) => 1,
            (b'\r', Some(b'\n')) => 2,
            (b'\r', None) => return Ok(None),
            _ => {
                src.advance(end);
                self.discard_line = true;
                return Err(ParseError::MissingTerminator(len));
            }
        };

        src.advance(start);
        let payload = src.split_to(len).freeze();
        src.advance(terminator);
        Ok(Some((header, payload)))
    }

    /// Drop input owed from an earlier parse error. Returns false if the
    /// buffer was exhausted before resynchronizing.
    fn resync(&mut self, src: &mut BytesMut) -> bool {
        if self.skip > 0 {
            let n = self.skip.min(src.len());
            src.advance(n);
            self.skip -= n;
            trace!(skipped = n, remaining = self.skip, "skipping oversized payload");
            if self.skip > 0 {
                return false;
            }
        }
        if self.discard_line {
            match src.iter().position(|&b| b == b'\n') {
                Some(newline) => {
                    trace!(discarded = newline + 1, "resynchronized after parse error");
                    src.advance(newline + 1);
                    self.discard_line = false;
                }
                None => {
                    trace!(discarded = src.len(), "discarding input until next line");
                    src.clear();
                    return false;
                }
            }
        }
        true
    }
}

/// Encode a client-to-backend operation.
pub fn encode_client_op(
    op: &ClientOperation,
    dst: &mut BytesMut,
    config: &CodecConfig,
) -> Result<()> {
    check_subject(op.subject())?;
    match op {
        ClientOperation::Subscribe { subject } => put_line(dst, "SUB", subject),
        ClientOperation::Unsubscribe { subject } => put_line(dst, "UNSUB", subject),
        ClientOperation::Publish { subject, payload } => {
            put_payload_frame(dst, "PUB", subject, payload, config)?
        }
    }
    Ok(())
}

/// Encode a backend-to-client operation.
pub fn encode_server_op(
    op: &ServerOperation,
    dst: &mut BytesMut,
    config: &CodecConfig,
) -> Result<()> {
    match op {
        ServerOperation::Info(map) => {
            let json = serde_json::to_string(map).map_err(std::io::Error::from)?;
            put_line(dst, "INFO", &json);
        }
        ServerOperation::Message { subject, payload } => {
            check_subject(subject)?;
            put_payload_frame(dst, "MSG", subject, payload, config)?;
        }
        ServerOperation::Ok => dst.put_slice(b"+OK\n"),
        ServerOperation::Error(message) => {
            // JSON quoting escapes embedded newlines, keeping the frame on one line.
            let quoted = serde_json::to_string(message).map_err(std::io::Error::from)?;
            put_line(dst, "-ERR", &quoted);
        }
    }
    Ok(())
}

fn check_subject(subject: &str) -> Result<()> {
    if is_valid_subject(subject) {
        Ok(())
    } else {
        Err(CodecError::InvalidSubject(subject.to_string()))
    }
}

fn put_line(dst: &mut BytesMut, op: &str, argument: &str) {
    dst.reserve(op.len() + argument.len() + 2);
    dst.put_slice(op.as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(argument.as_bytes());
    dst.put_u8(b'\n');
}

fn put_payload_frame(
    dst: &mut BytesMut,
    op: &str,
    subject: &str,
    payload: &[u8],
    config: &CodecConfig,
) -> Result<()> {
    if payload.len() > config.max_payload_size {
        return Err(CodecError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload_size,
        });
    }
    let header = format!("{op} {subject} {}\n", payload.len());
    dst.reserve(header.len() + payload.len() + 1);
    dst.put_slice(header.as_bytes());
    dst.put_slice(payload);
    dst.put_u8(b'\n');
    Ok(())
}

enum ClientHeader {
    Subscribe(String),
    Unsubscribe(String),
    Publish(String),
}

enum ServerHeader {
    Info(InfoMap),
    Message(String),
    Ok,
    Error(String),
}

type Parsed<H> = std::result::Result<(H, Option<usize>), ParseError>;

fn parse_client_line(line: &str) -> Parsed<ClientHeader> {
    let (op, rest) = split_op(line)?;
    match op {
        "SUB" => {
            let args = expect_args("SUB", rest, 1)?;
            Ok((ClientHeader::Subscribe(parse_subject(args[0])?), None))
        }
        "UNSUB" => {
            let args = expect_args("UNSUB", rest, 1)?;
            Ok((ClientHeader::Unsubscribe(parse_subject(args[0])?), None))
        }
        "PUB" => {
            let args = expect_args("PUB", rest, 2)?;
            let subject = parse_subject(args[0])?;
            let len = parse_length(args[1])?;
            Ok((ClientHeader::Publish(subject), Some(len)))
        }
        other => Err(ParseError::UnknownOperation(other.to_string())),
    }
}

fn parse_server_line(line: &str) -> Parsed<ServerHeader> {
    let (op, rest) = split_op(line)?;
    match op {
        "INFO" => {
            if rest.is_empty() {
                return Err(ParseError::ArgumentCount {
                    op: "INFO",
                    expected: 1,
                    found: 0,
                });
            }
            Ok((ServerHeader::Info(parse_info(rest)?), None))
        }
        "MSG" => {
            let args = expect_args("MSG", rest, 2)?;
            let subject = parse_subject(args[0])?;
            let len = parse_length(args[1])?;
            Ok((ServerHeader::Message(subject), Some(len)))
        }
        "+OK" => {
            expect_args("+OK", rest, 0)?;
            Ok((ServerHeader::Ok, None))
        }
        "-ERR" => {
            let message = serde_json::from_str::<String>(rest)
                .map_err(|err| ParseError::InvalidErrorMessage(err.to_string()))?;
            Ok((ServerHeader::Error(message), None))
        }
        other => Err(ParseError::UnknownOperation(other.to_string())),
    }
}

fn split_op(line: &str) -> std::result::Result<(&str, &str), ParseError> {
    if line.is_empty() {
        return Err(ParseError::EmptyLine);
    }
    Ok(line.split_once(' ').unwrap_or((line, "")))
}

fn expect_args<'a>(
    op: &'static str,
    rest: &'a str,
    expected: usize,
) -> std::result::Result<Vec<&'a str>, ParseError> {
    let args: Vec<&str> = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split(' ').collect()
    };
    if args.len() != expected {
        return Err(ParseError::ArgumentCount {
            op,
            expected,
            found: args.len(),
        });
    }
    Ok(args)
}

fn parse_subject(raw: &str) -> std::result::Result<String, ParseError> {
    if is_valid_subject(raw) {
        Ok(raw.to_string())
    } else {
        Err(ParseError::InvalidSubject(raw.to_string()))
    }
}

fn parse_length(raw: &str) -> std::result::Result<usize, ParseError> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidLength(raw.to_string()));
    }
    raw.parse()
        .map_err(|_| ParseError::InvalidLength(raw.to_string()))
}

/// Parse an `INFO` object. Strings are unquoted; every other value keeps its
/// exact JSON text, so numbers never pass through floating point.
fn parse_info(raw: &str) -> std::result::Result<InfoMap, ParseError> {
    let values: BTreeMap<String, Box<RawValue>> =
        serde_json::from_str(raw).map_err(|err| ParseError::InvalidInfo(err.to_string()))?;

    values
        .into_iter()
        .map(|(key, value)| {
            let text = value.get();
            let value = if text.starts_with('"') {
                serde_json::from_str::<String>(text)
                    .map_err(|err| ParseError::InvalidInfo(err.to_string()))?
            } else {
                text.to_string()
            };
            Ok((key, value))
        })
        .collect()
}
