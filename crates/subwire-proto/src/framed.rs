//! `tokio_util::codec` adapters over [`FrameDecoder`].

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{encode_client_op, encode_server_op, CodecConfig, FrameDecoder};
use crate::error::{CodecError, ParseError};
use crate::operation::{ClientOperation, ServerOperation};

/// Backend end of a stream: decodes client operations, encodes server operations.
///
/// Parse errors are yielded as items rather than stream errors so that the
/// backend can answer with `-ERR` and keep reading.
#[derive(Debug, Default)]
pub struct ServerCodec {
    decoder: FrameDecoder,
}

impl ServerCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CodecConfig) -> Self {
        Self {
            decoder: FrameDecoder::with_config(config),
        }
    }
}

impl Decoder for ServerCodec {
    type Item = Result<ClientOperation, ParseError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decoder.decode_client(src) {
            Ok(Some(op)) => Ok(Some(Ok(op))),
            Ok(None) => Ok(None),
            Err(err) => Ok(Some(Err(err))),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        match self.decoder.finish(src) {
            Ok(()) => Ok(None),
            Err(err) => Ok(Some(Err(err))),
        }
    }
}

impl Encoder<ServerOperation> for ServerCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ServerOperation, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_server_op(&item, dst, self.decoder.config())
    }
}

/// Client end of a stream: decodes server operations, encodes client operations.
///
/// Any parse error ends the stream.
#[derive(Debug, Default)]
pub struct ClientCodec {
    decoder: FrameDecoder,
}

impl ClientCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CodecConfig) -> Self {
        Self {
            decoder: FrameDecoder::with_config(config),
        }
    }
}

impl Decoder for ClientCodec {
    type Item = ServerOperation;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.decoder.decode_server(src)?)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(op) = self.decode(src)? {
            return Ok(Some(op));
        }
        self.decoder.finish(src)?;
        Ok(None)
    }
}

impl Encoder<ClientOperation> for ClientCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ClientOperation, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_client_op(&item, dst, self.decoder.config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[tokio::test]
    async fn client_to_server_over_duplex() {
        let (client_end, server_end) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client_end, ClientCodec::new());
        let mut reader = FramedRead::new(server_end, ServerCodec::new());

        let send = tokio::spawn(async move {
            writer
                .send(ClientOperation::subscribe("mytopic"))
                .await
                .expect("subscribe should encode");
            writer
                .send(ClientOperation::publish("mytopic", vec![7u8; 1000]))
                .await
                .expect("publish should encode");
        });

        let first = reader.next().await.expect("frame").expect("io").expect("parse");
        assert_eq!(first, ClientOperation::subscribe("mytopic"));

        let second = reader.next().await.expect("frame").expect("io").expect("parse");
        assert_eq!(second, ClientOperation::publish("mytopic", vec![7u8; 1000]));

        send.await.expect("writer task should finish");
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn server_codec_continues_after_parse_error() {
        let input: &[u8] = b"BOGUS\nSUB ok\n";
        let mut reader = FramedRead::new(input, ServerCodec::new());

        let first = reader.next().await.expect("frame").expect("io");
        assert_eq!(first, Err(ParseError::UnknownOperation("BOGUS".to_string())));

        let second = reader.next().await.expect("frame").expect("io");
        assert_eq!(second, Ok(ClientOperation::subscribe("ok")));

        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn server_codec_reports_truncated_tail() {
        let input: &[u8] = b"PUB a 10\nhello\n";
        let mut reader = FramedRead::new(input, ServerCodec::new());

        let item = reader.next().await.expect("frame").expect("io");
        assert_eq!(item, Err(ParseError::Truncated));
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn client_codec_parse_error_ends_stream() {
        let input: &[u8] = b"INFO {}\nGARBAGE\n";
        let mut reader = FramedRead::new(input, ClientCodec::new());

        let info = reader.next().await.expect("frame").expect("info should decode");
        assert!(matches!(info, ServerOperation::Info(map) if map.is_empty()));

        let err = reader.next().await.expect("frame").unwrap_err();
        assert!(matches!(
            err,
            CodecError::Parse(ParseError::UnknownOperation(_))
        ));
    }
}
