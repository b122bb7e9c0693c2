//! Content-type based codec dispatch, plus async entry points.
//!
//! The codecs themselves are synchronous and CPU-bound. The async wrappers
//! run them on the blocking thread pool and observe a cancellation token at
//! every read/write boundary, so a cancelled decode of a large stream stops
//! within one chunk rather than running to completion.

use crate::config::CodecConfig;
use crate::error::CodecError;
use crate::mime::MimeMultipartCodec;
use crate::model::Message;
use crate::soap::SoapEnvelopeCodec;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Common surface of the wire codecs.
///
/// `serialize` takes the message mutably: codecs stamp generated identifiers
/// (body id, security reference ids) back onto the message so a repeated
/// serialize reproduces the same bytes.
pub trait MessageCodec: Send + Sync + std::fmt::Debug {
    fn serialize(&self, message: &mut Message, out: &mut dyn Write) -> Result<(), CodecError>;

    fn deserialize(&self, input: &mut dyn Read, content_type: &str)
        -> Result<Message, CodecError>;
}

impl MessageCodec for SoapEnvelopeCodec {
    fn serialize(&self, message: &mut Message, out: &mut dyn Write) -> Result<(), CodecError> {
        self.encode(message, out)
    }

    fn deserialize(
        &self,
        input: &mut dyn Read,
        content_type: &str,
    ) -> Result<Message, CodecError> {
        self.decode(input, content_type)
    }
}

impl MessageCodec for MimeMultipartCodec {
    fn serialize(&self, message: &mut Message, out: &mut dyn Write) -> Result<(), CodecError> {
        self.encode(message, out)
    }

    fn deserialize(
        &self,
        input: &mut dyn Read,
        content_type: &str,
    ) -> Result<Message, CodecError> {
        self.decode(input, content_type)
    }
}

/// Routes a declared content type to the codec that handles it.
#[derive(Clone)]
pub struct CodecDispatcher {
    codecs: Vec<(&'static str, Arc<dyn MessageCodec>)>,
}

impl CodecDispatcher {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            codecs: vec![
                (
                    "application/soap+xml",
                    Arc::new(SoapEnvelopeCodec::new(config.clone())),
                ),
                (
                    "multipart/related",
                    Arc::new(MimeMultipartCodec::new(config)),
                ),
            ],
        }
    }

    /// Look up the codec for a content type. Parameters after `;` are
    /// ignored for the purpose of dispatch.
    pub fn get(&self, content_type: &str) -> Result<&Arc<dyn MessageCodec>, CodecError> {
        let essence = crate::mime::ContentTypeParams::parse(content_type).essence;
        self.codecs
            .iter()
            .find(|(registered, _)| *registered == essence)
            .map(|(_, codec)| codec)
            .ok_or_else(|| CodecError::UnsupportedContentType(content_type.to_string()))
    }

    /// Serialize on the blocking pool. Returns the (possibly id-stamped)
    /// message together with the wire bytes.
    pub async fn serialize_async(
        &self,
        mut message: Message,
        cancel: CancellationToken,
    ) -> Result<(Message, Vec<u8>), CodecError> {
        let codec = Arc::clone(self.get(&message.content_type)?);
        let token = cancel.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut sink = CancellableWriter::new(Vec::new(), token);
            codec.serialize(&mut message, &mut sink)?;
            Ok::<_, CodecError>((message, sink.into_inner()))
        })
        .await
        .map_err(|e| CodecError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

        map_cancellation(result, &cancel)
    }

    /// Deserialize on the blocking pool.
    pub async fn deserialize_async(
        &self,
        data: Vec<u8>,
        content_type: String,
        cancel: CancellationToken,
    ) -> Result<Message, CodecError> {
        let codec = Arc::clone(self.get(&content_type)?);
        let token = cancel.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut source = CancellableReader::new(io::Cursor::new(data), token);
            codec.deserialize(&mut source, &content_type)
        })
        .await
        .map_err(|e| CodecError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

        map_cancellation(result, &cancel)
    }
}

impl std::fmt::Debug for CodecDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<&str> = self.codecs.iter().map(|(ct, _)| *ct).collect();
        f.debug_struct("CodecDispatcher")
            .field("codecs", &registered)
            .finish()
    }
}

fn map_cancellation<T>(
    result: Result<T, CodecError>,
    cancel: &CancellationToken,
) -> Result<T, CodecError> {
    match result {
        Err(_) if cancel.is_cancelled() => {
            debug!("codec operation cancelled mid-stream");
            Err(CodecError::Cancelled)
        }
        other => other,
    }
}

const CANCELLED_MSG: &str = "cancellation token observed";

struct CancellableReader<R> {
    inner: R,
    cancel: CancellationToken,
}

impl<R: Read> CancellableReader<R> {
    fn new(inner: R, cancel: CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            // not Interrupted: read_to_end would silently retry that kind
            return Err(io::Error::new(io::ErrorKind::Other, CANCELLED_MSG));
        }
        self.inner.read(buf)
    }
}

struct CancellableWriter<W> {
    inner: W,
    cancel: CancellationToken,
}

impl<W: Write> CancellableWriter<W> {
    fn new(inner: W, cancel: CancellationToken) -> Self {
        Self { inner, cancel }
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CancellableWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, CANCELLED_MSG));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CollaborationInfo, MessageInfo, MessageUnit, UserMessage};

    fn soap_message() -> Message {
        let mut message = Message::new("application/soap+xml; charset=utf-8");
        message.add_unit(MessageUnit::User(UserMessage::new(
            MessageInfo::with_id("dispatch-1"),
            CollaborationInfo::conformance_test(),
        )));
        message
    }

    #[test]
    fn test_dispatch_by_essence() {
        let dispatcher = CodecDispatcher::new(CodecConfig::default());
        assert!(dispatcher.get("application/soap+xml").is_ok());
        assert!(dispatcher.get("application/soap+xml; charset=utf-8").is_ok());
        assert!(dispatcher.get("Multipart/Related; boundary=\"b\"").is_ok());
    }

    #[test]
    fn test_unknown_content_type_is_rejected() {
        let dispatcher = CodecDispatcher::new(CodecConfig::default());
        let err = dispatcher.get("not-supported-content-type").unwrap_err();
        match err {
            CodecError::UnsupportedContentType(ct) => {
                assert_eq!(ct, "not-supported-content-type");
            }
            other => panic!("expected UnsupportedContentType, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let dispatcher = CodecDispatcher::new(CodecConfig::default());
        let message = soap_message();

        let (_, wire) = dispatcher
            .serialize_async(message, CancellationToken::new())
            .await
            .unwrap();
        let decoded = dispatcher
            .deserialize_async(
                wire,
                "application/soap+xml; charset=utf-8".to_string(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            decoded.units()[0].message_id(),
            "dispatch-1"
        );
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_decode() {
        let dispatcher = CodecDispatcher::new(CodecConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = dispatcher
            .deserialize_async(
                b"<whatever/>".to_vec(),
                "application/soap+xml".to_string(),
                cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_encode() {
        let dispatcher = CodecDispatcher::new(CodecConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = dispatcher
            .serialize_async(soap_message(), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::Cancelled));
    }
}
