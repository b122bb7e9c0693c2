//! AS4 (ebMS3) wire-format codec
//!
//! Encodes and decodes AS4 messages between their wire representation and a
//! typed message model: bare SOAP 1.2 envelopes (`application/soap+xml`) and
//! MIME-packaged messages with attachments (`multipart/related`).
//!
//! # Features
//!
//! - ebMS3 Messaging header model (user messages, receipts, errors, pull requests)
//! - WS-Security token reference resolution against a certificate store
//! - Multihop routing input emission and decoding
//! - Content-type based dispatch with async, cancellable entry points
//! - XXE prevention and depth/size limits on inbound XML
//!
//! # Example
//!
//! ```ignore
//! use as4_codec::{CodecConfig, CodecDispatcher};
//!
//! let dispatcher = CodecDispatcher::new(CodecConfig::default());
//! let codec = dispatcher.get(content_type)?;
//! let message = codec.deserialize(&mut stream, content_type)?;
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod mime;
pub mod model;
pub mod security;
pub mod soap;
pub mod xml;

pub use config::CodecConfig;
pub use dispatcher::{CodecDispatcher, MessageCodec};
pub use error::{CodecError, EbmsErrorCode, ErrorLine, Severity};
pub use mime::MimeMultipartCodec;
pub use model::{Message, MessageUnit};
pub use soap::SoapEnvelopeCodec;
