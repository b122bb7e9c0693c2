//! MIME multipart/related packaging for AS4 messages.
//!
//! Part 0 is always the SOAP envelope; parts 1..N carry attachments in
//! multipart order. Attachments are written with `Content-Transfer-Encoding:
//! binary`, since text-safe encodings corrupt binary and signed payloads
//! through CRLF normalization. The outer boundary is taken from the message's
//! declared content type, never regenerated, so the caller controls the
//! exact boundary bytes on the wire.

use crate::config::CodecConfig;
use crate::error::CodecError;
use crate::model::{Attachment, AttachmentContent, Message};
use crate::soap::SoapEnvelopeCodec;
use bytes::Bytes;
use std::io::{Read, Write};
use tracing::{debug, warn};

/// A parsed `Content-Type` value: essence plus `; name=value` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentTypeParams {
    /// Lowercased media type, e.g. `multipart/related`.
    pub essence: String,
    params: Vec<(String, String)>,
}

impl ContentTypeParams {
    pub fn parse(value: &str) -> Self {
        let mut segments = value.split(';');
        let essence = segments
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let params = segments
            .filter_map(|segment| {
                let (name, value) = segment.split_once('=')?;
                Some((
                    name.trim().to_ascii_lowercase(),
                    value.trim().trim_matches('"').to_string(),
                ))
            })
            .collect();
        Self { essence, params }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn boundary(&self) -> Option<&str> {
        self.param("boundary")
    }
}

/// Whether a content type is a plain `type/subtype` token pair the MIME
/// writer can emit verbatim. The full value is written into a part header
/// line, so control bytes anywhere in it (parameters included) are
/// rejected: a CR or LF would terminate the line and smuggle in headers.
fn is_writable_content_type(value: &str) -> bool {
    if value.bytes().any(|b| b.is_ascii_control()) {
        return false;
    }
    let essence = value.split(';').next().unwrap_or_default().trim();
    let Some((main, sub)) = essence.split_once('/') else {
        return false;
    };
    let is_token = |s: &str| {
        !s.is_empty()
            && s.bytes().all(|b| {
                b.is_ascii_alphanumeric() || matches!(b, b'!' | b'#' | b'$' | b'&' | b'-' | b'^' | b'_' | b'.' | b'+')
            })
    };
    is_token(main) && is_token(sub)
}

/// One parsed body part: headers plus raw content bytes.
#[derive(Debug, Clone)]
pub struct MimePart {
    headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl MimePart {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Content-ID with angle brackets stripped.
    pub fn content_id(&self) -> Option<String> {
        self.header("Content-ID")
            .map(|v| v.trim().trim_start_matches('<').trim_end_matches('>').to_string())
    }
}

/// Parse a full MIME message (top-level headers then multipart body) into
/// its body parts.
pub fn parse_mime_message(raw: &[u8], max_parts: usize) -> Result<Vec<MimePart>, CodecError> {
    let (head, body) = split_head_body(raw).ok_or_else(|| {
        CodecError::MimeInconsistency("input has no header/body separator".to_string())
    })?;
    let headers = parse_headers(head)?;
    let content_type = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("Content-Type"))
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| {
            CodecError::MimeInconsistency("missing top-level Content-Type".to_string())
        })?;
    let params = ContentTypeParams::parse(content_type);
    if !params.essence.starts_with("multipart/") {
        return Err(CodecError::MimeInconsistency(format!(
            "expected multipart content, got {}",
            params.essence
        )));
    }
    let boundary = params.boundary().ok_or_else(|| {
        CodecError::MimeInconsistency("multipart content type has no boundary".to_string())
    })?;

    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();
    let segments = split_on(body, delimiter.as_bytes());
    // segment 0 is the preamble
    for segment in segments.into_iter().skip(1) {
        if segment.starts_with(b"--") {
            break; // closing delimiter
        }
        let segment = trim_part_bounds(segment);
        if segment.is_empty() {
            continue;
        }
        let (part_head, part_body) = split_head_body(segment).ok_or_else(|| {
            CodecError::MimeInconsistency("body part has no header/body separator".to_string())
        })?;
        parts.push(MimePart {
            headers: parse_headers(part_head)?,
            body: Bytes::copy_from_slice(part_body),
        });
        if parts.len() > max_parts {
            return Err(CodecError::MimeInconsistency(format!(
                "more than {max_parts} body parts"
            )));
        }
    }

    Ok(parts)
}

fn parse_headers(head: &[u8]) -> Result<Vec<(String, String)>, CodecError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| CodecError::MimeInconsistency("non-UTF-8 part headers".to_string()))?;
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in text.split("\r\n").flat_map(|l| l.split('\n')) {
        if line.is_empty() {
            continue;
        }
        // folded continuation line
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            CodecError::MimeInconsistency(format!("malformed header line: {line}"))
        })?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

/// Split at the first blank line, CRLF or bare LF.
fn split_head_body(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = find(raw, b"\r\n\r\n").map(|i| (i, i + 4));
    let lf = find(raw, b"\n\n").map(|i| (i, i + 2));
    let (head_end, body_start) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 < b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&raw[..head_end], &raw[body_start..]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn split_on<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut segments = Vec::new();
    let mut rest = haystack;
    while let Some(idx) = find(rest, needle) {
        segments.push(&rest[..idx]);
        rest = &rest[idx + needle.len()..];
    }
    segments.push(rest);
    segments
}

/// Remove the line break that ties a part to the surrounding delimiters.
fn trim_part_bounds(mut segment: &[u8]) -> &[u8] {
    if segment.starts_with(b"\r\n") {
        segment = &segment[2..];
    } else if segment.starts_with(b"\n") {
        segment = &segment[1..];
    }
    if segment.ends_with(b"\r\n") {
        segment = &segment[..segment.len() - 2];
    } else if segment.ends_with(b"\n") {
        segment = &segment[..segment.len() - 1];
    }
    segment
}

/// Codec for MIME-packaged messages (`multipart/related`).
#[derive(Debug, Clone, Default)]
pub struct MimeMultipartCodec {
    soap: SoapEnvelopeCodec,
    config: CodecConfig,
}

impl MimeMultipartCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            soap: SoapEnvelopeCodec::new(config.clone()),
            config,
        }
    }

    /// Write the message as multipart/related onto a caller-owned sink.
    pub fn encode(&self, message: &mut Message, out: &mut dyn Write) -> Result<(), CodecError> {
        let declared = ContentTypeParams::parse(&message.content_type);
        let boundary = declared
            .boundary()
            .ok_or_else(|| {
                CodecError::MimeInconsistency(
                    "declared content type carries no boundary parameter".to_string(),
                )
            })?
            .to_string();

        // envelope goes through the SOAP codec into an in-memory buffer
        let mut envelope = Vec::new();
        self.soap.encode(message, &mut envelope)?;

        // the MIME writer needs random access; spool non-seekable streams
        // into memory first, deriving replacement attachments
        self.buffer_attachments(message)?;

        for attachment in message.attachments() {
            if !is_writable_content_type(&attachment.content_type) {
                return Err(CodecError::MimeInconsistency(format!(
                    "attachment {} has a content type the MIME writer cannot represent: {}",
                    attachment.id, attachment.content_type
                )));
            }
        }

        write!(out, "--{boundary}\r\n")?;
        write!(out, "Content-Type: {}\r\n", self.config.mime.envelope_content_type)?;
        write!(out, "Content-Transfer-Encoding: binary\r\n")?;
        write!(out, "\r\n")?;
        out.write_all(&envelope)?;
        write!(out, "\r\n")?;

        for attachment in message.attachments() {
            let AttachmentContent::Bytes(body) = &attachment.content else {
                unreachable!("attachments were buffered above");
            };
            write!(out, "--{boundary}\r\n")?;
            write!(out, "Content-Type: {}\r\n", attachment.content_type)?;
            write!(out, "Content-Transfer-Encoding: binary\r\n")?;
            write!(out, "Content-ID: <{}>\r\n", attachment.id)?;
            write!(out, "Content-Disposition: attachment\r\n")?;
            write!(out, "\r\n")?;
            out.write_all(body)?;
            write!(out, "\r\n")?;
        }

        write!(out, "--{boundary}--\r\n")?;
        out.flush()?;
        Ok(())
    }

    fn buffer_attachments(&self, message: &mut Message) -> Result<(), CodecError> {
        let chunk = self.config.mime.spool_chunk_bytes.max(1);
        for attachment in message.attachments_mut() {
            if matches!(attachment.content, AttachmentContent::Bytes(_)) {
                continue;
            }
            let content = std::mem::replace(
                &mut attachment.content,
                AttachmentContent::Bytes(Bytes::new()),
            );
            let AttachmentContent::Reader(mut reader) = content else {
                unreachable!();
            };
            let mut buffered = Vec::with_capacity(chunk);
            reader.read_to_end(&mut buffered)?;
            debug!(
                attachment = %attachment.id,
                bytes = buffered.len(),
                "spooled non-seekable attachment stream"
            );
            *attachment =
                attachment.with_content(AttachmentContent::Bytes(Bytes::from(buffered)));
        }
        Ok(())
    }

    /// Decode a multipart stream. The stream typically arrives without its
    /// own top-level `Content-Type:` line, so one is synthesized from the
    /// externally supplied content type before parsing.
    pub fn decode(
        &self,
        input: &mut dyn Read,
        content_type: &str,
    ) -> Result<Message, CodecError> {
        let mut body = Vec::new();
        input.read_to_end(&mut body)?;

        let mut raw = format!("Content-Type: {content_type}\r\n\r\n").into_bytes();
        raw.extend_from_slice(&body);

        let parts = parse_mime_message(&raw, self.config.limits.max_mime_parts)?;
        if parts.is_empty() {
            return Err(CodecError::MimeInconsistency(
                "no body parts in multipart stream".to_string(),
            ));
        }
        debug!(parts = parts.len(), "decoded multipart message");

        let mut message = self
            .soap
            .decode_bytes(&parts[0].body, content_type)?;

        for part in &parts[1..] {
            let Some(content_id) = part.content_id() else {
                warn!("dropping body part without Content-ID");
                continue;
            };
            if !message.references_attachment(&content_id) {
                warn!(content_id = %content_id, "dropping body part not referenced by any PartInfo");
                continue;
            }
            let part_type = part
                .header("Content-Type")
                .unwrap_or("application/octet-stream")
                .to_string();
            let mut attachment =
                Attachment::new(content_id.clone(), part_type, part.body.clone());
            // copy the matching PartInfo's properties onto the attachment
            if let Some(part_info) = message
                .user_messages()
                .flat_map(|um| um.part_infos.iter())
                .find(|p| p.href.as_deref().is_some_and(|h| h.contains(&content_id)))
            {
                for property in &part_info.properties {
                    attachment
                        .properties
                        .insert(property.name.clone(), property.value.clone());
                }
            }
            message.add_attachment(attachment);
        }

        Ok(message)
    }
}
