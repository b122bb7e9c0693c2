//! In-memory model of an AS4 message: user/signal message units,
//! attachments, and the security header.

use crate::error::ErrorLine;
use crate::xml::XmlElement;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::io::Read;
use uuid::Uuid;

/// A complete AS4 message: the unit list plus packaging state.
///
/// Built either by the application (submit path) or by a codec decoding
/// wire bytes. Dropping the message releases its attachment streams.
#[derive(Debug)]
pub struct Message {
    /// Declared outer content type, boundary parameter included for
    /// multipart messages. The MIME codec reuses this boundary verbatim.
    pub content_type: String,
    units: Vec<MessageUnit>,
    attachments: Vec<Attachment>,
    pub security: SecurityHeader,
    pub signing_ids: SigningIds,
    /// Raw parsed envelope, retained after decode so signed content can be
    /// re-serialized byte-exactly.
    pub envelope: Option<XmlElement>,
}

impl Message {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            units: Vec::new(),
            attachments: Vec::new(),
            security: SecurityHeader::default(),
            signing_ids: SigningIds::default(),
            envelope: None,
        }
    }

    pub fn add_unit(&mut self, unit: MessageUnit) {
        self.units.push(unit);
    }

    pub fn units(&self) -> &[MessageUnit] {
        &self.units
    }

    pub fn units_mut(&mut self) -> &mut Vec<MessageUnit> {
        &mut self.units
    }

    pub fn user_messages(&self) -> impl Iterator<Item = &UserMessage> {
        self.units.iter().filter_map(|u| match u {
            MessageUnit::User(m) => Some(m),
            MessageUnit::Signal(_) => None,
        })
    }

    pub fn signal_messages(&self) -> impl Iterator<Item = &SignalMessage> {
        self.units.iter().filter_map(|u| match u {
            MessageUnit::Signal(s) => Some(s),
            MessageUnit::User(_) => None,
        })
    }

    /// The first user message, if any. AS4 messages carry at most one in
    /// practice; the list form exists for bundling.
    pub fn primary_user_message(&self) -> Option<&UserMessage> {
        self.user_messages().next()
    }

    pub fn add_attachment(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn attachments_mut(&mut self) -> &mut Vec<Attachment> {
        &mut self.attachments
    }

    /// Whether any PartInfo of any user message references the given
    /// attachment id via a `cid:` href.
    pub fn references_attachment(&self, id: &str) -> bool {
        self.user_messages().any(|um| {
            um.part_infos
                .iter()
                .any(|p| p.href.as_deref().is_some_and(|h| h.contains(id)))
        })
    }
}

/// Security-relevant ids stamped on the envelope for a later signing step.
#[derive(Debug, Clone, Default)]
pub struct SigningIds {
    /// `wsu:Id` placed on `eb:Messaging`
    pub header_id: Option<String>,
    /// `wsu:Id` placed on the SOAP Body
    pub body_id: Option<String>,
}

/// Common MessageInfo block shared by user and signal messages.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageInfo {
    pub message_id: String,
    pub ref_to_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MessageInfo {
    /// Fresh info with a generated message id and the current time.
    pub fn generate() -> Self {
        Self {
            message_id: format!("{}@as4-codec", Uuid::new_v4()),
            ref_to_message_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            ref_to_message_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Wire form of the timestamp (RFC 3339, millisecond precision, Z).
    pub fn timestamp_wire(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// One entry of the Messaging header.
#[derive(Debug, Clone)]
pub enum MessageUnit {
    User(UserMessage),
    Signal(SignalMessage),
}

impl MessageUnit {
    pub fn info(&self) -> &MessageInfo {
        match self {
            Self::User(m) => &m.info,
            Self::Signal(s) => &s.info,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.info().message_id
    }
}

/// Business-payload envelope.
#[derive(Debug, Clone)]
pub struct UserMessage {
    pub info: MessageInfo,
    /// Message partition channel; the well-known default when unset on
    /// the wire.
    pub mpc: String,
    pub collaboration: CollaborationInfo,
    pub sender: Party,
    pub receiver: Party,
    pub message_properties: Vec<Property>,
    pub part_infos: Vec<PartInfo>,
}

impl UserMessage {
    pub fn new(info: MessageInfo, collaboration: CollaborationInfo) -> Self {
        Self {
            info,
            mpc: crate::soap::DEFAULT_MPC.to_string(),
            collaboration,
            sender: Party::default(),
            receiver: Party::default(),
            message_properties: Vec::new(),
            part_infos: Vec::new(),
        }
    }
}

/// Control message: receipt, error, or pull request.
#[derive(Debug, Clone)]
pub struct SignalMessage {
    pub info: MessageInfo,
    pub variant: SignalVariant,
    /// When set, the signal travels multihop: the originating user message
    /// is echoed in a RoutingInput header so intermediaries can route the
    /// response without the full exchange context.
    pub routing: Option<UserMessage>,
}

impl SignalMessage {
    pub fn receipt(info: MessageInfo, receipt: Receipt) -> Self {
        Self {
            info,
            variant: SignalVariant::Receipt(receipt),
            routing: None,
        }
    }

    pub fn error(info: MessageInfo, lines: Vec<ErrorLine>) -> Self {
        Self {
            info,
            variant: SignalVariant::Error(lines),
            routing: None,
        }
    }

    pub fn pull_request(info: MessageInfo, mpc: impl Into<String>) -> Self {
        Self {
            info,
            variant: SignalVariant::PullRequest { mpc: mpc.into() },
            routing: None,
        }
    }

    /// WS-Addressing action URI emitted for this signal in multihop mode.
    pub fn multihop_action(&self) -> &'static str {
        match self.variant {
            SignalVariant::Receipt(_) => crate::soap::ACTION_RECEIPT,
            SignalVariant::Error(_) => crate::soap::ACTION_ERROR,
            SignalVariant::PullRequest { .. } => crate::soap::ACTION_PULL_REQUEST,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SignalVariant {
    Receipt(Receipt),
    Error(Vec<ErrorLine>),
    PullRequest { mpc: String },
}

/// Receipt content: either non-repudiation references cloned from the
/// acknowledged message's signature, or the user message itself.
#[derive(Debug, Clone, Default)]
pub struct Receipt {
    /// `ds:Reference` clones carried inside NonRepudiationInformation.
    /// Kept as raw XML so digests stay byte-identical.
    pub non_repudiation_refs: Vec<XmlElement>,
    /// Echoed user message for reception-awareness receipts.
    pub user_message: Option<UserMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollaborationInfo {
    pub agreement: Option<AgreementReference>,
    pub service: Service,
    pub action: String,
    pub conversation_id: String,
}

impl CollaborationInfo {
    /// The fixed ebMS3 conformance-test values, used when a message has
    /// no CollaborationInfo on the wire.
    pub fn conformance_test() -> Self {
        Self {
            agreement: None,
            service: Service::new(crate::soap::TEST_SERVICE),
            action: crate::soap::TEST_ACTION.to_string(),
            conversation_id: crate::soap::TEST_CONVERSATION_ID.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgreementReference {
    pub value: String,
    pub ref_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub value: String,
    pub service_type: Option<String>,
}

impl Service {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            service_type: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Party {
    pub role: String,
    pub ids: Vec<PartyId>,
}

impl Party {
    pub fn new(role: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            ids: vec![PartyId {
                value: id.into(),
                id_type: None,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartyId {
    pub value: String,
    pub id_type: Option<String>,
}

/// Name/value property, used both for message properties and part
/// properties. The optional `type` attribute round-trips.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub prop_type: Option<String>,
    pub value: String,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prop_type: None,
            value: value.into(),
        }
    }
}

/// Reference from a user message to a payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartInfo {
    /// `cid:<attachment-id>` for attached payloads, `#<id>` for body
    /// payloads, absent for the SOAP body itself.
    pub href: Option<String>,
    pub properties: Vec<Property>,
    pub schemas: Vec<Schema>,
}

impl PartInfo {
    pub fn for_attachment(attachment_id: &str) -> Self {
        Self {
            href: Some(format!("cid:{attachment_id}")),
            properties: Vec::new(),
            schemas: Vec::new(),
        }
    }

    /// The attachment id this part references, if the href is `cid:`-style.
    pub fn cid(&self) -> Option<&str> {
        self.href.as_deref().and_then(|h| h.strip_prefix("cid:"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub location: String,
    pub version: Option<String>,
    pub namespace: Option<String>,
}

/// Payload content carried outside the envelope.
///
/// `Reader` content is not seekable; the MIME writer buffers it before
/// writing. Replacing content always derives a new value via
/// [`Attachment::with_content`]; streams are never swapped in place under
/// a shared reference.
pub enum AttachmentContent {
    Bytes(Bytes),
    Reader(Box<dyn Read + Send>),
}

impl std::fmt::Debug for AttachmentContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Reader(_) => f.debug_tuple("Reader").finish(),
        }
    }
}

/// A MIME attachment. `id` doubles as the Content-ID on the wire.
#[derive(Debug)]
pub struct Attachment {
    pub id: String,
    pub content_type: String,
    pub content: AttachmentContent,
    pub properties: HashMap<String, String>,
}

impl Attachment {
    pub fn new(id: impl Into<String>, content_type: impl Into<String>, content: Bytes) -> Self {
        Self {
            id: id.into(),
            content_type: content_type.into(),
            content: AttachmentContent::Bytes(content),
            properties: HashMap::new(),
        }
    }

    pub fn from_reader(
        id: impl Into<String>,
        content_type: impl Into<String>,
        reader: Box<dyn Read + Send>,
    ) -> Self {
        Self {
            id: id.into(),
            content_type: content_type.into(),
            content: AttachmentContent::Reader(reader),
            properties: HashMap::new(),
        }
    }

    /// Derive a new attachment with the same id, content type and
    /// properties but different content.
    pub fn with_content(&self, content: AttachmentContent) -> Self {
        Self {
            id: self.id.clone(),
            content_type: self.content_type.clone(),
            content,
            properties: self.properties.clone(),
        }
    }
}

/// Decoded (or to-be-produced) WS-Security header state.
///
/// Verification is out of scope here: the codec only records whether a
/// signature or encrypted data is present and keeps the raw element for a
/// later canonicalization/verification step.
#[derive(Debug, Clone, Default)]
pub struct SecurityHeader {
    pub is_signed: bool,
    pub is_encrypted: bool,
    pub element: Option<XmlElement>,
}

impl SecurityHeader {
    /// Classify a decoded `wsse:Security` element by scanning its
    /// descendants for signature and encryption markers.
    pub fn from_element(element: XmlElement) -> Self {
        let is_signed = element.has_descendant(crate::soap::DS_NS, "Signature");
        let is_encrypted = element.has_descendant(crate::soap::XENC_NS, "EncryptedData")
            || element.has_descendant(crate::soap::XENC_NS, "EncryptedKey");
        Self {
            is_signed,
            is_encrypted,
            element: Some(element),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_document;

    #[test]
    fn test_part_info_cid() {
        let part = PartInfo::for_attachment("photo-1");
        assert_eq!(part.href.as_deref(), Some("cid:photo-1"));
        assert_eq!(part.cid(), Some("photo-1"));

        let body_part = PartInfo {
            href: Some("#body-1".to_string()),
            ..Default::default()
        };
        assert_eq!(body_part.cid(), None);
    }

    #[test]
    fn test_references_attachment() {
        let mut msg = Message::new("multipart/related");
        let mut um = UserMessage::new(
            MessageInfo::with_id("m1"),
            CollaborationInfo::conformance_test(),
        );
        um.part_infos.push(PartInfo::for_attachment("a1"));
        msg.add_unit(MessageUnit::User(um));

        assert!(msg.references_attachment("a1"));
        assert!(!msg.references_attachment("a2"));
    }

    #[test]
    fn test_attachment_derivation_keeps_metadata() {
        let mut att = Attachment::new("a1", "image/png", Bytes::from_static(b"old"));
        att.properties
            .insert("CompressionType".to_string(), "application/gzip".to_string());

        let derived = att.with_content(AttachmentContent::Bytes(Bytes::from_static(b"new")));
        assert_eq!(derived.id, "a1");
        assert_eq!(derived.content_type, "image/png");
        assert_eq!(
            derived.properties.get("CompressionType").map(String::as_str),
            Some("application/gzip")
        );
        match derived.content {
            AttachmentContent::Bytes(b) => assert_eq!(&b[..], b"new"),
            AttachmentContent::Reader(_) => panic!("expected bytes"),
        }
    }

    #[test]
    fn test_security_header_classification() {
        let signed = r#"<wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
            <ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:SignatureValue>abc</ds:SignatureValue></ds:Signature>
        </wsse:Security>"#;
        let header = SecurityHeader::from_element(parse_document(signed.as_bytes(), 16).unwrap());
        assert!(header.is_signed);
        assert!(!header.is_encrypted);

        let encrypted = r#"<wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
            <xenc:EncryptedKey xmlns:xenc="http://www.w3.org/2001/04/xmlenc#"/>
        </wsse:Security>"#;
        let header =
            SecurityHeader::from_element(parse_document(encrypted.as_bytes(), 16).unwrap());
        assert!(!header.is_signed);
        assert!(header.is_encrypted);
    }

    #[test]
    fn test_timestamp_wire_form() {
        let info = MessageInfo::generate();
        let wire = info.timestamp_wire();
        assert!(wire.ends_with('Z'));
        assert!(wire.contains('T'));
    }
}
