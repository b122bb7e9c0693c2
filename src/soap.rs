//! SOAP 1.2 envelope codec for ebMS3/AS4 messages.
//!
//! Encoding builds (or reuses) the Envelope/Header/Body tree, inserts the
//! security header first, emits multihop routing headers for routable
//! signals, and projects every message unit into the `eb:Messaging`
//! header. Decoding locates each Header child with its own
//! namespace-qualified lookup: element order in real-world input is not
//! guaranteed, and a forward-only cursor would skip a Security element
//! that is not first.

use crate::config::CodecConfig;
use crate::error::{CodecError, ErrorLine, Severity};
use crate::model::{
    AgreementReference, CollaborationInfo, Message, MessageInfo, MessageUnit, PartInfo, Party,
    PartyId, Property, Receipt, Schema, SecurityHeader, Service, SignalMessage, SignalVariant,
    UserMessage,
};
use crate::xml::{parse_document, XmlElement};
use chrono::{DateTime, Utc};
use std::io::{Read, Write};
use std::sync::OnceLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// SOAP 1.2 envelope namespace.
pub const SOAP12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
/// ebMS3 core namespace.
pub const EBMS_NS: &str = "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/";
/// WS-Security secext namespace.
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
/// WS-Security utility namespace.
pub const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
/// XML-DSig namespace.
pub const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
/// XML-Enc namespace.
pub const XENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";
/// WS-Addressing namespace, used only for multihop To/Action.
pub const WSA_NS: &str = "http://www.w3.org/2005/08/addressing";
/// ebMS3 part 2 multihop (message fragment/routing) namespace.
pub const MULTIHOP_NS: &str = "http://docs.oasis-open.org/ebxml-msg/ns/v3.0/mf/2010/04/";
/// ebBP signals namespace used inside Receipt.
pub const EBBP_NS: &str = "http://docs.oasis-open.org/ebxml-bp/ebbp-signals-2.0";

/// Well-known default message partition channel.
pub const DEFAULT_MPC: &str =
    "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/defaultMPC";
/// Service constant for conformance-test messages without CollaborationInfo.
pub const TEST_SERVICE: &str =
    "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/service";
/// Action constant for conformance-test messages without CollaborationInfo.
pub const TEST_ACTION: &str = "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/test";
/// ConversationId constant for conformance-test messages.
pub const TEST_CONVERSATION_ID: &str = "1";

/// SOAP role targeted by multihop signal headers: the next MSH on the path.
pub const NEXT_MSH_ROLE: &str =
    "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/part2/200811/nextmsh";
/// wsa:Action values for routable signals.
pub const ACTION_RECEIPT: &str =
    "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/part2/200811/receipt";
pub const ACTION_ERROR: &str =
    "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/part2/200811/error";
pub const ACTION_PULL_REQUEST: &str =
    "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/part2/200811/pullRequest";

/// Prefix table declared on freshly built envelopes. Lazily built once,
/// immutable for the process lifetime.
fn envelope_prefixes() -> &'static [(&'static str, &'static str)] {
    static PREFIXES: OnceLock<Vec<(&'static str, &'static str)>> = OnceLock::new();
    PREFIXES.get_or_init(|| {
        vec![
            ("s12", SOAP12_NS),
            ("eb", EBMS_NS),
            ("wsse", WSSE_NS),
            ("wsu", WSU_NS),
            ("wsa", WSA_NS),
            ("mh", MULTIHOP_NS),
            ("ebbp", EBBP_NS),
            ("ds", DS_NS),
        ]
    })
}

/// Codec for bare SOAP envelopes (`application/soap+xml`).
#[derive(Debug, Clone)]
pub struct SoapEnvelopeCodec {
    config: CodecConfig,
}

impl Default for SoapEnvelopeCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

impl SoapEnvelopeCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Build the envelope tree for a message, stamping generated security
    /// ids back onto the message so repeated encodes are byte-identical.
    pub fn build_envelope(&self, message: &mut Message) -> Result<XmlElement, CodecError> {
        match message.envelope.clone() {
            // a retained document (progressive signing) is reused as-is,
            // except that a fresh Security header replaces any existing one
            Some(mut envelope) => {
                if message.security.is_signed || message.security.is_encrypted {
                    let security = self.security_element(message);
                    let header = envelope.child_mut(SOAP12_NS, "Header").ok_or_else(|| {
                        CodecError::MalformedEnvelope(
                            "retained envelope has no Header".to_string(),
                        )
                    })?;
                    header.remove_children(WSSE_NS, "Security");
                    header.insert_first_element(security);
                }
                Ok(envelope)
            }
            None => self.build_fresh_envelope(message),
        }
    }

    fn build_fresh_envelope(&self, message: &mut Message) -> Result<XmlElement, CodecError> {
        let mut envelope = XmlElement::new("s12", SOAP12_NS, "Envelope");
        for (prefix, uri) in envelope_prefixes() {
            envelope.declare_namespace(Some(prefix), uri);
        }

        let mut header = XmlElement::new("s12", SOAP12_NS, "Header");

        // Security always first when present
        if message.security.is_signed || message.security.is_encrypted {
            header.push_element(self.security_element(message));
        }

        // multihop routing headers go between Security and Messaging
        if let Some((action_uri, routed)) = message
            .signal_messages()
            .find_map(|s| s.routing.as_ref().map(|r| (s.multihop_action(), r)))
        {
            let mut to = XmlElement::new("wsa", WSA_NS, "To");
            to.set_attr("s12:role", NEXT_MSH_ROLE);
            to.push_text(NEXT_MSH_ROLE);
            header.push_element(to);

            let mut action = XmlElement::new("wsa", WSA_NS, "Action");
            action.push_text(action_uri);
            header.push_element(action);

            let mut routing_input = XmlElement::new("mh", MULTIHOP_NS, "RoutingInput");
            routing_input.push_element(serialize_user_message(routed, "mh", MULTIHOP_NS));
            header.push_element(routing_input);
        }

        // Messaging header with every unit, in unit order
        let mut messaging = XmlElement::new("eb", EBMS_NS, "Messaging");
        messaging.set_attr("s12:mustUnderstand", "true");
        if message.security.is_signed && message.signing_ids.header_id.is_none() {
            message.signing_ids.header_id = Some(format!("id-{}", Uuid::new_v4()));
        }
        if let Some(id) = &message.signing_ids.header_id {
            messaging.set_attr("wsu:Id", id);
        }
        for unit in message.units() {
            match unit {
                MessageUnit::Signal(signal) => {
                    messaging.push_element(serialize_signal_message(signal));
                }
                MessageUnit::User(user) => {
                    messaging.push_element(serialize_user_message(user, "eb", EBMS_NS));
                }
            }
        }
        header.push_element(messaging);
        envelope.push_element(header);

        let mut body = XmlElement::new("s12", SOAP12_NS, "Body");
        if !message.security.is_signed {
            // stamp an id a later signing step can reference
            let body_id = message
                .signing_ids
                .body_id
                .get_or_insert_with(|| format!("body-{}", Uuid::new_v4()));
            body.set_attr("wsu:Id", body_id);
        }
        envelope.push_element(body);

        Ok(envelope)
    }

    fn security_element(&self, message: &Message) -> XmlElement {
        match &message.security.element {
            Some(el) => el.clone(),
            // strategy construction is out of scope; an empty header marks
            // the slot the signing/encryption step fills in
            None => XmlElement::new("wsse", WSSE_NS, "Security"),
        }
    }

    /// Encode onto a caller-owned sink: UTF-8, no BOM, never closed.
    pub fn encode(&self, message: &mut Message, out: &mut dyn Write) -> Result<(), CodecError> {
        let envelope = self.build_envelope(message)?;
        envelope.write_document(out)?;
        Ok(())
    }

    /// Decode a complete envelope document from the stream.
    pub fn decode(
        &self,
        input: &mut dyn Read,
        content_type: &str,
    ) -> Result<Message, CodecError> {
        let limit = self.config.limits.max_envelope_bytes;
        let mut data = Vec::new();
        // reborrow: Read::by_ref is not callable on a trait object
        (&mut *input)
            .take(limit as u64 + 1)
            .read_to_end(&mut data)?;
        self.decode_bytes(&data, content_type)
    }

    pub fn decode_bytes(&self, data: &[u8], content_type: &str) -> Result<Message, CodecError> {
        let limit = self.config.limits.max_envelope_bytes;
        if data.len() > limit {
            return Err(CodecError::MalformedEnvelope(format!(
                "envelope exceeds {limit} byte limit"
            )));
        }
        let envelope = parse_document(data, self.config.limits.max_xml_depth)?;
        debug!(bytes = data.len(), "decoding SOAP envelope");

        if envelope.local_name() != "Envelope" || envelope.namespace() != Some(SOAP12_NS) {
            return Err(CodecError::MalformedEnvelope(
                "document element is not a SOAP 1.2 Envelope".to_string(),
            ));
        }
        let header = envelope.child(SOAP12_NS, "Header").ok_or_else(|| {
            CodecError::MalformedEnvelope("Envelope has no Header".to_string())
        })?;

        // independent lookups: each header child is located on its own
        let security_el = header.child(WSSE_NS, "Security");
        let messaging = header.child(EBMS_NS, "Messaging").ok_or_else(|| {
            CodecError::MalformedEnvelope("Header has no Messaging element".to_string())
        })?;
        let routing_input = header.child(MULTIHOP_NS, "RoutingInput");
        let body = envelope.child(SOAP12_NS, "Body");

        let mut message = Message::new(content_type);
        message.security = match security_el {
            Some(el) => SecurityHeader::from_element(el.clone()),
            None => SecurityHeader::default(),
        };
        message.signing_ids.header_id = messaging.attr_local("Id").map(str::to_string);
        message.signing_ids.body_id =
            body.and_then(|b| b.attr_local("Id")).map(str::to_string);

        let mut routed = routing_input
            .and_then(|ri| ri.child(MULTIHOP_NS, "UserMessage"))
            .map(|el| self.parse_user_message(el, MULTIHOP_NS))
            .transpose()?;

        for entry in messaging.elements() {
            if entry.namespace() != Some(EBMS_NS) {
                continue;
            }
            match entry.local_name() {
                "UserMessage" => {
                    let user = self.parse_user_message(entry, EBMS_NS)?;
                    message.add_unit(MessageUnit::User(user));
                }
                "SignalMessage" => {
                    let mut signal = self.parse_signal_message(entry)?;
                    // the routing input belongs to the signal it travels with
                    if signal.routing.is_none() {
                        signal.routing = routed.take();
                    }
                    message.add_unit(MessageUnit::Signal(signal));
                }
                other => {
                    warn!(element = other, "ignoring unknown Messaging entry");
                }
            }
        }

        if message.units().is_empty() {
            return Err(CodecError::MalformedEnvelope(
                "Messaging header carries no message units".to_string(),
            ));
        }

        message.envelope = Some(envelope);
        Ok(message)
    }

    fn parse_message_info(&self, parent: &XmlElement, ns: &str) -> Result<MessageInfo, CodecError> {
        let info = parent.child(ns, "MessageInfo").ok_or_else(|| {
            CodecError::MalformedEnvelope("message unit has no MessageInfo".to_string())
        })?;
        let message_id = info
            .child(ns, "MessageId")
            .map(|e| e.text())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                CodecError::MalformedEnvelope("MessageInfo has no MessageId".to_string())
            })?;
        let ref_to_message_id = info
            .child(ns, "RefToMessageId")
            .map(|e| e.text())
            .filter(|t| !t.is_empty());
        let timestamp = match info.child(ns, "Timestamp") {
            Some(e) => DateTime::parse_from_rfc3339(&e.text())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| {
                    warn!(message_id = %message_id, "unparsable Timestamp, substituting now");
                    Utc::now()
                }),
            None => Utc::now(),
        };
        Ok(MessageInfo {
            message_id,
            ref_to_message_id,
            timestamp,
        })
    }

    fn parse_user_message(&self, el: &XmlElement, ns: &str) -> Result<UserMessage, CodecError> {
        let info = self.parse_message_info(el, ns)?;
        let mpc = el
            .attr("mpc")
            .map(str::to_string)
            .unwrap_or_else(|| self.config.defaults.mpc.clone());

        let (sender, receiver) = match el.child(ns, "PartyInfo") {
            Some(party_info) => (
                party_info
                    .child(ns, "From")
                    .map(|p| parse_party(p, ns))
                    .unwrap_or_default(),
                party_info
                    .child(ns, "To")
                    .map(|p| parse_party(p, ns))
                    .unwrap_or_default(),
            ),
            None => (Party::default(), Party::default()),
        };

        let collaboration = match el.child(ns, "CollaborationInfo") {
            Some(ci) => CollaborationInfo {
                agreement: ci.child(ns, "AgreementRef").map(|a| AgreementReference {
                    value: a.text(),
                    ref_type: a.attr("type").map(str::to_string),
                }),
                service: ci
                    .child(ns, "Service")
                    .map(|s| Service {
                        value: s.text(),
                        service_type: s.attr("type").map(str::to_string),
                    })
                    .unwrap_or_else(|| Service::new(&self.config.defaults.test_service)),
                action: ci
                    .child(ns, "Action")
                    .map(|a| a.text())
                    .unwrap_or_else(|| self.config.defaults.test_action.clone()),
                conversation_id: ci
                    .child(ns, "ConversationId")
                    .map(|c| c.text())
                    .unwrap_or_else(|| self.config.defaults.test_conversation_id.clone()),
            },
            // whole element absent: the fixed conformance-test values apply
            None => CollaborationInfo {
                agreement: None,
                service: Service::new(&self.config.defaults.test_service),
                action: self.config.defaults.test_action.clone(),
                conversation_id: self.config.defaults.test_conversation_id.clone(),
            },
        };

        let message_properties = el
            .child(ns, "MessageProperties")
            .map(|mp| mp.children_named(ns, "Property").map(parse_property).collect())
            .unwrap_or_default();

        let part_infos = el
            .child(ns, "PayloadInfo")
            .map(|pi| {
                pi.children_named(ns, "PartInfo")
                    .map(|p| parse_part_info(p, ns))
                    .collect()
            })
            .unwrap_or_default();

        Ok(UserMessage {
            info,
            mpc,
            collaboration,
            sender,
            receiver,
            message_properties,
            part_infos,
        })
    }

    fn parse_signal_message(&self, el: &XmlElement) -> Result<SignalMessage, CodecError> {
        let info = self.parse_message_info(el, EBMS_NS)?;

        let receipt = el.child(EBMS_NS, "Receipt");
        let errors: Vec<&XmlElement> = el.children_named(EBMS_NS, "Error").collect();
        let pull_request = el.child(EBMS_NS, "PullRequest");

        let marker_kinds = usize::from(receipt.is_some())
            + usize::from(!errors.is_empty())
            + usize::from(pull_request.is_some());
        if marker_kinds != 1 {
            return Err(CodecError::MalformedEnvelope(format!(
                "SignalMessage {} carries {marker_kinds} signal markers, expected exactly one",
                info.message_id
            )));
        }

        let variant = if let Some(receipt_el) = receipt {
            let non_repudiation_refs = receipt_el
                .descendant(EBBP_NS, "NonRepudiationInformation")
                .map(|nri| collect_ds_references(nri))
                .unwrap_or_default();
            let user_message = receipt_el
                .child(EBMS_NS, "UserMessage")
                .map(|um| self.parse_user_message(um, EBMS_NS))
                .transpose()?;
            SignalVariant::Receipt(Receipt {
                non_repudiation_refs,
                user_message,
            })
        } else if !errors.is_empty() {
            SignalVariant::Error(errors.into_iter().map(parse_error_line).collect())
        } else {
            let mpc = pull_request
                .and_then(|p| p.attr("mpc"))
                .map(str::to_string)
                .unwrap_or_else(|| self.config.defaults.mpc.clone());
            SignalVariant::PullRequest { mpc }
        };

        Ok(SignalMessage {
            info,
            variant,
            routing: None,
        })
    }
}

fn parse_party(el: &XmlElement, ns: &str) -> Party {
    Party {
        role: el.child(ns, "Role").map(|r| r.text()).unwrap_or_default(),
        ids: el
            .children_named(ns, "PartyId")
            .map(|p| PartyId {
                value: p.text(),
                id_type: p.attr("type").map(str::to_string),
            })
            .collect(),
    }
}

fn parse_property(el: &XmlElement) -> Property {
    Property {
        name: el.attr("name").unwrap_or_default().to_string(),
        prop_type: el.attr("type").map(str::to_string),
        value: el.text(),
    }
}

fn parse_part_info(el: &XmlElement, ns: &str) -> PartInfo {
    PartInfo {
        href: el.attr("href").map(str::to_string),
        properties: el
            .child(ns, "PartProperties")
            .map(|pp| pp.children_named(ns, "Property").map(parse_property).collect())
            .unwrap_or_default(),
        schemas: el
            .children_named(ns, "Schema")
            .map(|s| Schema {
                location: s.attr("location").unwrap_or_default().to_string(),
                version: s.attr("version").map(str::to_string),
                namespace: s.attr("namespace").map(str::to_string),
            })
            .collect(),
    }
}

fn parse_error_line(el: &XmlElement) -> ErrorLine {
    ErrorLine {
        error_code: el.attr("errorCode").unwrap_or_default().to_string(),
        severity: el
            .attr("severity")
            .and_then(Severity::parse)
            .unwrap_or(Severity::Failure),
        category: el.attr("category").map(str::to_string),
        origin: el.attr("origin").map(str::to_string),
        short_description: el.attr("shortDescription").map(str::to_string),
        description: el.child(EBMS_NS, "Description").map(|d| d.text()),
        detail: el.child(EBMS_NS, "ErrorDetail").map(|d| d.text()),
    }
}

fn collect_ds_references(nri: &XmlElement) -> Vec<XmlElement> {
    let mut refs = Vec::new();
    collect_ds_references_into(nri, &mut refs);
    refs
}

fn collect_ds_references_into(el: &XmlElement, refs: &mut Vec<XmlElement>) {
    for child in el.elements() {
        if child.local_name() == "Reference" && child.namespace() == Some(DS_NS) {
            refs.push(child.clone());
        } else {
            collect_ds_references_into(child, refs);
        }
    }
}

fn serialize_user_message(user: &UserMessage, prefix: &str, ns: &str) -> XmlElement {
    let mut el = XmlElement::new(prefix, ns, "UserMessage");
    el.set_attr("mpc", &user.mpc);

    el.push_element(serialize_message_info(&user.info, prefix, ns));

    let mut party_info = XmlElement::new(prefix, ns, "PartyInfo");
    party_info.push_element(serialize_party(&user.sender, "From", prefix, ns));
    party_info.push_element(serialize_party(&user.receiver, "To", prefix, ns));
    el.push_element(party_info);

    let mut ci = XmlElement::new(prefix, ns, "CollaborationInfo");
    if let Some(agreement) = &user.collaboration.agreement {
        let mut a = XmlElement::new(prefix, ns, "AgreementRef");
        if let Some(t) = &agreement.ref_type {
            a.set_attr("type", t);
        }
        a.push_text(agreement.value.clone());
        ci.push_element(a);
    }
    let mut service = XmlElement::new(prefix, ns, "Service");
    if let Some(t) = &user.collaboration.service.service_type {
        service.set_attr("type", t);
    }
    service.push_text(user.collaboration.service.value.clone());
    ci.push_element(service);
    let mut action = XmlElement::new(prefix, ns, "Action");
    action.push_text(user.collaboration.action.clone());
    ci.push_element(action);
    let mut conversation = XmlElement::new(prefix, ns, "ConversationId");
    conversation.push_text(user.collaboration.conversation_id.clone());
    ci.push_element(conversation);
    el.push_element(ci);

    if !user.message_properties.is_empty() {
        let mut mp = XmlElement::new(prefix, ns, "MessageProperties");
        for p in &user.message_properties {
            mp.push_element(serialize_property(p, prefix, ns));
        }
        el.push_element(mp);
    }

    if !user.part_infos.is_empty() {
        let mut payload_info = XmlElement::new(prefix, ns, "PayloadInfo");
        for part in &user.part_infos {
            let mut pi = XmlElement::new(prefix, ns, "PartInfo");
            if let Some(href) = &part.href {
                pi.set_attr("href", href);
            }
            for schema in &part.schemas {
                let mut s = XmlElement::new(prefix, ns, "Schema");
                s.set_attr("location", &schema.location);
                if let Some(v) = &schema.version {
                    s.set_attr("version", v);
                }
                if let Some(n) = &schema.namespace {
                    s.set_attr("namespace", n);
                }
                pi.push_element(s);
            }
            if !part.properties.is_empty() {
                let mut pp = XmlElement::new(prefix, ns, "PartProperties");
                for p in &part.properties {
                    pp.push_element(serialize_property(p, prefix, ns));
                }
                pi.push_element(pp);
            }
            payload_info.push_element(pi);
        }
        el.push_element(payload_info);
    }

    el
}

fn serialize_message_info(info: &MessageInfo, prefix: &str, ns: &str) -> XmlElement {
    let mut mi = XmlElement::new(prefix, ns, "MessageInfo");
    let mut ts = XmlElement::new(prefix, ns, "Timestamp");
    ts.push_text(info.timestamp_wire());
    mi.push_element(ts);
    let mut id = XmlElement::new(prefix, ns, "MessageId");
    id.push_text(info.message_id.clone());
    mi.push_element(id);
    if let Some(ref_id) = &info.ref_to_message_id {
        let mut r = XmlElement::new(prefix, ns, "RefToMessageId");
        r.push_text(ref_id.clone());
        mi.push_element(r);
    }
    mi
}

fn serialize_party(party: &Party, tag: &str, prefix: &str, ns: &str) -> XmlElement {
    let mut el = XmlElement::new(prefix, ns, tag);
    for id in &party.ids {
        let mut pid = XmlElement::new(prefix, ns, "PartyId");
        if let Some(t) = &id.id_type {
            pid.set_attr("type", t);
        }
        pid.push_text(id.value.clone());
        el.push_element(pid);
    }
    let mut role = XmlElement::new(prefix, ns, "Role");
    role.push_text(party.role.clone());
    el.push_element(role);
    el
}

fn serialize_property(p: &Property, prefix: &str, ns: &str) -> XmlElement {
    let mut el = XmlElement::new(prefix, ns, "Property");
    el.set_attr("name", &p.name);
    if let Some(t) = &p.prop_type {
        el.set_attr("type", t);
    }
    el.push_text(p.value.clone());
    el
}

fn serialize_signal_message(signal: &SignalMessage) -> XmlElement {
    let mut el = XmlElement::new("eb", EBMS_NS, "SignalMessage");
    el.push_element(serialize_message_info(&signal.info, "eb", EBMS_NS));

    match &signal.variant {
        SignalVariant::Receipt(receipt) => {
            let mut receipt_el = XmlElement::new("eb", EBMS_NS, "Receipt");
            if !receipt.non_repudiation_refs.is_empty() {
                let mut nri = XmlElement::new("ebbp", EBBP_NS, "NonRepudiationInformation");
                for reference in &receipt.non_repudiation_refs {
                    let mut part =
                        XmlElement::new("ebbp", EBBP_NS, "MessagePartNRInformation");
                    part.push_element(reference.clone());
                    nri.push_element(part);
                }
                receipt_el.push_element(nri);
            } else if let Some(user) = &receipt.user_message {
                receipt_el.push_element(serialize_user_message(user, "eb", EBMS_NS));
            }
            el.push_element(receipt_el);
        }
        SignalVariant::Error(lines) => {
            for line in lines {
                let mut error = XmlElement::new("eb", EBMS_NS, "Error");
                error.set_attr("errorCode", &line.error_code);
                error.set_attr("severity", line.severity.as_str());
                if let Some(c) = &line.category {
                    error.set_attr("category", c);
                }
                if let Some(o) = &line.origin {
                    error.set_attr("origin", o);
                }
                if let Some(s) = &line.short_description {
                    error.set_attr("shortDescription", s);
                }
                if let Some(d) = &line.description {
                    let mut desc = XmlElement::new("eb", EBMS_NS, "Description");
                    desc.set_attr("xml:lang", "en");
                    desc.push_text(d.clone());
                    error.push_element(desc);
                }
                if let Some(d) = &line.detail {
                    let mut detail = XmlElement::new("eb", EBMS_NS, "ErrorDetail");
                    detail.push_text(d.clone());
                    error.push_element(detail);
                }
                el.push_element(error);
            }
        }
        SignalVariant::PullRequest { mpc } => {
            let mut pr = XmlElement::new("eb", EBMS_NS, "PullRequest");
            pr.set_attr("mpc", mpc);
            el.push_element(pr);
        }
    }

    el
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageInfo;

    fn test_user_message() -> UserMessage {
        let mut user = UserMessage::new(
            MessageInfo::with_id("msg-1"),
            CollaborationInfo {
                agreement: Some(AgreementReference {
                    value: "http://example.com/agreement".to_string(),
                    ref_type: None,
                }),
                service: Service::new("TestService"),
                action: "TestAction".to_string(),
                conversation_id: "conv-1".to_string(),
            },
        );
        user.sender = Party::new("http://example.com/roles/sender", "org:sender");
        user.receiver = Party::new("http://example.com/roles/receiver", "org:receiver");
        user.message_properties
            .push(Property::new("originalSender", "C1"));
        user
    }

    fn encode_to_string(message: &mut Message) -> String {
        let codec = SoapEnvelopeCodec::default();
        let mut out = Vec::new();
        codec.encode(message, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_user_message_round_trip() {
        let mut message = Message::new("application/soap+xml");
        message.add_unit(MessageUnit::User(test_user_message()));
        let xml = encode_to_string(&mut message);

        assert!(xml.contains("<eb:MessageId>msg-1</eb:MessageId>"));
        assert!(xml.contains("<eb:Action>TestAction</eb:Action>"));
        assert!(!xml.contains("wsse:Security"));

        let codec = SoapEnvelopeCodec::default();
        let decoded = codec
            .decode_bytes(xml.as_bytes(), "application/soap+xml")
            .unwrap();
        let user = decoded.primary_user_message().unwrap();
        assert_eq!(user.info.message_id, "msg-1");
        assert_eq!(user.collaboration.action, "TestAction");
        assert_eq!(user.collaboration.service.value, "TestService");
        assert_eq!(user.collaboration.conversation_id, "conv-1");
        assert_eq!(user.sender.ids[0].value, "org:sender");
        assert_eq!(user.message_properties[0].name, "originalSender");
        assert!(decoded.envelope.is_some());
    }

    #[test]
    fn test_encode_idempotent() {
        let mut message = Message::new("application/soap+xml");
        message.add_unit(MessageUnit::User(test_user_message()));
        let first = encode_to_string(&mut message);
        let second = encode_to_string(&mut message);
        // the generated body id is stamped onto the message on first encode
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_stream_enforces_envelope_size_limit() {
        let mut message = Message::new("application/soap+xml");
        let mut user = test_user_message();
        user.message_properties
            .push(Property::new("padding", "x".repeat(4096)));
        message.add_unit(MessageUnit::User(user));
        let xml = encode_to_string(&mut message);

        let mut config = CodecConfig::default();
        config.limits.max_envelope_bytes = 1024;
        let codec = SoapEnvelopeCodec::new(config);

        let mut input: &[u8] = xml.as_bytes();
        let err = codec
            .decode(&mut input, "application/soap+xml")
            .unwrap_err();
        match err {
            CodecError::MalformedEnvelope(detail) => assert!(detail.contains("1024")),
            other => panic!("expected MalformedEnvelope, got {other:?}"),
        }
    }

    #[test]
    fn test_unsigned_body_gets_id() {
        let mut message = Message::new("application/soap+xml");
        message.add_unit(MessageUnit::User(test_user_message()));
        let xml = encode_to_string(&mut message);
        let body_id = message.signing_ids.body_id.clone().unwrap();
        assert!(body_id.starts_with("body-"));
        assert!(xml.contains(&format!("wsu:Id=\"{body_id}\"")));
    }

    #[test]
    fn test_security_header_is_first_header_child() {
        let mut message = Message::new("application/soap+xml");
        message.add_unit(MessageUnit::User(test_user_message()));
        message.security.is_signed = true;
        let xml = encode_to_string(&mut message);

        let header_start = xml.find("<s12:Header>").unwrap();
        let security_pos = xml.find("<wsse:Security").unwrap();
        let messaging_pos = xml.find("<eb:Messaging").unwrap();
        assert!(header_start < security_pos);
        assert!(security_pos < messaging_pos);
    }

    #[test]
    fn test_decode_tolerates_security_after_messaging() {
        // out-of-order header children still decode thanks to independent
        // lookups
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<s12:Envelope xmlns:s12="http://www.w3.org/2003/05/soap-envelope"
              xmlns:eb="http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/"
              xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd"
              xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
  <s12:Header>
    <eb:Messaging>
      <eb:UserMessage>
        <eb:MessageInfo>
          <eb:Timestamp>2026-03-01T10:00:00.000Z</eb:Timestamp>
          <eb:MessageId>late-security</eb:MessageId>
        </eb:MessageInfo>
      </eb:UserMessage>
    </eb:Messaging>
    <wsse:Security>
      <ds:Signature><ds:SignatureValue>c2ln</ds:SignatureValue></ds:Signature>
    </wsse:Security>
  </s12:Header>
  <s12:Body/>
</s12:Envelope>"#;
        let codec = SoapEnvelopeCodec::default();
        let message = codec
            .decode_bytes(xml.as_bytes(), "application/soap+xml")
            .unwrap();
        assert!(message.security.is_signed);
        assert_eq!(message.units()[0].message_id(), "late-security");
    }

    #[test]
    fn test_decode_defaults_applied() {
        let xml = r#"<?xml version="1.0"?>
<s12:Envelope xmlns:s12="http://www.w3.org/2003/05/soap-envelope"
              xmlns:eb="http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/">
  <s12:Header>
    <eb:Messaging>
      <eb:UserMessage>
        <eb:MessageInfo>
          <eb:Timestamp>2026-03-01T10:00:00.000Z</eb:Timestamp>
          <eb:MessageId>defaults-1</eb:MessageId>
        </eb:MessageInfo>
      </eb:UserMessage>
    </eb:Messaging>
  </s12:Header>
  <s12:Body/>
</s12:Envelope>"#;
        let codec = SoapEnvelopeCodec::default();
        let message = codec
            .decode_bytes(xml.as_bytes(), "application/soap+xml")
            .unwrap();
        let user = message.primary_user_message().unwrap();
        assert_eq!(user.mpc, DEFAULT_MPC);
        assert_eq!(user.collaboration.service.value, TEST_SERVICE);
        assert_eq!(user.collaboration.action, TEST_ACTION);
        assert_eq!(user.collaboration.conversation_id, TEST_CONVERSATION_ID);
    }

    #[test]
    fn test_decode_missing_messaging_is_fatal() {
        let xml = r#"<?xml version="1.0"?>
<s12:Envelope xmlns:s12="http://www.w3.org/2003/05/soap-envelope">
  <s12:Header/>
  <s12:Body/>
</s12:Envelope>"#;
        let codec = SoapEnvelopeCodec::default();
        let err = codec
            .decode_bytes(xml.as_bytes(), "application/soap+xml")
            .unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_decode_empty_messaging_is_fatal() {
        let xml = r#"<?xml version="1.0"?>
<s12:Envelope xmlns:s12="http://www.w3.org/2003/05/soap-envelope"
              xmlns:eb="http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/">
  <s12:Header><eb:Messaging/></s12:Header>
  <s12:Body/>
</s12:Envelope>"#;
        let codec = SoapEnvelopeCodec::default();
        let err = codec
            .decode_bytes(xml.as_bytes(), "application/soap+xml")
            .unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_decode_ambiguous_signal_marker_is_fatal() {
        let xml = r#"<?xml version="1.0"?>
<s12:Envelope xmlns:s12="http://www.w3.org/2003/05/soap-envelope"
              xmlns:eb="http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/">
  <s12:Header>
    <eb:Messaging>
      <eb:SignalMessage>
        <eb:MessageInfo>
          <eb:Timestamp>2026-03-01T10:00:00.000Z</eb:Timestamp>
          <eb:MessageId>sig-1</eb:MessageId>
        </eb:MessageInfo>
        <eb:Receipt/>
        <eb:PullRequest mpc="urn:x"/>
      </eb:SignalMessage>
    </eb:Messaging>
  </s12:Header>
  <s12:Body/>
</s12:Envelope>"#;
        let codec = SoapEnvelopeCodec::default();
        let err = codec
            .decode_bytes(xml.as_bytes(), "application/soap+xml")
            .unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_signal_round_trips() {
        let mut message = Message::new("application/soap+xml");

        let mut error_info = MessageInfo::with_id("err-1");
        error_info.ref_to_message_id = Some("msg-1".to_string());
        message.add_unit(MessageUnit::Signal(SignalMessage::error(
            error_info,
            vec![ErrorLine::other("decode failed").with_description("something broke")],
        )));

        let mut pull_info = MessageInfo::with_id("pull-1");
        pull_info.ref_to_message_id = None;
        message.add_unit(MessageUnit::Signal(SignalMessage::pull_request(
            pull_info,
            "urn:example:mpc:a",
        )));

        let xml = encode_to_string(&mut message);
        let codec = SoapEnvelopeCodec::default();
        let decoded = codec
            .decode_bytes(xml.as_bytes(), "application/soap+xml")
            .unwrap();

        let signals: Vec<_> = decoded.signal_messages().collect();
        assert_eq!(signals.len(), 2);
        match &signals[0].variant {
            SignalVariant::Error(lines) => {
                assert_eq!(lines[0].error_code, "EBMS:0004");
                assert_eq!(lines[0].description.as_deref(), Some("something broke"));
            }
            other => panic!("expected error signal, got {other:?}"),
        }
        assert_eq!(signals[0].info.ref_to_message_id.as_deref(), Some("msg-1"));
        match &signals[1].variant {
            SignalVariant::PullRequest { mpc } => assert_eq!(mpc, "urn:example:mpc:a"),
            other => panic!("expected pull request, got {other:?}"),
        }
    }

    #[test]
    fn test_multihop_receipt_emits_routing_headers() {
        let mut message = Message::new("application/soap+xml");
        let mut receipt_info = MessageInfo::with_id("receipt-1");
        receipt_info.ref_to_message_id = Some("msg-1".to_string());
        let mut signal = SignalMessage::receipt(receipt_info, Receipt::default());
        signal.routing = Some(test_user_message());
        message.add_unit(MessageUnit::Signal(signal));

        let xml = encode_to_string(&mut message);
        assert!(xml.contains("<wsa:To"));
        assert!(xml.contains(ACTION_RECEIPT));
        assert!(xml.contains("<mh:RoutingInput>"));
        assert!(xml.contains("<mh:UserMessage"));

        // routing headers come after Security slot and before Messaging
        let to_pos = xml.find("<wsa:To").unwrap();
        let routing_pos = xml.find("<mh:RoutingInput>").unwrap();
        let messaging_pos = xml.find("<eb:Messaging").unwrap();
        assert!(to_pos < routing_pos && routing_pos < messaging_pos);

        let codec = SoapEnvelopeCodec::default();
        let decoded = codec
            .decode_bytes(xml.as_bytes(), "application/soap+xml")
            .unwrap();
        let signal = decoded.signal_messages().next().unwrap();
        let routed = signal.routing.as_ref().expect("routing input decoded");
        assert_eq!(routed.info.message_id, "msg-1");
    }

    #[test]
    fn test_receipt_preserves_nrr_references() {
        let reference_xml = r##"<ds:Reference xmlns:ds="http://www.w3.org/2000/09/xmldsig#" URI="#body-1">
  <ds:DigestValue>2jmj7l5rSw0yVb/vlWAYkK/YBwk=</ds:DigestValue>
</ds:Reference>"##;
        let reference = parse_document(reference_xml.as_bytes(), 16).unwrap();

        let mut message = Message::new("application/soap+xml");
        let mut receipt_info = MessageInfo::with_id("receipt-2");
        receipt_info.ref_to_message_id = Some("msg-9".to_string());
        message.add_unit(MessageUnit::Signal(SignalMessage::receipt(
            receipt_info,
            Receipt {
                non_repudiation_refs: vec![reference],
                user_message: None,
            },
        )));

        let xml = encode_to_string(&mut message);
        assert!(xml.contains("ebbp:NonRepudiationInformation"));
        assert!(xml.contains("2jmj7l5rSw0yVb/vlWAYkK/YBwk="));

        let codec = SoapEnvelopeCodec::default();
        let decoded = codec
            .decode_bytes(xml.as_bytes(), "application/soap+xml")
            .unwrap();
        match &decoded.signal_messages().next().unwrap().variant {
            SignalVariant::Receipt(receipt) => {
                assert_eq!(receipt.non_repudiation_refs.len(), 1);
                assert_eq!(
                    receipt.non_repudiation_refs[0].attr("URI"),
                    Some("#body-1")
                );
            }
            other => panic!("expected receipt, got {other:?}"),
        };
    }

    #[test]
    fn test_retained_envelope_reused_with_fresh_security() {
        let xml = r#"<?xml version="1.0"?>
<s12:Envelope xmlns:s12="http://www.w3.org/2003/05/soap-envelope"
              xmlns:eb="http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/"
              xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd"
              xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
  <s12:Header>
    <wsse:Security><ds:Signature><ds:SignatureValue>b2xk</ds:SignatureValue></ds:Signature></wsse:Security>
    <eb:Messaging>
      <eb:UserMessage>
        <eb:MessageInfo>
          <eb:Timestamp>2026-03-01T10:00:00.000Z</eb:Timestamp>
          <eb:MessageId>keep-me</eb:MessageId>
        </eb:MessageInfo>
      </eb:UserMessage>
    </eb:Messaging>
  </s12:Header>
  <s12:Body/>
</s12:Envelope>"#;
        let codec = SoapEnvelopeCodec::default();
        let mut message = codec
            .decode_bytes(xml.as_bytes(), "application/soap+xml")
            .unwrap();
        assert!(message.security.is_signed);

        // re-encode: the retained document round-trips, Security stays first
        let re_encoded = encode_to_string(&mut message);
        assert!(re_encoded.contains("keep-me"));
        assert!(re_encoded.contains("b2xk"));
        let header_pos = re_encoded.find("<s12:Header>").unwrap();
        let security_pos = re_encoded.find("<wsse:Security>").unwrap();
        let messaging_pos = re_encoded.find("<eb:Messaging>").unwrap();
        assert!(header_pos < security_pos && security_pos < messaging_pos);
    }
}
