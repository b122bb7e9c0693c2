//! WS-Security token reference resolution.
//!
//! Converts between `<wsse:SecurityTokenReference>` wire XML and the three
//! reference shapes AS4 endpoints exchange: an embedded binary security
//! token, an issuer/serial lookup, and a subject-key-identifier lookup.
//! The two store-backed shapes resolve against an external
//! [`CertificateRepository`]; certificate availability is a deployment
//! concern, so a missing certificate is fatal here and never retried.

use crate::error::CodecError;
use crate::soap::{DS_NS, WSSE_NS};
use crate::xml::XmlElement;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

/// X.509 v3 token ValueType from the WSS X.509 token profile.
pub const VALUE_TYPE_X509V3: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-x509-token-profile-1.0#X509v3";
/// SubjectKeyIdentifier ValueType from the WSS X.509 token profile.
pub const VALUE_TYPE_SKI: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-x509-token-profile-1.0#X509SubjectKeyIdentifier";
/// Base64Binary EncodingType from WSS message security.
pub const ENCODING_TYPE_BASE64: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";

/// A certificate as the codec sees it: opaque DER plus the fields the
/// reference variants select on. Parsing DER is the store's concern.
#[derive(Debug, Clone, PartialEq)]
pub struct Certificate {
    pub der: Bytes,
    /// RFC 2253 issuer distinguished name.
    pub issuer_name: String,
    /// Decimal serial number.
    pub serial_number: String,
    /// Raw SubjectKeyIdentifier extension value, when the certificate
    /// carries one.
    pub subject_key_identifier: Option<Vec<u8>>,
}

impl Certificate {
    pub fn base64(&self) -> String {
        BASE64.encode(&self.der)
    }
}

/// Lookup key kind for [`CertificateRepository::get_certificate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateFindType {
    /// Value is the decimal serial number.
    BySerialNumber,
    /// Value is the hex-encoded SubjectKeyIdentifier.
    BySubjectKeyIdentifier,
}

/// External certificate store. Read-only during resolution; each lookup
/// opens its own handle, so implementations must be safe for concurrent
/// reads.
pub trait CertificateRepository: Send + Sync {
    /// Find a certificate or fail with `SecurityResolutionFailure`.
    fn get_certificate(
        &self,
        find_type: CertificateFindType,
        value: &str,
    ) -> Result<Certificate, CodecError>;
}

/// Which reference shape to produce when creating a new security header.
///
/// Produce-side selection is an explicit request; only decode selects by
/// inspecting wire XML.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceType {
    BinarySecurityToken,
    IssuerSerial,
    KeyIdentifier,
}

/// A resolved or to-be-produced security token reference.
#[derive(Debug, Clone, PartialEq)]
pub enum SecurityTokenReference {
    BinarySecurityToken(BinarySecurityToken),
    IssuerSerial(IssuerSerial),
    KeyIdentifier(KeyIdentifier),
}

impl SecurityTokenReference {
    /// Decode-side selection: inspect the `wsse:SecurityTokenReference`
    /// under the security header and build the variant whose marker
    /// element is present. First match wins; no recognized marker is a
    /// resolution failure.
    pub fn from_security_header(security: &XmlElement) -> Result<Self, CodecError> {
        let str_el = security
            .descendant(WSSE_NS, "SecurityTokenReference")
            .ok_or_else(|| {
                CodecError::SecurityResolutionFailure(
                    "no SecurityTokenReference element in security header".to_string(),
                )
            })?;

        if str_el.child(WSSE_NS, "Reference").is_some() {
            let mut bst = BinarySecurityToken::default();
            bst.load_xml(security)?;
            debug!(reference_id = %bst.reference_id, "resolved binary security token reference");
            return Ok(Self::BinarySecurityToken(bst));
        }
        if str_el
            .descendant(DS_NS, "X509IssuerSerial")
            .is_some()
        {
            let mut issuer_serial = IssuerSerial::default();
            issuer_serial.load_xml(str_el)?;
            return Ok(Self::IssuerSerial(issuer_serial));
        }
        if str_el.child(WSSE_NS, "KeyIdentifier").is_some() {
            let mut ki = KeyIdentifier::default();
            ki.load_xml(str_el)?;
            return Ok(Self::KeyIdentifier(ki));
        }

        Err(CodecError::SecurityResolutionFailure(
            "unsupported security token reference shape".to_string(),
        ))
    }

    /// Produce-side construction for an explicitly requested shape.
    pub fn for_certificate(
        reference_type: ReferenceType,
        certificate: &Certificate,
    ) -> Result<Self, CodecError> {
        match reference_type {
            ReferenceType::BinarySecurityToken => Ok(Self::BinarySecurityToken(
                BinarySecurityToken::for_certificate(certificate),
            )),
            ReferenceType::IssuerSerial => Ok(Self::IssuerSerial(IssuerSerial {
                issuer_name: certificate.issuer_name.clone(),
                serial_number: certificate.serial_number.clone(),
                certificate: Some(certificate.clone()),
            })),
            ReferenceType::KeyIdentifier => {
                let ski = certificate.subject_key_identifier.clone().ok_or_else(|| {
                    CodecError::SecurityResolutionFailure(
                        "certificate carries no SubjectKeyIdentifier extension".to_string(),
                    )
                })?;
                Ok(Self::KeyIdentifier(KeyIdentifier {
                    value: ski,
                    certificate: Some(certificate.clone()),
                }))
            }
        }
    }

    /// The `<wsse:SecurityTokenReference>` element to embed in a
    /// security header.
    pub fn get_xml(&self) -> XmlElement {
        match self {
            Self::BinarySecurityToken(bst) => bst.get_xml(),
            Self::IssuerSerial(is) => is.get_xml(),
            Self::KeyIdentifier(ki) => ki.get_xml(),
        }
    }
}

/// Certificate embedded directly in the header as base64.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BinarySecurityToken {
    /// Base64 DER of the embedded certificate.
    pub certificate_b64: String,
    /// `wsu:Id` of the token element; a `cert-<uuid>` value when not read
    /// from existing wire XML.
    pub reference_id: String,
}

impl BinarySecurityToken {
    pub fn for_certificate(certificate: &Certificate) -> Self {
        Self {
            certificate_b64: certificate.base64(),
            reference_id: generated_reference_id(),
        }
    }

    /// Populate from a decoded `wsse:Security` element: the reference id
    /// comes from `<wsse:Reference URI="#id">` (or is generated when the
    /// URI is absent) and the token bytes from the
    /// `<wsse:BinarySecurityToken>` that id points at.
    pub fn load_xml(&mut self, security: &XmlElement) -> Result<(), CodecError> {
        let reference = security
            .descendant(WSSE_NS, "SecurityTokenReference")
            .and_then(|str_el| str_el.child(WSSE_NS, "Reference"));

        self.reference_id = match reference.and_then(|r| r.attr("URI")) {
            Some(uri) => uri.trim_start_matches('#').to_string(),
            None => generated_reference_id(),
        };

        let token = security
            .children_named(WSSE_NS, "BinarySecurityToken")
            .find(|t| t.attr_local("Id") == Some(self.reference_id.as_str()))
            .or_else(|| security.child(WSSE_NS, "BinarySecurityToken"));

        match token {
            Some(t) => {
                self.certificate_b64 = t.text().split_whitespace().collect();
                Ok(())
            }
            None => Err(CodecError::SecurityResolutionFailure(format!(
                "no BinarySecurityToken with id {}",
                self.reference_id
            ))),
        }
    }

    pub fn get_xml(&self) -> XmlElement {
        let mut str_el = XmlElement::new("wsse", WSSE_NS, "SecurityTokenReference");
        let mut reference = XmlElement::new("wsse", WSSE_NS, "Reference");
        reference.set_attr("URI", &format!("#{}", self.reference_id));
        reference.set_attr("ValueType", VALUE_TYPE_X509V3);
        str_el.push_element(reference);
        str_el
    }

    /// The sibling `wsse:BinarySecurityToken` element the reference
    /// points at.
    pub fn token_xml(&self) -> XmlElement {
        let mut token = XmlElement::new("wsse", WSSE_NS, "BinarySecurityToken");
        token.set_attr("EncodingType", ENCODING_TYPE_BASE64);
        token.set_attr("ValueType", VALUE_TYPE_X509V3);
        token.set_attr("wsu:Id", &self.reference_id);
        token.push_text(self.certificate_b64.clone());
        token
    }

    /// Decode the embedded DER bytes.
    pub fn certificate_der(&self) -> Result<Vec<u8>, CodecError> {
        BASE64.decode(&self.certificate_b64).map_err(|e| {
            CodecError::SecurityResolutionFailure(format!("invalid token base64: {e}"))
        })
    }
}

/// Certificate located in the store by issuer name and serial number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssuerSerial {
    pub issuer_name: String,
    pub serial_number: String,
    certificate: Option<Certificate>,
}

impl IssuerSerial {
    pub fn load_xml(&mut self, str_el: &XmlElement) -> Result<(), CodecError> {
        let issuer_serial = str_el.descendant(DS_NS, "X509IssuerSerial").ok_or_else(|| {
            CodecError::SecurityResolutionFailure("missing X509IssuerSerial element".to_string())
        })?;
        let issuer = issuer_serial.child(DS_NS, "X509IssuerName").ok_or_else(|| {
            CodecError::SecurityResolutionFailure("missing X509IssuerName element".to_string())
        })?;
        let serial = issuer_serial
            .child(DS_NS, "X509SerialNumber")
            .ok_or_else(|| {
                CodecError::SecurityResolutionFailure(
                    "missing X509SerialNumber element".to_string(),
                )
            })?;
        self.issuer_name = issuer.text();
        self.serial_number = serial.text();
        Ok(())
    }

    pub fn get_xml(&self) -> XmlElement {
        let mut str_el = XmlElement::new("wsse", WSSE_NS, "SecurityTokenReference");
        let mut x509_data = XmlElement::new("ds", DS_NS, "X509Data");
        let mut issuer_serial = XmlElement::new("ds", DS_NS, "X509IssuerSerial");
        let mut issuer = XmlElement::new("ds", DS_NS, "X509IssuerName");
        issuer.push_text(self.issuer_name.clone());
        let mut serial = XmlElement::new("ds", DS_NS, "X509SerialNumber");
        serial.push_text(self.serial_number.clone());
        issuer_serial.push_element(issuer);
        issuer_serial.push_element(serial);
        x509_data.push_element(issuer_serial);
        str_el.push_element(x509_data);
        str_el
    }

    /// Resolve against the store, caching the hit.
    pub fn load_certificate(
        &mut self,
        repository: &dyn CertificateRepository,
    ) -> Result<&Certificate, CodecError> {
        let cert = match self.certificate.take() {
            Some(cert) => cert,
            None => {
                let cert = repository
                    .get_certificate(CertificateFindType::BySerialNumber, &self.serial_number)?;
                debug!(serial = %self.serial_number, "resolved certificate by issuer/serial");
                cert
            }
        };
        Ok(self.certificate.insert(cert))
    }
}

/// Certificate located in the store by SubjectKeyIdentifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyIdentifier {
    /// Raw SKI bytes.
    pub value: Vec<u8>,
    certificate: Option<Certificate>,
}

impl KeyIdentifier {
    pub fn load_xml(&mut self, str_el: &XmlElement) -> Result<(), CodecError> {
        let ki = str_el.child(WSSE_NS, "KeyIdentifier").ok_or_else(|| {
            CodecError::SecurityResolutionFailure("missing KeyIdentifier element".to_string())
        })?;
        let text: String = ki.text().split_whitespace().collect();
        // base64 is the declared encoding; hex-encoded values appear in
        // the wild, so fall back before giving up
        self.value = match BASE64.decode(&text) {
            Ok(bytes) => bytes,
            Err(_) => hex::decode(&text).map_err(|_| {
                CodecError::SecurityResolutionFailure(
                    "KeyIdentifier value is neither base64 nor hex".to_string(),
                )
            })?,
        };
        Ok(())
    }

    pub fn get_xml(&self) -> XmlElement {
        let mut str_el = XmlElement::new("wsse", WSSE_NS, "SecurityTokenReference");
        let mut ki = XmlElement::new("wsse", WSSE_NS, "KeyIdentifier");
        ki.set_attr("EncodingType", ENCODING_TYPE_BASE64);
        ki.set_attr("ValueType", VALUE_TYPE_SKI);
        ki.push_text(BASE64.encode(&self.value));
        str_el.push_element(ki);
        str_el
    }

    pub fn load_certificate(
        &mut self,
        repository: &dyn CertificateRepository,
    ) -> Result<&Certificate, CodecError> {
        let cert = match self.certificate.take() {
            Some(cert) => cert,
            None => {
                let cert = repository.get_certificate(
                    CertificateFindType::BySubjectKeyIdentifier,
                    &hex::encode(&self.value),
                )?;
                debug!("resolved certificate by subject key identifier");
                cert
            }
        };
        Ok(self.certificate.insert(cert))
    }
}

fn generated_reference_id() -> String {
    format!("cert-{}", Uuid::new_v4())
}

/// Simple in-memory store, useful for tests and embedded deployments.
#[derive(Debug, Default)]
pub struct InMemoryCertificateStore {
    certificates: Vec<Certificate>,
}

impl InMemoryCertificateStore {
    pub fn new(certificates: Vec<Certificate>) -> Self {
        Self { certificates }
    }

    pub fn add(&mut self, certificate: Certificate) {
        self.certificates.push(certificate);
    }
}

impl CertificateRepository for InMemoryCertificateStore {
    fn get_certificate(
        &self,
        find_type: CertificateFindType,
        value: &str,
    ) -> Result<Certificate, CodecError> {
        let found = self.certificates.iter().find(|c| match find_type {
            CertificateFindType::BySerialNumber => c.serial_number == value,
            CertificateFindType::BySubjectKeyIdentifier => c
                .subject_key_identifier
                .as_deref()
                .is_some_and(|ski| hex::encode(ski) == value.to_ascii_lowercase()),
        });
        found.cloned().ok_or_else(|| {
            CodecError::SecurityResolutionFailure(format!(
                "no certificate matches {find_type:?} {value}"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_document;

    fn test_certificate() -> Certificate {
        Certificate {
            der: Bytes::from_static(b"\x30\x82\x01\x0a-test-der"),
            issuer_name: "CN=AS4 Test CA,O=Example".to_string(),
            serial_number: "123456789".to_string(),
            subject_key_identifier: Some(vec![0xde, 0xad, 0xbe, 0xef]),
        }
    }

    fn security_with_bst() -> String {
        let cert_b64 = BASE64.encode(b"\x30\x82\x01\x0a-test-der");
        format!(
            r##"<wsse:Security
    xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd"
    xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd"
    xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
  <wsse:BinarySecurityToken wsu:Id="cert-11111111-2222-3333-4444-555555555555">{cert_b64}</wsse:BinarySecurityToken>
  <ds:Signature>
    <ds:KeyInfo>
      <wsse:SecurityTokenReference>
        <wsse:Reference URI="#cert-11111111-2222-3333-4444-555555555555"/>
      </wsse:SecurityTokenReference>
    </ds:KeyInfo>
  </ds:Signature>
</wsse:Security>"##
        )
    }

    #[test]
    fn test_bst_selected_and_loaded() {
        let security = parse_document(security_with_bst().as_bytes(), 32).unwrap();
        let reference = SecurityTokenReference::from_security_header(&security).unwrap();
        match reference {
            SecurityTokenReference::BinarySecurityToken(bst) => {
                assert_eq!(
                    bst.reference_id,
                    "cert-11111111-2222-3333-4444-555555555555"
                );
                assert_eq!(bst.certificate_der().unwrap(), b"\x30\x82\x01\x0a-test-der");
            }
            other => panic!("expected BinarySecurityToken, got {other:?}"),
        }
    }

    #[test]
    fn test_issuer_serial_round_trip() {
        let produced =
            SecurityTokenReference::for_certificate(ReferenceType::IssuerSerial, &test_certificate())
                .unwrap();
        // standalone serialization needs its own prefix declarations; inside
        // an envelope the root declares these
        let mut str_el = produced.get_xml();
        str_el.declare_namespace(Some("wsse"), WSSE_NS);
        str_el.declare_namespace(Some("ds"), DS_NS);
        let xml = str_el.to_document_bytes();
        let parsed = parse_document(&xml, 16).unwrap();

        let mut loaded = IssuerSerial::default();
        loaded.load_xml(&parsed).unwrap();
        assert_eq!(loaded.issuer_name, "CN=AS4 Test CA,O=Example");
        assert_eq!(loaded.serial_number, "123456789");

        let store = InMemoryCertificateStore::new(vec![test_certificate()]);
        let cert = loaded.load_certificate(&store).unwrap();
        assert_eq!(cert.serial_number, "123456789");
    }

    #[test]
    fn test_issuer_serial_certificate_not_found() {
        let mut is = IssuerSerial {
            issuer_name: "CN=Unknown".to_string(),
            serial_number: "42".to_string(),
            certificate: None,
        };
        let store = InMemoryCertificateStore::default();
        let err = is.load_certificate(&store).unwrap_err();
        assert!(matches!(err, CodecError::SecurityResolutionFailure(_)));
    }

    #[test]
    fn test_key_identifier_base64_and_hex() {
        let b64 = format!(
            r#"<wsse:SecurityTokenReference xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
  <wsse:KeyIdentifier>{}</wsse:KeyIdentifier>
</wsse:SecurityTokenReference>"#,
            BASE64.encode([0xde, 0xad, 0xbe, 0xef])
        );
        let mut ki = KeyIdentifier::default();
        ki.load_xml(&parse_document(b64.as_bytes(), 16).unwrap()).unwrap();
        assert_eq!(ki.value, vec![0xde, 0xad, 0xbe, 0xef]);

        // hex fallback: "cafe" decodes as base64 ("q~\x9e"), so use a value
        // that is not valid base64
        let hex_xml = r#"<wsse:SecurityTokenReference xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
  <wsse:KeyIdentifier>0fee1</wsse:KeyIdentifier>
</wsse:SecurityTokenReference>"#;
        let mut ki = KeyIdentifier::default();
        let err = ki
            .load_xml(&parse_document(hex_xml.as_bytes(), 16).unwrap())
            .unwrap_err();
        // odd-length hex is rejected too
        assert!(matches!(err, CodecError::SecurityResolutionFailure(_)));
    }

    #[test]
    fn test_key_identifier_missing_element_is_structural_error() {
        let xml = r#"<wsse:SecurityTokenReference xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd"/>"#;
        let mut ki = KeyIdentifier::default();
        let err = ki
            .load_xml(&parse_document(xml.as_bytes(), 16).unwrap())
            .unwrap_err();
        assert!(matches!(err, CodecError::SecurityResolutionFailure(_)));
    }

    #[test]
    fn test_unsupported_reference_shape() {
        let xml = r#"<wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
  <wsse:SecurityTokenReference>
    <wsse:Unknown/>
  </wsse:SecurityTokenReference>
</wsse:Security>"#;
        let security = parse_document(xml.as_bytes(), 16).unwrap();
        let err = SecurityTokenReference::from_security_header(&security).unwrap_err();
        assert!(matches!(err, CodecError::SecurityResolutionFailure(_)));
    }

    #[test]
    fn test_produce_side_requires_explicit_type() {
        let cert = Certificate {
            subject_key_identifier: None,
            ..test_certificate()
        };
        // KeyIdentifier requested for a cert without SKI is a failure, not
        // a silent fallback to another shape
        let err =
            SecurityTokenReference::for_certificate(ReferenceType::KeyIdentifier, &cert).unwrap_err();
        assert!(matches!(err, CodecError::SecurityResolutionFailure(_)));

        let bst = SecurityTokenReference::for_certificate(
            ReferenceType::BinarySecurityToken,
            &test_certificate(),
        )
        .unwrap();
        match bst {
            SecurityTokenReference::BinarySecurityToken(b) => {
                assert!(b.reference_id.starts_with("cert-"));
            }
            other => panic!("expected BinarySecurityToken, got {other:?}"),
        }
    }
}
