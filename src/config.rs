//! Configuration types for the AS4 codec.

use serde::{Deserialize, Serialize};

/// Main configuration for the codec layer.
///
/// Every section carries its own defaults so a bare `CodecConfig::default()`
/// produces a conformant codec; deployments override individual fields from
/// YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Config version
    pub version: String,

    /// Decode-side resource limits
    pub limits: LimitsConfig,

    /// Protocol defaults applied when elements are absent on the wire
    pub defaults: DefaultsConfig,

    /// MIME packaging behavior
    pub mime: MimeConfig,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            limits: LimitsConfig::default(),
            defaults: DefaultsConfig::default(),
            mime: MimeConfig::default(),
        }
    }
}

/// Resource limits enforced while decoding untrusted wire input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum size of the SOAP envelope document (bytes)
    pub max_envelope_bytes: usize,

    /// Maximum XML element nesting depth
    pub max_xml_depth: u32,

    /// Maximum number of MIME body parts (envelope plus attachments)
    pub max_mime_parts: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_envelope_bytes: 16 * 1024 * 1024, // 16MB
            max_xml_depth: 64,
            max_mime_parts: 64,
        }
    }
}

/// Protocol defaults used when optional wire elements are missing.
///
/// The service/action/conversation values are the fixed constants the ebMS3
/// core spec assigns to conformance-test messages with no CollaborationInfo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Message partition channel assumed when `@mpc` is absent
    pub mpc: String,

    /// Service assumed when CollaborationInfo is absent
    pub test_service: String,

    /// Action assumed when CollaborationInfo is absent
    pub test_action: String,

    /// ConversationId assumed when CollaborationInfo is absent
    pub test_conversation_id: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            mpc: crate::soap::DEFAULT_MPC.to_string(),
            test_service: crate::soap::TEST_SERVICE.to_string(),
            test_action: crate::soap::TEST_ACTION.to_string(),
            test_conversation_id: crate::soap::TEST_CONVERSATION_ID.to_string(),
        }
    }
}

/// MIME packaging behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MimeConfig {
    /// Attachment streams larger than this are still buffered in memory;
    /// the threshold only bounds the initial read chunk size.
    pub spool_chunk_bytes: usize,

    /// Content type written for the envelope body part
    pub envelope_content_type: String,
}

impl Default for MimeConfig {
    fn default() -> Self {
        Self {
            spool_chunk_bytes: 64 * 1024,
            envelope_content_type: "application/soap+xml; charset=utf-8".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CodecConfig::default();
        assert_eq!(config.limits.max_xml_depth, 64);
        assert!(config.defaults.mpc.ends_with("defaultMPC"));
        assert!(config
            .mime
            .envelope_content_type
            .starts_with("application/soap+xml"));
    }

    #[test]
    fn test_config_serialization() {
        let config = CodecConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: CodecConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.limits.max_envelope_bytes, config.limits.max_envelope_bytes);
        assert_eq!(parsed.defaults.mpc, config.defaults.mpc);
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
version: "1"
limits:
  max_envelope_bytes: 2097152
  max_xml_depth: 32
defaults:
  mpc: "urn:example:mpc:priority"
mime:
  spool_chunk_bytes: 8192
"#;
        let config: CodecConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.limits.max_envelope_bytes, 2_097_152);
        assert_eq!(config.limits.max_xml_depth, 32);
        assert_eq!(config.defaults.mpc, "urn:example:mpc:priority");
        assert_eq!(config.mime.spool_chunk_bytes, 8192);
        // untouched section keeps its default
        assert_eq!(config.limits.max_mime_parts, 64);
    }
}
