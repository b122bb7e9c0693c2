//! Minimal owned XML tree used by the envelope codec.
//!
//! Built on quick-xml's event reader, which is safe against XXE by default
//! (entities are never expanded). The tree keeps text and whitespace nodes
//! verbatim so a decoded envelope can be re-serialized with the fidelity
//! signature verification expects, and supports the independent
//! namespace-qualified lookups the codec performs on `<Header>` children.

use crate::error::CodecError;
use quick_xml::escape::{escape, partial_escape, unescape};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::Write;

/// One node in the tree. Text nodes keep surrounding whitespace and hold
/// the wire-escaped form: parsed character data is stored exactly as
/// written (entity references included) and re-emitted verbatim, so a
/// retained signed document serializes byte-exact. [`XmlElement::push_text`]
/// escapes on insertion to maintain the invariant.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
    CData(String),
    Comment(String),
}

/// An attribute as written on the wire, xmlns declarations included.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlAttribute {
    /// Qualified name as written, e.g. `wsu:Id` or `xmlns:eb`.
    pub name: String,
    /// Unescaped value.
    pub value: String,
    /// Wire form as parsed, written back verbatim on serialization.
    /// `None` for attributes set programmatically.
    raw: Option<String>,
}

/// An element with a resolved namespace URI.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlElement {
    prefix: Option<String>,
    local: String,
    namespace: Option<String>,
    attributes: Vec<XmlAttribute>,
    children: Vec<XmlNode>,
}

impl XmlElement {
    /// Create a prefixed element in the given namespace.
    ///
    /// The namespace is *not* declared on the element; callers declare
    /// prefixes once on the document root via [`declare_namespace`].
    ///
    /// [`declare_namespace`]: XmlElement::declare_namespace
    pub fn new(prefix: &str, namespace: &str, local: &str) -> Self {
        Self {
            prefix: Some(prefix.to_string()),
            local: local.to_string(),
            namespace: Some(namespace.to_string()),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Create an unprefixed, un-namespaced element.
    pub fn unqualified(local: &str) -> Self {
        Self {
            prefix: None,
            local: local.to_string(),
            namespace: None,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Qualified name as serialized, e.g. `eb:Messaging`.
    pub fn qname(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{}:{}", p, self.local),
            None => self.local.clone(),
        }
    }

    /// Add an `xmlns:prefix` (or default `xmlns`) declaration.
    pub fn declare_namespace(&mut self, prefix: Option<&str>, uri: &str) {
        let name = match prefix {
            Some(p) => format!("xmlns:{p}"),
            None => "xmlns".to_string(),
        };
        self.set_attr(&name, uri);
    }

    /// Set (or replace) an attribute by its written name.
    pub fn set_attr(&mut self, name: &str, value: &str) {
        if let Some(existing) = self.attributes.iter_mut().find(|a| a.name == name) {
            existing.value = value.to_string();
            existing.raw = None;
            return;
        }
        self.attributes.push(XmlAttribute {
            name: name.to_string(),
            value: value.to_string(),
            raw: None,
        });
    }

    /// Attribute value by exact written name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Attribute value by local name, ignoring any prefix (`Id` matches
    /// both `Id` and `wsu:Id`).
    pub fn attr_local(&self, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| {
                a.name == local
                    || a.name
                        .rsplit_once(':')
                        .is_some_and(|(prefix, l)| l == local && prefix != "xmlns")
            })
            .map(|a| a.value.as_str())
    }

    pub fn attributes(&self) -> &[XmlAttribute] {
        &self.attributes
    }

    pub fn push_element(&mut self, element: XmlElement) {
        self.children.push(XmlNode::Element(element));
    }

    pub fn push_text(&mut self, text: impl Into<String>) {
        let text: String = text.into();
        let escaped = partial_escape(text.as_str()).into_owned();
        self.children.push(XmlNode::Text(escaped));
    }

    /// Insert an element before all existing children.
    pub fn insert_first_element(&mut self, element: XmlElement) {
        self.children.insert(0, XmlNode::Element(element));
    }

    /// Remove all child elements matching the namespace-qualified name,
    /// returning how many were removed.
    pub fn remove_children(&mut self, namespace: &str, local: &str) -> usize {
        let before = self.children.len();
        self.children.retain(|node| match node {
            XmlNode::Element(e) => !(e.local == local && e.namespace.as_deref() == Some(namespace)),
            _ => true,
        });
        before - self.children.len()
    }

    pub fn nodes(&self) -> &[XmlNode] {
        &self.children
    }

    /// Child elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|n| match n {
            XmlNode::Element(e) => Some(e),
            _ => None,
        })
    }

    /// First child element with the given namespace and local name.
    ///
    /// Each caller performs its own lookup; nothing here depends on the
    /// relative order of sibling header blocks.
    pub fn child(&self, namespace: &str, local: &str) -> Option<&XmlElement> {
        self.elements()
            .find(|e| e.local == local && e.namespace.as_deref() == Some(namespace))
    }

    pub fn child_mut(&mut self, namespace: &str, local: &str) -> Option<&mut XmlElement> {
        self.children.iter_mut().find_map(|n| match n {
            XmlNode::Element(e) if e.local == local && e.namespace.as_deref() == Some(namespace) => {
                Some(e)
            }
            _ => None,
        })
    }

    /// All child elements with the given namespace and local name.
    pub fn children_named<'a>(
        &'a self,
        namespace: &'a str,
        local: &'a str,
    ) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.elements()
            .filter(move |e| e.local == local && e.namespace.as_deref() == Some(namespace))
    }

    /// Depth-first search for the first descendant with the given name.
    pub fn descendant(&self, namespace: &str, local: &str) -> Option<&XmlElement> {
        for e in self.elements() {
            if e.local == local && e.namespace.as_deref() == Some(namespace) {
                return Some(e);
            }
            if let Some(found) = e.descendant(namespace, local) {
                return Some(found);
            }
        }
        None
    }

    pub fn has_descendant(&self, namespace: &str, local: &str) -> bool {
        self.descendant(namespace, local).is_some()
    }

    /// Concatenated text content of direct children, trimmed. Text nodes
    /// are unescaped; CDATA content is taken verbatim.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            match node {
                XmlNode::Text(t) => match unescape(t) {
                    Ok(u) => out.push_str(&u),
                    Err(_) => out.push_str(t),
                },
                XmlNode::CData(t) => out.push_str(t),
                _ => {}
            }
        }
        out.trim().to_string()
    }

    /// Serialize as a full document: UTF-8 declaration, no BOM. The sink
    /// is flushed but never closed; its lifetime belongs to the caller.
    pub fn write_document<W: Write + ?Sized>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(b"<?xml version=\"1.0\" encoding=\"utf-8\"?>")?;
        self.write_element(out)?;
        out.flush()
    }

    pub fn to_document_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Vec<u8> writes cannot fail
        self.write_document(&mut buf).expect("in-memory write");
        buf
    }

    fn write_element<W: Write + ?Sized>(&self, out: &mut W) -> std::io::Result<()> {
        write!(out, "<{}", self.qname())?;
        for attr in &self.attributes {
            match &attr.raw {
                Some(raw) => write!(out, " {}=\"{raw}\"", attr.name)?,
                None => write!(out, " {}=\"{}\"", attr.name, escape(attr.value.as_str()))?,
            }
        }
        if self.children.is_empty() {
            return write!(out, "/>");
        }
        write!(out, ">")?;
        for node in &self.children {
            match node {
                XmlNode::Element(e) => e.write_element(out)?,
                XmlNode::Text(t) => out.write_all(t.as_bytes())?,
                XmlNode::CData(t) => write!(out, "<![CDATA[{t}]]>")?,
                XmlNode::Comment(t) => write!(out, "<!--{t}-->")?,
            }
        }
        write!(out, "</{}>", self.qname())
    }
}

/// Reject DOCTYPE/ENTITY constructs before handing input to the reader.
/// quick-xml never expands entities, this keeps them out of the tree too.
fn reject_doctype(xml: &str) -> Result<(), CodecError> {
    if xml.contains("<!DOCTYPE") || xml.contains("<!doctype") {
        return Err(CodecError::MalformedEnvelope(
            "DOCTYPE declarations are not allowed".to_string(),
        ));
    }
    if xml.contains("<!ENTITY") || xml.contains("<!entity") {
        return Err(CodecError::MalformedEnvelope(
            "entity declarations are not allowed".to_string(),
        ));
    }
    Ok(())
}

/// Parse a complete document into a tree, preserving whitespace.
pub fn parse_document(data: &[u8], max_depth: u32) -> Result<XmlElement, CodecError> {
    let xml = std::str::from_utf8(data)
        .map_err(|e| CodecError::MalformedEnvelope(format!("invalid UTF-8: {e}")))?;
    reject_doctype(xml)?;

    let mut reader = Reader::from_str(xml);
    // whitespace between elements is kept: no trim_text

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut scopes: Vec<Vec<(Option<String>, String)>> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if root.is_some() {
                    return Err(CodecError::MalformedEnvelope(
                        "content after document element".to_string(),
                    ));
                }
                let (element, frame) = begin_element(e, &scopes)?;
                scopes.push(frame);
                stack.push(element);
                if stack.len() as u32 > max_depth {
                    return Err(CodecError::MalformedEnvelope(format!(
                        "element nesting exceeds depth limit {max_depth}"
                    )));
                }
            }
            Ok(Event::Empty(ref e)) => {
                if root.is_some() {
                    return Err(CodecError::MalformedEnvelope(
                        "content after document element".to_string(),
                    ));
                }
                let (element, frame) = begin_element(e, &scopes)?;
                scopes.push(frame);
                scopes.pop();
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::End(_)) => {
                let element = stack.pop().ok_or_else(|| {
                    CodecError::MalformedEnvelope("unbalanced end tag".to_string())
                })?;
                scopes.pop();
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::Text(ref e)) => {
                if let Some(parent) = stack.last_mut() {
                    // entity references must stay resolvable
                    e.unescape().map_err(|e| {
                        CodecError::MalformedEnvelope(format!("bad character data: {e}"))
                    })?;
                    // stored as written so re-serialization is byte-exact
                    let raw = String::from_utf8_lossy(e).into_owned();
                    parent.children.push(XmlNode::Text(raw));
                }
                // whitespace outside the root element is ignored
            }
            Ok(Event::CData(ref e)) => {
                if let Some(parent) = stack.last_mut() {
                    let text = String::from_utf8_lossy(e).into_owned();
                    parent.children.push(XmlNode::CData(text));
                }
            }
            Ok(Event::Comment(ref e)) => {
                if let Some(parent) = stack.last_mut() {
                    let text = String::from_utf8_lossy(e).into_owned();
                    parent.children.push(XmlNode::Comment(text));
                }
            }
            Ok(Event::DocType(_)) => {
                return Err(CodecError::MalformedEnvelope(
                    "DOCTYPE declarations are not allowed".to_string(),
                ));
            }
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) => {}
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(CodecError::MalformedEnvelope(format!(
                    "XML parse error: {e}"
                )));
            }
        }
    }

    if !stack.is_empty() {
        return Err(CodecError::MalformedEnvelope(
            "unexpected end of document".to_string(),
        ));
    }
    root.ok_or_else(|| CodecError::MalformedEnvelope("no document element".to_string()))
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), CodecError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(XmlNode::Element(element)),
        None => *root = Some(element),
    }
    Ok(())
}

/// Build an element from a start tag: collect attributes, record xmlns
/// declarations, resolve the element's own namespace against the scope
/// stack plus its own declarations.
fn begin_element(
    e: &quick_xml::events::BytesStart<'_>,
    scopes: &[Vec<(Option<String>, String)>],
) -> Result<(XmlElement, Vec<(Option<String>, String)>), CodecError> {
    let qname = std::str::from_utf8(e.name().as_ref())
        .map_err(|_| CodecError::MalformedEnvelope("non-UTF-8 element name".to_string()))?
        .to_string();

    let mut attributes = Vec::new();
    let mut frame: Vec<(Option<String>, String)> = Vec::new();

    for attr in e.attributes() {
        let attr =
            attr.map_err(|e| CodecError::MalformedEnvelope(format!("bad attribute: {e}")))?;
        let name = std::str::from_utf8(attr.key.as_ref())
            .map_err(|_| CodecError::MalformedEnvelope("non-UTF-8 attribute name".to_string()))?
            .to_string();
        let raw = String::from_utf8_lossy(attr.value.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| CodecError::MalformedEnvelope(format!("bad attribute value: {e}")))?
            .into_owned();

        if name == "xmlns" {
            frame.push((None, value.clone()));
        } else if let Some(prefix) = name.strip_prefix("xmlns:") {
            frame.push((Some(prefix.to_string()), value.clone()));
        }
        attributes.push(XmlAttribute {
            name,
            value,
            raw: Some(raw),
        });
    }

    let (prefix, local) = match qname.split_once(':') {
        Some((p, l)) => (Some(p.to_string()), l.to_string()),
        None => (None, qname.clone()),
    };

    let namespace = resolve_namespace(prefix.as_deref(), &frame, scopes);

    Ok((
        XmlElement {
            prefix,
            local,
            namespace,
            attributes,
            children: Vec::new(),
        },
        frame,
    ))
}

fn resolve_namespace(
    prefix: Option<&str>,
    own: &[(Option<String>, String)],
    scopes: &[Vec<(Option<String>, String)>],
) -> Option<String> {
    let lookup = |frame: &[(Option<String>, String)]| {
        frame
            .iter()
            .rev()
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, uri)| uri.clone())
    };
    if let Some(uri) = lookup(own) {
        return Some(uri);
    }
    for frame in scopes.iter().rev() {
        if let Some(uri) = lookup(frame) {
            return Some(uri);
        }
    }
    None
}
