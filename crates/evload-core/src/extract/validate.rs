//! Streaming structural validation against an XSD
//!
//! The validator reads the schema's element declarations and required-child
//! sequences once, then streams a document against them in the same
//! event-driven manner as extraction. Checked: root element is declared,
//! elements are bound to the target namespace, children are declared for
//! their parent type, and required children are present. Simple-type facets
//! (patterns, enumerations) are out of scope.
//!
//! Validation is independent of extraction; the two are never composed into
//! a single pass over a file.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use evload_common::EtlError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;

const XSD_NAMESPACE: &[u8] = b"http://www.w3.org/2001/XMLSchema";

/// Stop collecting after this many messages; the file is long rejected
const MAX_MESSAGES: usize = 100;

#[derive(Debug, Clone)]
struct ChildDecl {
    name: String,
    type_name: Option<String>,
    required: bool,
}

#[derive(Debug, Clone, Default)]
struct TypeDef {
    children: Vec<ChildDecl>,
}

/// A parsed schema, reusable across files and threads
#[derive(Debug, Clone)]
pub struct XsdValidator {
    target_namespace: Option<String>,
    /// Global element name → type name
    elements: HashMap<String, Option<String>>,
    types: HashMap<String, TypeDef>,
}

/// Frames of the schema parser
enum XsdFrame {
    Element {
        name: String,
        type_name: Option<String>,
        required: bool,
    },
    ComplexType {
        name: Option<String>,
        children: Vec<ChildDecl>,
    },
    Choice,
    Other,
}

fn attribute(start: &BytesStart<'_>, name: &str) -> Result<Option<String>, EtlError> {
    let attr = start
        .try_get_attribute(name)
        .map_err(|e| EtlError::not_well_formed(e.to_string()))?;
    match attr {
        Some(a) => {
            let value = a
                .unescape_value()
                .map_err(|e| EtlError::not_well_formed(e.to_string()))?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

/// Strip any namespace prefix from a QName reference (`hl7:patientType`)
fn local_part(reference: &str) -> String {
    reference
        .rsplit(':')
        .next()
        .unwrap_or(reference)
        .to_string()
}

impl XsdValidator {
    /// Parse an XSD file into a validator
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EtlError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            EtlError::file_open(path.display().to_string(), e.to_string())
        })?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Parse an XSD from any reader
    pub fn from_reader<R: BufRead>(source: R) -> Result<Self, EtlError> {
        let mut reader = NsReader::from_reader(source);
        reader.config_mut().trim_text(true);
        reader.config_mut().expand_empty_elements = true;

        let mut validator = Self {
            target_namespace: None,
            elements: HashMap::new(),
            types: HashMap::new(),
        };
        let mut stack: Vec<XsdFrame> = Vec::new();
        let mut anon_counter = 0usize;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_resolved_event_into(&mut buf) {
                Err(e) => return Err(EtlError::not_well_formed(e.to_string())),
                Ok((resolve, Event::Start(e))) => {
                    let in_xsd = matches!(
                        &resolve,
                        ResolveResult::Bound(Namespace(ns)) if *ns == XSD_NAMESPACE
                    );
                    let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    if !in_xsd {
                        stack.push(XsdFrame::Other);
                        continue;
                    }
                    match local.as_str() {
                        "schema" => {
                            validator.target_namespace = attribute(&e, "targetNamespace")?;
                            stack.push(XsdFrame::Other);
                        }
                        "element" => {
                            let name = attribute(&e, "name")?.unwrap_or_default();
                            let type_name = attribute(&e, "type")?.map(|t| local_part(&t));
                            let required = attribute(&e, "minOccurs")?
                                .map(|m| m != "0")
                                .unwrap_or(true);
                            stack.push(XsdFrame::Element {
                                name,
                                type_name,
                                required,
                            });
                        }
                        "complexType" => {
                            stack.push(XsdFrame::ComplexType {
                                name: attribute(&e, "name")?,
                                children: Vec::new(),
                            });
                        }
                        "choice" => stack.push(XsdFrame::Choice),
                        _ => stack.push(XsdFrame::Other),
                    }
                }
                Ok((_, Event::End(_))) => {
                    let Some(frame) = stack.pop() else { continue };
                    match frame {
                        XsdFrame::Element {
                            name,
                            type_name,
                            required,
                        } => {
                            if name.is_empty() {
                                continue;
                            }
                            // A choice anywhere above makes the child optional
                            let in_choice = stack
                                .iter()
                                .rev()
                                .take_while(|f| !matches!(f, XsdFrame::ComplexType { .. }))
                                .any(|f| matches!(f, XsdFrame::Choice));
                            let decl = ChildDecl {
                                name: name.clone(),
                                type_name: type_name.clone(),
                                required: required && !in_choice,
                            };
                            match stack.iter_mut().rev().find_map(|f| match f {
                                XsdFrame::ComplexType { children, .. } => Some(children),
                                _ => None,
                            }) {
                                Some(children) => children.push(decl),
                                None => {
                                    validator.elements.insert(name, type_name);
                                }
                            }
                        }
                        XsdFrame::ComplexType { name, children } => {
                            let type_name = match name {
                                Some(n) => n,
                                None => {
                                    // Inline type: attach to the enclosing element
                                    anon_counter += 1;
                                    let anon = format!("#anon{}", anon_counter);
                                    if let Some(XsdFrame::Element { type_name, .. }) =
                                        stack.last_mut()
                                    {
                                        *type_name = Some(anon.clone());
                                    }
                                    anon
                                }
                            };
                            validator.types.insert(type_name, TypeDef { children });
                        }
                        _ => {}
                    }
                }
                Ok((_, Event::Eof)) => break,
                Ok(_) => {}
            }
        }

        if validator.elements.is_empty() {
            return Err(EtlError::config(
                "XSD declares no global elements",
                "check that the schema path points at an XML Schema document",
            ));
        }
        Ok(validator)
    }

    /// Stream a document against the schema, returning whether it is valid
    /// and the collected messages.
    pub fn validate<R: BufRead>(&self, source: R) -> (bool, Vec<String>) {
        let mut reader = NsReader::from_reader(source);
        reader.config_mut().trim_text(true);
        reader.config_mut().expand_empty_elements = true;

        struct Open {
            name: String,
            type_name: Option<String>,
            seen: Vec<String>,
        }

        let mut stack: Vec<Open> = Vec::new();
        let mut messages = Vec::new();
        let mut buf = Vec::new();

        loop {
            if messages.len() >= MAX_MESSAGES {
                break;
            }
            buf.clear();
            match reader.read_resolved_event_into(&mut buf) {
                Err(e) => {
                    messages.push(format!("document is not well-formed: {}", e));
                    break;
                }
                Ok((resolve, Event::Start(e))) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();

                    if let Some(expected_ns) = &self.target_namespace {
                        let bound = matches!(
                            &resolve,
                            ResolveResult::Bound(Namespace(ns)) if *ns == expected_ns.as_bytes()
                        );
                        if !bound {
                            messages.push(format!(
                                "element '{}' is not in namespace '{}'",
                                name, expected_ns
                            ));
                        }
                    }

                    let type_name = match stack.last_mut() {
                        None => match self.elements.get(&name) {
                            Some(type_name) => type_name.clone(),
                            None => {
                                messages.push(format!("unknown root element '{}'", name));
                                None
                            }
                        },
                        Some(parent) => {
                            parent.seen.push(name.clone());
                            match parent.type_name.as_ref().and_then(|t| self.types.get(t)) {
                                Some(parent_type) => {
                                    match parent_type.children.iter().find(|c| c.name == name) {
                                        Some(decl) => decl.type_name.clone(),
                                        None => {
                                            messages.push(format!(
                                                "unexpected element '{}' in '{}'",
                                                name, parent.name
                                            ));
                                            None
                                        }
                                    }
                                }
                                // Parent type is a builtin or unknown: content unchecked
                                None => None,
                            }
                        }
                    };

                    stack.push(Open {
                        name,
                        type_name,
                        seen: Vec::new(),
                    });
                }
                Ok((_, Event::End(_))) => {
                    let Some(open) = stack.pop() else { continue };
                    if let Some(type_def) =
                        open.type_name.as_ref().and_then(|t| self.types.get(t))
                    {
                        for child in &type_def.children {
                            if child.required && !open.seen.iter().any(|s| s == &child.name) {
                                messages.push(format!(
                                    "element '{}': missing required child element '{}'",
                                    open.name, child.name
                                ));
                            }
                        }
                    }
                }
                Ok((_, Event::Eof)) => break,
                Ok(_) => {}
            }
        }

        (messages.is_empty(), messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const XSD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
           xmlns:hl7="urn:hl7-org:v3"
           targetNamespace="urn:hl7-org:v3"
           elementFormDefault="qualified">
    <xs:element name="ichicsrMessage">
        <xs:complexType>
            <xs:sequence>
                <xs:element name="safetyreport" type="hl7:safetyreportType"/>
            </xs:sequence>
        </xs:complexType>
    </xs:element>
    <xs:complexType name="safetyreportType">
        <xs:sequence>
            <xs:element name="safetyreportid" type="xs:string"/>
            <xs:element name="patient" type="hl7:patientType"/>
        </xs:sequence>
    </xs:complexType>
    <xs:complexType name="patientType">
        <xs:sequence>
            <xs:element name="patientinitials" type="xs:string"/>
            <xs:element name="patientsex" type="xs:string"/>
        </xs:sequence>
    </xs:complexType>
</xs:schema>"#;

    fn validator() -> XsdValidator {
        XsdValidator::from_reader(Cursor::new(XSD.as_bytes().to_vec())).unwrap()
    }

    #[test]
    fn test_valid_document_passes() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ichicsrMessage xmlns="urn:hl7-org:v3">
    <safetyreport>
        <safetyreportid>TEST-VALID-001</safetyreportid>
        <patient>
            <patientinitials>AB</patientinitials>
            <patientsex>1</patientsex>
        </patient>
    </safetyreport>
</ichicsrMessage>"#;
        let (ok, messages) = validator().validate(Cursor::new(xml.as_bytes().to_vec()));
        assert!(ok, "unexpected messages: {:?}", messages);
        assert!(messages.is_empty());
    }

    #[test]
    fn test_missing_required_child_fails() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ichicsrMessage xmlns="urn:hl7-org:v3">
    <safetyreport>
        <safetyreportid>TEST-INVALID-001</safetyreportid>
        <patient>
            <patientinitials>CD</patientinitials>
        </patient>
    </safetyreport>
</ichicsrMessage>"#;
        let (ok, messages) = validator().validate(Cursor::new(xml.as_bytes().to_vec()));
        assert!(!ok);
        assert!(messages
            .iter()
            .any(|m| m.contains("missing required child element 'patientsex'")));
    }

    #[test]
    fn test_unknown_root_fails() {
        let xml = r#"<other xmlns="urn:hl7-org:v3"/>"#;
        let (ok, messages) = validator().validate(Cursor::new(xml.as_bytes().to_vec()));
        assert!(!ok);
        assert!(messages.iter().any(|m| m.contains("unknown root element")));
    }

    #[test]
    fn test_wrong_namespace_fails() {
        let xml = r#"<ichicsrMessage xmlns="urn:wrong"><safetyreport/></ichicsrMessage>"#;
        let (ok, messages) = validator().validate(Cursor::new(xml.as_bytes().to_vec()));
        assert!(!ok);
        assert!(messages
            .iter()
            .any(|m| m.contains("not in namespace 'urn:hl7-org:v3'")));
    }

    #[test]
    fn test_schema_without_elements_rejected() {
        let xsd = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"/>"#;
        assert!(XsdValidator::from_reader(Cursor::new(xsd.as_bytes().to_vec())).is_err());
    }
}
