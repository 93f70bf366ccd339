//! Streaming extraction of ICSR records from E2B(R3) XML
//!
//! The extractor consumes incremental parse events from a namespace-aware
//! reader and reacts on the end event of each `safetyreport` element, so a
//! file of any size is processed with memory bounded by the largest single
//! ICSR subtree. One bad record yields a [`RecordError`] and extraction
//! continues; only a document that is unparseable outside any record
//! context (or truncated inside one) aborts the file.

pub mod validate;

use std::io::BufRead;

use evload_common::EtlError;
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;
use serde_json::{json, Map, Value};

/// The E2B(R3) HL7 v3 namespace all matched elements must be bound to
pub const E2B_NAMESPACE: &[u8] = b"urn:hl7-org:v3";

/// Local name of the ICSR wrapper element
const ICSR_WRAPPER: &str = "safetyreport";

/// Nesting cap inside one record, against pathological documents
const MAX_SUBTREE_DEPTH: usize = 64;

/// A per-record extraction failure inside an otherwise well-formed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError {
    /// 1-based position of the record in the document
    pub ordinal: usize,
    pub reason: String,
}

/// One element of the extraction sequence
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted<T> {
    Record(T),
    Invalid(RecordError),
}

/// Flat field view of one ICSR, for the normalized schema
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IcsrRecord {
    pub safetyreportid: String,
    pub senderidentifier: Option<String>,
    pub receiveridentifier: Option<String>,
    pub receiptdate: Option<String>,
    /// Version key; falls back to `receiptdate` when the element is absent
    pub date_of_most_recent_info: Option<String>,
    pub reportercountry: Option<String>,
    pub qualification: Option<String>,
    pub is_nullified: bool,
    pub patient: Option<Patient>,
    pub reactions: Vec<Reaction>,
    pub drugs: Vec<Drug>,
    pub tests: Vec<TestProcedure>,
    pub narrative: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patient {
    pub patientinitials: Option<String>,
    pub patientonsetage: Option<String>,
    pub patientsex: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reaction {
    pub primarysourcereaction: String,
    pub reactionmeddrapt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Drug {
    /// Assigned by the extractor in document order, 1-based
    pub drug_seq: i32,
    pub drugcharacterization: Option<String>,
    pub medicinalproduct: Option<String>,
    pub drugstructuredosagenumb: Option<String>,
    pub drugstructuredosageunit: Option<String>,
    pub drugdosagetext: Option<String>,
    pub substances: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestProcedure {
    pub testname: String,
    pub testdate: Option<String>,
    pub testresult: Option<String>,
    pub testresultunit: Option<String>,
    pub testcomments: Option<String>,
}

/// Whole-subtree view of one ICSR, for the audit schema
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub safetyreportid: String,
    pub receiptdate: Option<String>,
    /// The full `safetyreport` subtree as a JSON tree: repeated siblings
    /// become arrays in document order, text-only elements flatten to
    /// string leaves, empty elements become null.
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// Subtree collection
// ---------------------------------------------------------------------------

enum SubtreeOutcome {
    Tree(Value),
    Malformed(String),
}

struct RawSubtree {
    ordinal: usize,
    outcome: SubtreeOutcome,
}

/// Frame of the push-down collector: one open element
struct Frame {
    key: String,
    text: String,
    children: Map<String, Value>,
}

impl Frame {
    fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            text: String::new(),
            children: Map::new(),
        }
    }
}

/// Collapse a closed element into its JSON value
fn finalize(frame: Frame) -> Value {
    if !frame.children.is_empty() {
        Value::Object(frame.children)
    } else {
        let text = frame.text.trim();
        if text.is_empty() {
            Value::Null
        } else {
            Value::String(text.to_string())
        }
    }
}

/// Add a closed child to its parent, aggregating repeated siblings into an
/// array that preserves document order.
fn insert_child(parent: &mut Frame, key: String, value: Value) {
    match parent.children.get_mut(&key) {
        None => {
            parent.children.insert(key, value);
        }
        Some(Value::Array(siblings)) => siblings.push(value),
        Some(slot) => {
            let prev = slot.take();
            *slot = Value::Array(vec![prev, value]);
        }
    }
}

/// Map a resolved element to its matching key. Elements bound to the E2B
/// namespace match by bare local name; a foreign namespace is kept in Clark
/// notation so it can never shadow an E2B field.
fn element_key(resolve: &ResolveResult, local: &[u8]) -> String {
    let local = String::from_utf8_lossy(local).into_owned();
    match resolve {
        ResolveResult::Bound(Namespace(ns)) if *ns == E2B_NAMESPACE => local,
        ResolveResult::Bound(Namespace(ns)) => {
            format!("{{{}}}{}", String::from_utf8_lossy(ns), local)
        }
        _ => local,
    }
}

fn is_icsr_wrapper(resolve: &ResolveResult, local: &[u8]) -> bool {
    matches!(resolve, ResolveResult::Bound(Namespace(ns)) if *ns == E2B_NAMESPACE)
        && local == ICSR_WRAPPER.as_bytes()
}

/// Streams `safetyreport` subtrees out of a batch document.
///
/// End-tag balance is accounted for by the collector itself (the parser's
/// own end-name checking is disabled) so a mismatched tag inside one record
/// can be reported per record and the stream resynchronized at the
/// wrapper's closing tag.
struct SubtreeReader<R: BufRead> {
    reader: NsReader<R>,
    buf: Vec<u8>,
    ordinal: usize,
}

impl<R: BufRead> SubtreeReader<R> {
    fn new(source: R) -> Self {
        let mut reader = NsReader::from_reader(source);
        let config = reader.config_mut();
        config.trim_text(true);
        config.expand_empty_elements = true;
        config.check_end_names = false;
        Self {
            reader,
            buf: Vec::new(),
            ordinal: 0,
        }
    }

    /// Advance to the next ICSR wrapper and collect its subtree.
    /// `Ok(None)` is end of document; `Err` is a batch-level failure.
    fn next_subtree(&mut self) -> Result<Option<RawSubtree>, EtlError> {
        loop {
            self.buf.clear();
            match self.reader.read_resolved_event_into(&mut self.buf) {
                Err(e) => return Err(EtlError::not_well_formed(e.to_string())),
                Ok((resolve, Event::Start(e))) => {
                    if is_icsr_wrapper(&resolve, e.local_name().as_ref()) {
                        self.ordinal += 1;
                        return self.collect_subtree().map(Some);
                    }
                }
                Ok((_, Event::Eof)) => return Ok(None),
                Ok(_) => {}
            }
        }
    }

    /// Collect one wrapper subtree into a JSON tree. Called with the
    /// wrapper's start event already consumed.
    fn collect_subtree(&mut self) -> Result<RawSubtree, EtlError> {
        let mut stack = vec![Frame::new(ICSR_WRAPPER)];

        loop {
            self.buf.clear();
            match self.reader.read_resolved_event_into(&mut self.buf) {
                Err(e) => return Err(EtlError::not_well_formed(e.to_string())),
                Ok((resolve, Event::Start(e))) => {
                    if stack.len() >= MAX_SUBTREE_DEPTH {
                        return self.resync("element nesting exceeds depth limit");
                    }
                    let key = element_key(&resolve, e.local_name().as_ref());
                    stack.push(Frame::new(key));
                }
                Ok((_, Event::Text(t))) => {
                    let text = t
                        .unescape()
                        .map_err(|e| EtlError::not_well_formed(e.to_string()))?;
                    if let Some(frame) = stack.last_mut() {
                        frame.text.push_str(&text);
                    }
                }
                Ok((_, Event::CData(t))) => {
                    if let Some(frame) = stack.last_mut() {
                        frame.text.push_str(&String::from_utf8_lossy(&t.into_inner()));
                    }
                }
                Ok((resolve, Event::End(e))) => {
                    let key = element_key(&resolve, e.local_name().as_ref());
                    if stack.len() == 1 {
                        return if key == ICSR_WRAPPER {
                            let frame = stack.remove(0);
                            Ok(RawSubtree {
                                ordinal: self.ordinal,
                                outcome: SubtreeOutcome::Tree(finalize(frame)),
                            })
                        } else {
                            self.resync(format!("unexpected closing tag '{}'", key))
                        };
                    }
                    let Some(frame) = stack.pop() else { continue };
                    if frame.key != key {
                        let reason = format!(
                            "mismatched closing tag '{}' (expected '{}')",
                            key, frame.key
                        );
                        if key == ICSR_WRAPPER {
                            // The wrapper closed early; the record is
                            // malformed but the stream is already aligned.
                            return Ok(RawSubtree {
                                ordinal: self.ordinal,
                                outcome: SubtreeOutcome::Malformed(reason),
                            });
                        }
                        return self.resync(reason);
                    }
                    let value = finalize(frame);
                    if let Some(parent) = stack.last_mut() {
                        insert_child(parent, key, value);
                    }
                }
                Ok((_, Event::Eof)) => {
                    return Err(EtlError::not_well_formed(
                        "unexpected end of document inside an ICSR record",
                    ));
                }
                Ok(_) => {}
            }
        }
    }

    /// Skip to the current wrapper's closing tag after a malformed subtree,
    /// yielding a per-record error instead of failing the file.
    fn resync(&mut self, reason: impl Into<String>) -> Result<RawSubtree, EtlError> {
        let reason = reason.into();
        loop {
            self.buf.clear();
            match self.reader.read_resolved_event_into(&mut self.buf) {
                Err(e) => return Err(EtlError::not_well_formed(e.to_string())),
                Ok((resolve, Event::End(e)))
                    if is_icsr_wrapper(&resolve, e.local_name().as_ref()) =>
                {
                    return Ok(RawSubtree {
                        ordinal: self.ordinal,
                        outcome: SubtreeOutcome::Malformed(reason),
                    });
                }
                Ok((resolve, Event::Start(e)))
                    if is_icsr_wrapper(&resolve, e.local_name().as_ref()) =>
                {
                    // A new record opened before the broken one closed;
                    // the batch structure itself is unusable from here.
                    return Err(EtlError::not_well_formed(format!(
                        "ICSR record #{} is missing its closing tag",
                        self.ordinal
                    )));
                }
                Ok((_, Event::Eof)) => {
                    return Err(EtlError::not_well_formed(
                        "unexpected end of document inside an ICSR record",
                    ));
                }
                Ok(_) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Extraction streams
// ---------------------------------------------------------------------------

/// Lazy sequence of flat ICSR records for the normalized schema
pub struct NormalizedStream<R: BufRead> {
    inner: SubtreeReader<R>,
    done: bool,
}

impl<R: BufRead> NormalizedStream<R> {
    pub fn new(source: R) -> Self {
        Self {
            inner: SubtreeReader::new(source),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for NormalizedStream<R> {
    type Item = Result<Extracted<IcsrRecord>, EtlError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next_subtree() {
            Ok(None) => {
                self.done = true;
                None
            }
            Ok(Some(raw)) => Some(Ok(match raw.outcome {
                SubtreeOutcome::Tree(tree) => normalized_from_tree(raw.ordinal, &tree),
                SubtreeOutcome::Malformed(reason) => Extracted::Invalid(RecordError {
                    ordinal: raw.ordinal,
                    reason,
                }),
            })),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Lazy sequence of whole-subtree records for the audit schema
pub struct AuditStream<R: BufRead> {
    inner: SubtreeReader<R>,
    done: bool,
}

impl<R: BufRead> AuditStream<R> {
    pub fn new(source: R) -> Self {
        Self {
            inner: SubtreeReader::new(source),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for AuditStream<R> {
    type Item = Result<Extracted<AuditRecord>, EtlError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next_subtree() {
            Ok(None) => {
                self.done = true;
                None
            }
            Ok(Some(raw)) => Some(Ok(match raw.outcome {
                SubtreeOutcome::Tree(tree) => audit_from_tree(raw.ordinal, tree),
                SubtreeOutcome::Malformed(reason) => Extracted::Invalid(RecordError {
                    ordinal: raw.ordinal,
                    reason,
                }),
            })),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Field extraction from a collected subtree
// ---------------------------------------------------------------------------

/// Unwrap a repeated element to its first occurrence
fn first(value: &Value) -> &Value {
    match value {
        Value::Array(items) => items.first().unwrap_or(&Value::Null),
        other => other,
    }
}

fn descend<'a>(tree: &'a Value, key: &str) -> Option<&'a Value> {
    tree.as_object()?.get(key).map(first)
}

/// Non-empty text content at a path of element names
fn text_at(tree: &Value, path: &[&str]) -> Option<String> {
    let mut current = tree;
    for key in path {
        current = descend(current, key)?;
    }
    match current {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Collect every element named `name` anywhere in the subtree, in document
/// order, flattening repeated siblings.
fn collect_elements<'a>(tree: &'a Value, name: &str, out: &mut Vec<&'a Value>) {
    match tree {
        Value::Object(map) => {
            for (key, value) in map {
                if key == name {
                    match value {
                        Value::Array(items) => out.extend(items.iter()),
                        other => out.push(other),
                    }
                } else {
                    collect_elements(value, name, out);
                }
            }
        }
        Value::Array(items) => {
            for value in items {
                collect_elements(value, name, out);
            }
        }
        _ => {}
    }
}

/// Whether the record denotes a nullification of a previous transmission
fn is_nullification(tree: &Value) -> bool {
    if let Some(reporttype) = text_at(tree, &["reporttype"]) {
        if reporttype.eq_ignore_ascii_case("nullification") {
            return true;
        }
    }
    if let Some(flag) = text_at(tree, &["casenullification"]) {
        if flag == "1" || flag.eq_ignore_ascii_case("true") {
            return true;
        }
    }
    false
}

fn normalized_from_tree(ordinal: usize, tree: &Value) -> Extracted<IcsrRecord> {
    let Some(safetyreportid) = text_at(tree, &["safetyreportid"]) else {
        return Extracted::Invalid(RecordError {
            ordinal,
            reason: "missing required field: safetyreportid".to_string(),
        });
    };

    let receiptdate = text_at(tree, &["receiptdate"]);
    let date_of_most_recent_info =
        text_at(tree, &["date_of_most_recent_info"]).or_else(|| receiptdate.clone());

    let patient = descend(tree, "patient").map(|p| Patient {
        patientinitials: text_at(p, &["patientinitials"]),
        patientonsetage: text_at(p, &["patientonsetage"]),
        patientsex: text_at(p, &["patientsex"]),
    });
    let patient = patient.filter(|p| {
        p.patientinitials.is_some() || p.patientonsetage.is_some() || p.patientsex.is_some()
    });

    let mut reaction_nodes = Vec::new();
    collect_elements(tree, "reaction", &mut reaction_nodes);
    let reactions = reaction_nodes
        .iter()
        .filter_map(|node| {
            text_at(node, &["primarysourcereaction"]).map(|primarysourcereaction| Reaction {
                primarysourcereaction,
                reactionmeddrapt: text_at(node, &["reactionmeddrapt"]),
            })
        })
        .collect();

    let mut drug_nodes = Vec::new();
    collect_elements(tree, "drug", &mut drug_nodes);
    let drugs = drug_nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| {
            let mut substance_nodes = Vec::new();
            collect_elements(node, "activesubstance", &mut substance_nodes);
            let substances = substance_nodes
                .iter()
                .filter_map(|s| text_at(s, &["activesubstancename"]))
                .collect();
            Drug {
                drug_seq: idx as i32 + 1,
                drugcharacterization: text_at(node, &["drugcharacterization"]),
                medicinalproduct: text_at(node, &["medicinalproduct"]),
                drugstructuredosagenumb: text_at(node, &["drugstructuredosagenumb"]),
                drugstructuredosageunit: text_at(node, &["drugstructuredosageunit"]),
                drugdosagetext: text_at(node, &["drugdosagetext"]),
                substances,
            }
        })
        .collect();

    let mut test_nodes = Vec::new();
    collect_elements(tree, "test", &mut test_nodes);
    let tests = test_nodes
        .iter()
        .filter_map(|node| {
            text_at(node, &["testname"]).map(|testname| TestProcedure {
                testname,
                testdate: text_at(node, &["testdate"]),
                testresult: text_at(node, &["testresult"]),
                testresultunit: text_at(node, &["testresultunit"]),
                testcomments: text_at(node, &["testcomments"]),
            })
        })
        .collect();

    let mut narrative_nodes = Vec::new();
    collect_elements(tree, "narrativeincludeclinical", &mut narrative_nodes);
    let narrative = narrative_nodes.first().and_then(|n| match n {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    });

    Extracted::Record(IcsrRecord {
        safetyreportid,
        senderidentifier: text_at(tree, &["sender", "senderid"]),
        receiveridentifier: text_at(tree, &["receiver", "receiverid"]),
        receiptdate,
        date_of_most_recent_info,
        reportercountry: text_at(tree, &["primarysource", "reportercountry"]),
        qualification: text_at(tree, &["primarysource", "qualification"]),
        is_nullified: is_nullification(tree),
        patient,
        reactions,
        drugs,
        tests,
        narrative,
    })
}

fn audit_from_tree(ordinal: usize, tree: Value) -> Extracted<AuditRecord> {
    let Some(safetyreportid) = text_at(&tree, &["safetyreportid"]) else {
        return Extracted::Invalid(RecordError {
            ordinal,
            reason: "missing required field: safetyreportid".to_string(),
        });
    };
    let receiptdate = text_at(&tree, &["receiptdate"]);

    Extracted::Record(AuditRecord {
        safetyreportid,
        receiptdate,
        payload: json!({ "safetyreport": tree }),
    })
}
