//! Transformation of extracted ICSRs into loadable CSV buffers
//!
//! Normalized mode fans each record out into one in-memory CSV buffer per
//! target table; audit mode produces a single buffer of JSON payload rows.
//! Both modes deduplicate within the file to the newest version per
//! safetyreportid (later document order wins ties), so staging primary keys
//! are always unique. Buffers are handed to the loader rewound, with a
//! mandatory header row, `\n` line terminator, and conventional
//! doubled-quote escaping; an empty field is a SQL NULL under
//! `COPY ... WITH (FORMAT csv)`.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, SecondsFormat, Utc};
use evload_common::EtlError;

use crate::extract::{AuditRecord, Extracted, IcsrRecord, RecordError};
use crate::schema;

/// A finished in-memory CSV buffer, positioned at the start
#[derive(Debug, Clone, Default)]
pub struct CsvBuffer {
    bytes: Vec<u8>,
}

impl CsvBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Incremental CSV writer for one table
struct TableWriter {
    writer: csv::Writer<Vec<u8>>,
    rows: usize,
}

impl TableWriter {
    fn new(columns: &[&str]) -> Result<Self, EtlError> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record(columns)
            .map_err(|e| EtlError::database("csv header", e.to_string()))?;
        Ok(Self { writer, rows: 0 })
    }

    fn write_row<'a>(&mut self, fields: impl IntoIterator<Item = &'a str>) -> Result<(), EtlError> {
        self.writer
            .write_record(fields)
            .map_err(|e| EtlError::database("csv row", e.to_string()))?;
        self.rows += 1;
        Ok(())
    }

    fn finish(self) -> Result<(CsvBuffer, usize), EtlError> {
        let rows = self.rows;
        let bytes = self
            .writer
            .into_inner()
            .map_err(|e| EtlError::database("csv flush", e.to_string()))?;
        Ok((CsvBuffer { bytes }, rows))
    }
}

fn opt(field: &Option<String>) -> &str {
    field.as_deref().unwrap_or("")
}

/// Per-table CSV buffers and counts for one file, normalized schema
#[derive(Debug)]
pub struct NormalizedBatch {
    /// One buffer per target table, keyed by table name; all tables are
    /// present even when empty of rows.
    pub buffers: BTreeMap<&'static str, CsvBuffer>,
    pub row_counts: BTreeMap<&'static str, usize>,
    pub errors: Vec<RecordError>,
}

impl NormalizedBatch {
    /// Total data rows across all tables
    pub fn total_rows(&self) -> u64 {
        self.row_counts.values().map(|c| *c as u64).sum()
    }
}

/// Single-buffer batch for the audit schema
#[derive(Debug)]
pub struct AuditBatch {
    pub buffer: CsvBuffer,
    pub row_count: usize,
    pub errors: Vec<RecordError>,
}

/// Keep the newer of two versions; `None` loses to `Some`, ties go to the
/// later record (last write in document order wins).
fn newer(existing: &Option<String>, candidate: &Option<String>) -> bool {
    candidate >= existing
}

/// Consume the extraction sequence and fan records out into per-table CSV
/// buffers. A batch-level extraction error aborts the transform.
pub fn transform_normalized<I>(stream: I) -> Result<NormalizedBatch, EtlError>
where
    I: IntoIterator<Item = Result<Extracted<IcsrRecord>, EtlError>>,
{
    let mut errors = Vec::new();
    let mut records: Vec<IcsrRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for item in stream {
        match item? {
            Extracted::Invalid(error) => errors.push(error),
            Extracted::Record(record) => match index.get(&record.safetyreportid) {
                Some(&slot) => {
                    if newer(
                        &records[slot].date_of_most_recent_info,
                        &record.date_of_most_recent_info,
                    ) {
                        records[slot] = record;
                    }
                }
                None => {
                    index.insert(record.safetyreportid.clone(), records.len());
                    records.push(record);
                }
            },
        }
    }

    let mut writers: BTreeMap<&'static str, TableWriter> = BTreeMap::new();
    for table in schema::NORMALIZED_TABLES {
        writers.insert(table.name, TableWriter::new(table.columns)?);
    }

    for record in &records {
        let id = record.safetyreportid.as_str();
        let nullified = if record.is_nullified { "true" } else { "false" };

        if let Some(writer) = writers.get_mut(schema::ICSR_MASTER.name) {
            writer.write_row([
                id,
                opt(&record.senderidentifier),
                opt(&record.receiveridentifier),
                opt(&record.receiptdate),
                opt(&record.date_of_most_recent_info),
                opt(&record.reportercountry),
                opt(&record.qualification),
                nullified,
            ])?;
        }

        if let Some(patient) = &record.patient {
            if let Some(writer) = writers.get_mut(schema::PATIENT_CHARACTERISTICS.name) {
                writer.write_row([
                    id,
                    opt(&patient.patientinitials),
                    opt(&patient.patientonsetage),
                    opt(&patient.patientsex),
                ])?;
            }
        }

        if let Some(writer) = writers.get_mut(schema::REACTIONS.name) {
            for reaction in &record.reactions {
                writer.write_row([
                    id,
                    reaction.primarysourcereaction.as_str(),
                    opt(&reaction.reactionmeddrapt),
                ])?;
            }
        }

        for drug in &record.drugs {
            let seq = drug.drug_seq.to_string();
            if let Some(writer) = writers.get_mut(schema::DRUGS.name) {
                writer.write_row([
                    id,
                    seq.as_str(),
                    opt(&drug.drugcharacterization),
                    opt(&drug.medicinalproduct),
                    opt(&drug.drugstructuredosagenumb),
                    opt(&drug.drugstructuredosageunit),
                    opt(&drug.drugdosagetext),
                ])?;
            }
            if let Some(writer) = writers.get_mut(schema::DRUG_SUBSTANCES.name) {
                for substance in &drug.substances {
                    writer.write_row([id, seq.as_str(), substance.as_str()])?;
                }
            }
        }

        if let Some(writer) = writers.get_mut(schema::TESTS_PROCEDURES.name) {
            for test in &record.tests {
                writer.write_row([
                    id,
                    test.testname.as_str(),
                    opt(&test.testdate),
                    opt(&test.testresult),
                    opt(&test.testresultunit),
                    opt(&test.testcomments),
                ])?;
            }
        }

        if let Some(narrative) = &record.narrative {
            if let Some(writer) = writers.get_mut(schema::CASE_SUMMARY_NARRATIVE.name) {
                writer.write_row([id, narrative.as_str()])?;
            }
        }
    }

    let mut buffers = BTreeMap::new();
    let mut row_counts = BTreeMap::new();
    for (name, writer) in writers {
        let (buffer, rows) = writer.finish()?;
        buffers.insert(name, buffer);
        row_counts.insert(name, rows);
    }

    Ok(NormalizedBatch {
        buffers,
        row_counts,
        errors,
    })
}

/// Consume the audit extraction sequence into one CSV buffer, keeping only
/// the newest receiptdate per safetyreportid within the file.
pub fn transform_audit<I>(stream: I, loaded_at: DateTime<Utc>) -> Result<AuditBatch, EtlError>
where
    I: IntoIterator<Item = Result<Extracted<AuditRecord>, EtlError>>,
{
    let mut errors = Vec::new();
    let mut records: Vec<AuditRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for item in stream {
        match item? {
            Extracted::Invalid(error) => errors.push(error),
            Extracted::Record(record) => match index.get(&record.safetyreportid) {
                Some(&slot) => {
                    if newer(&records[slot].receiptdate, &record.receiptdate) {
                        records[slot] = record;
                    }
                }
                None => {
                    index.insert(record.safetyreportid.clone(), records.len());
                    records.push(record);
                }
            },
        }
    }

    let timestamp = loaded_at.to_rfc3339_opts(SecondsFormat::Micros, true);
    let mut writer = TableWriter::new(schema::ICSR_AUDIT_LOG.columns)?;
    for record in &records {
        let payload = serde_json::to_string(&record.payload)?;
        writer.write_row([
            record.safetyreportid.as_str(),
            opt(&record.receiptdate),
            payload.as_str(),
            timestamp.as_str(),
        ])?;
    }

    let (buffer, row_count) = writer.finish()?;
    Ok(AuditBatch {
        buffer,
        row_count,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{Drug, Patient, Reaction};
    use serde_json::json;

    fn record(id: &str, version: &str) -> IcsrRecord {
        IcsrRecord {
            safetyreportid: id.to_string(),
            receiptdate: Some(version.to_string()),
            date_of_most_recent_info: Some(version.to_string()),
            ..Default::default()
        }
    }

    fn rows(buffer: &CsvBuffer) -> Vec<Vec<String>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(buffer.as_bytes());
        reader
            .records()
            .map(|r| r.unwrap().iter().map(|f| f.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_fan_out_and_counts() {
        let mut first = record("TEST-CASE-001", "20240101");
        first.senderidentifier = Some("SENDER1".to_string());
        first.qualification = Some("Physician".to_string());
        first.patient = Some(Patient {
            patientinitials: Some("FN".to_string()),
            patientonsetage: Some("55".to_string()),
            patientsex: Some("1".to_string()),
        });
        first.reactions = vec![
            Reaction {
                primarysourcereaction: "Nausea".to_string(),
                reactionmeddrapt: Some("Nausea".to_string()),
            },
            Reaction {
                primarysourcereaction: "Headache".to_string(),
                reactionmeddrapt: Some("Headache".to_string()),
            },
        ];
        first.drugs = vec![
            Drug {
                drug_seq: 1,
                medicinalproduct: Some("DrugA".to_string()),
                substances: vec!["SubstanceX".to_string()],
                ..Default::default()
            },
            Drug {
                drug_seq: 2,
                medicinalproduct: Some("DrugB".to_string()),
                substances: vec!["SubstanceY".to_string(), "SubstanceZ".to_string()],
                ..Default::default()
            },
        ];

        let mut second = record("TEST-CASE-002", "20240102");
        second.is_nullified = true;

        let batch = transform_normalized(vec![
            Ok(Extracted::Record(first)),
            Ok(Extracted::Record(second)),
        ])
        .unwrap();

        assert!(batch.errors.is_empty());
        assert_eq!(batch.row_counts["icsr_master"], 2);
        assert_eq!(batch.row_counts["patient_characteristics"], 1);
        assert_eq!(batch.row_counts["reactions"], 2);
        assert_eq!(batch.row_counts["drugs"], 2);
        assert_eq!(batch.row_counts["drug_substances"], 3);
        assert_eq!(batch.row_counts["tests_procedures"], 0);
        assert_eq!(batch.row_counts["case_summary_narrative"], 0);
        assert_eq!(batch.total_rows(), 10);

        let master = rows(&batch.buffers["icsr_master"]);
        assert_eq!(master[0][0], "TEST-CASE-001");
        assert_eq!(master[0][1], "SENDER1");
        assert_eq!(master[0][7], "false");
        assert_eq!(master[1][0], "TEST-CASE-002");
        assert_eq!(master[1][7], "true");

        let substances = rows(&batch.buffers["drug_substances"]);
        assert_eq!(substances.len(), 3);
        assert_eq!(substances[1], vec!["TEST-CASE-001", "2", "SubstanceY"]);
    }

    #[test]
    fn test_header_present_even_when_empty() {
        let batch = transform_normalized(Vec::new()).unwrap();
        for table in schema::NORMALIZED_TABLES {
            let buffer = &batch.buffers[table.name];
            let text = std::str::from_utf8(buffer.as_bytes()).unwrap();
            let header = text.lines().next().unwrap();
            assert_eq!(header, table.columns.join(","));
        }
    }

    #[test]
    fn test_csv_quoting_round_trip() {
        let mut tricky = record("QUOTE-1", "20240101");
        tricky.narrative = Some("line one\nline \"two\", with comma".to_string());

        let batch = transform_normalized(vec![Ok(Extracted::Record(tricky))]).unwrap();
        let narrative_rows = rows(&batch.buffers["case_summary_narrative"]);
        assert_eq!(narrative_rows.len(), 1);
        assert_eq!(narrative_rows[0][1], "line one\nline \"two\", with comma");

        let text = std::str::from_utf8(batch.buffers["case_summary_narrative"].as_bytes()).unwrap();
        assert!(text.contains("\"\"two\"\""), "quotes must be doubled: {text}");
        assert!(!text.contains('\r'));
    }

    #[test]
    fn test_in_file_dedup_keeps_newest_version() {
        let batch = transform_normalized(vec![
            Ok(Extracted::Record(record("DUP-1", "20240101"))),
            Ok(Extracted::Record(record("DUP-1", "20240301"))),
            Ok(Extracted::Record(record("DUP-1", "20240201"))),
        ])
        .unwrap();

        assert_eq!(batch.row_counts["icsr_master"], 1);
        let master = rows(&batch.buffers["icsr_master"]);
        assert_eq!(master[0][4], "20240301");
    }

    #[test]
    fn test_dedup_tie_last_write_wins() {
        let mut a = record("TIE-1", "20240101");
        a.senderidentifier = Some("FIRST".to_string());
        let mut b = record("TIE-1", "20240101");
        b.senderidentifier = Some("SECOND".to_string());

        let batch =
            transform_normalized(vec![Ok(Extracted::Record(a)), Ok(Extracted::Record(b))])
                .unwrap();
        let master = rows(&batch.buffers["icsr_master"]);
        assert_eq!(master[0][1], "SECOND");
    }

    #[test]
    fn test_record_errors_accumulate() {
        let batch = transform_normalized(vec![
            Ok(Extracted::Record(record("OK-1", "20240101"))),
            Ok(Extracted::Invalid(RecordError {
                ordinal: 2,
                reason: "missing required field: safetyreportid".to_string(),
            })),
        ])
        .unwrap();
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.row_counts["icsr_master"], 1);
    }

    #[test]
    fn test_batch_error_propagates() {
        let result = transform_normalized(vec![
            Ok(Extracted::Record(record("OK-1", "20240101"))),
            Err(EtlError::not_well_formed("truncated")),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_audit_dedup_and_payload() {
        let older = AuditRecord {
            safetyreportid: "A-1".to_string(),
            receiptdate: Some("20240101".to_string()),
            payload: json!({"safetyreport": {"safetyreportid": "A-1", "v": "old"}}),
        };
        let newer = AuditRecord {
            safetyreportid: "A-1".to_string(),
            receiptdate: Some("20240301".to_string()),
            payload: json!({"safetyreport": {"safetyreportid": "A-1", "v": "new"}}),
        };
        let other = AuditRecord {
            safetyreportid: "B-2".to_string(),
            receiptdate: None,
            payload: json!({"safetyreport": {"safetyreportid": "B-2"}}),
        };

        let loaded_at = "2024-06-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let batch = transform_audit(
            vec![
                Ok(Extracted::Record(older)),
                Ok(Extracted::Record(newer)),
                Ok(Extracted::Record(other)),
            ],
            loaded_at,
        )
        .unwrap();

        assert_eq!(batch.row_count, 2);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(batch.buffer.as_bytes());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows[0].get(0), Some("A-1"));
        assert_eq!(rows[0].get(1), Some("20240301"));
        let payload: serde_json::Value = serde_json::from_str(rows[0].get(2).unwrap()).unwrap();
        assert_eq!(payload["safetyreport"]["v"], "new");
        assert_eq!(rows[1].get(0), Some("B-2"));
        assert_eq!(rows[1].get(1), Some(""));
    }
}
