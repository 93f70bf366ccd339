//! End-to-end extraction + transformation tests (no database)
//!
//! These drive the same path a worker runs up to the loader boundary:
//! XML bytes → streaming extraction → CSV buffers.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use evload_core::extract::{AuditStream, NormalizedStream};
use evload_core::transform::{transform_audit, transform_normalized, NormalizedBatch};

fn transform(xml: &str) -> NormalizedBatch {
    let stream = NormalizedStream::new(Cursor::new(xml.as_bytes().to_vec()));
    transform_normalized(stream).expect("transform failed")
}

fn rows(batch: &NormalizedBatch, table: &str) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(batch.buffers[table].as_bytes());
    reader
        .records()
        .map(|r| r.unwrap().iter().map(|f| f.to_string()).collect())
        .collect()
}

const BATCH: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ichicsrMessage xmlns="urn:hl7-org:v3">
  <safetyreport>
    <safetyreportid>CASE-001</safetyreportid>
    <receiptdate>20240101</receiptdate>
    <date_of_most_recent_info>20240101</date_of_most_recent_info>
    <sender><senderid>SENDER-A</senderid></sender>
    <receiver><receiverid>RECEIVER-A</receiverid></receiver>
    <primarysource>
      <reportercountry>US</reportercountry>
      <qualification>Physician</qualification>
    </primarysource>
    <patient>
      <patientinitials>FN</patientinitials>
      <patientonsetage>55</patientonsetage>
      <patientsex>1</patientsex>
      <reaction>
        <primarysourcereaction>Nausea</primarysourcereaction>
        <reactionmeddrapt>Nausea</reactionmeddrapt>
      </reaction>
      <drug>
        <drugcharacterization>1</drugcharacterization>
        <medicinalproduct>Drug, with "comma"</medicinalproduct>
        <drugdosagetext>10 mg</drugdosagetext>
        <activesubstance><activesubstancename>SubstanceX</activesubstancename></activesubstance>
      </drug>
      <summary>
        <narrativeincludeclinical>First line.
Second line with &amp; entity.</narrativeincludeclinical>
      </summary>
    </patient>
  </safetyreport>
  <safetyreport>
    <safetyreportid>CASE-002</safetyreportid>
    <receiptdate>20240105</receiptdate>
  </safetyreport>
</ichicsrMessage>
"#;

#[test]
fn test_batch_fans_out_into_all_tables() {
    let batch = transform(BATCH);

    assert!(batch.errors.is_empty());
    assert_eq!(batch.row_counts["icsr_master"], 2);
    assert_eq!(batch.row_counts["patient_characteristics"], 1);
    assert_eq!(batch.row_counts["reactions"], 1);
    assert_eq!(batch.row_counts["drugs"], 1);
    assert_eq!(batch.row_counts["drug_substances"], 1);
    assert_eq!(batch.row_counts["case_summary_narrative"], 1);

    let master = rows(&batch, "icsr_master");
    assert_eq!(master[0][0], "CASE-001");
    assert_eq!(master[0][1], "SENDER-A");
    assert_eq!(master[0][2], "RECEIVER-A");
    assert_eq!(master[0][5], "US");
    assert_eq!(master[0][6], "Physician");
    // CASE-002 has no date_of_most_recent_info; receiptdate stands in
    assert_eq!(master[1][4], "20240105");
}

#[test]
fn test_csv_survives_commas_quotes_and_newlines() {
    let batch = transform(BATCH);

    let drugs = rows(&batch, "drugs");
    assert_eq!(drugs[0][3], "Drug, with \"comma\"");

    let narrative = rows(&batch, "case_summary_narrative");
    assert_eq!(
        narrative[0][1],
        "First line.\nSecond line with & entity."
    );
}

#[test]
fn test_malformed_record_does_not_poison_batch() {
    let xml = r#"<ichicsrMessage xmlns="urn:hl7-org:v3">
  <safetyreport>
    <safetyreportid>GOOD-1</safetyreportid>
    <receiptdate>20240101</receiptdate>
  </safetyreport>
  <safetyreport>
    <safetyreportid>BAD-2</safetyreportid>
    <patient><patientinitials>XY</wrongtag>
  </safetyreport>
  <safetyreport>
    <safetyreportid>GOOD-3</safetyreportid>
    <receiptdate>20240103</receiptdate>
  </safetyreport>
</ichicsrMessage>"#;

    let batch = transform(xml);
    assert_eq!(batch.errors.len(), 1);
    assert_eq!(batch.errors[0].ordinal, 2);
    assert_eq!(batch.row_counts["icsr_master"], 2);

    let master = rows(&batch, "icsr_master");
    let ids: Vec<&str> = master.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(ids, vec!["GOOD-1", "GOOD-3"]);
}

#[test]
fn test_audit_pipeline_dedupes_to_newest_receiptdate() {
    let xml = r#"<ichicsrMessage xmlns="urn:hl7-org:v3">
  <safetyreport>
    <safetyreportid>DUP-1</safetyreportid>
    <receiptdate>20240101</receiptdate>
    <patient><patientinitials>AA</patientinitials></patient>
  </safetyreport>
  <safetyreport>
    <safetyreportid>DUP-1</safetyreportid>
    <receiptdate>20240301</receiptdate>
    <patient><patientinitials>BB</patientinitials></patient>
  </safetyreport>
</ichicsrMessage>"#;

    let loaded_at: DateTime<Utc> = "2024-06-01T00:00:00Z".parse().unwrap();
    let stream = AuditStream::new(Cursor::new(xml.as_bytes().to_vec()));
    let batch = transform_audit(stream, loaded_at).unwrap();

    assert_eq!(batch.row_count, 1);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(batch.buffer.as_bytes());
    let record = reader.records().next().unwrap().unwrap();
    assert_eq!(record.get(0), Some("DUP-1"));
    assert_eq!(record.get(1), Some("20240301"));

    let payload: serde_json::Value = serde_json::from_str(record.get(2).unwrap()).unwrap();
    assert_eq!(payload["safetyreport"]["patient"]["patientinitials"], "BB");
}

#[test]
fn test_nullification_flows_through_to_master_flag() {
    let xml = r#"<ichicsrMessage xmlns="urn:hl7-org:v3">
  <safetyreport>
    <safetyreportid>NULL-1</safetyreportid>
    <receiptdate>20231201</receiptdate>
    <reporttype>Nullification</reporttype>
  </safetyreport>
</ichicsrMessage>"#;

    let batch = transform(xml);
    let master = rows(&batch, "icsr_master");
    assert_eq!(master[0][7], "true");
}
