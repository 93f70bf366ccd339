//! Table catalog for the normalized and audit schemas
//!
//! The column order defined here is the deterministic order the transformer
//! writes CSV columns in and the loader COPYs them in; the two must stay in
//! sync. DDL is idempotent (`CREATE TABLE IF NOT EXISTS`).

use serde::{Deserialize, Serialize};

/// Which persisted representation a run targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    /// Flat relational schema for analytics
    #[default]
    Normalized,
    /// Provenance-preserving JSON audit schema
    Audit,
}

impl std::str::FromStr for SchemaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normalized" => Ok(SchemaType::Normalized),
            "audit" => Ok(SchemaType::Audit),
            _ => Err(anyhow::anyhow!(
                "schema_type must be either 'normalized' or 'audit', got '{}'",
                s
            )),
        }
    }
}

impl std::fmt::Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaType::Normalized => write!(f, "normalized"),
            SchemaType::Audit => write!(f, "audit"),
        }
    }
}

/// Static definition of one target table
#[derive(Debug)]
pub struct TableDef {
    pub name: &'static str,
    /// Columns in CSV/COPY order
    pub columns: &'static [&'static str],
    pub primary_key: &'static [&'static str],
    /// Version-gate column, when the table has one
    pub version_key: Option<&'static str>,
    /// Whether the table carries the nullification flag
    pub has_nullified_flag: bool,
    pub ddl: &'static str,
}

pub const ICSR_MASTER: TableDef = TableDef {
    name: "icsr_master",
    columns: &[
        "safetyreportid",
        "senderidentifier",
        "receiveridentifier",
        "receiptdate",
        "date_of_most_recent_info",
        "reportercountry",
        "qualification",
        "is_nullified",
    ],
    primary_key: &["safetyreportid"],
    version_key: Some("date_of_most_recent_info"),
    has_nullified_flag: true,
    ddl: r#"
CREATE TABLE IF NOT EXISTS icsr_master (
    safetyreportid           VARCHAR(255) PRIMARY KEY,
    senderidentifier         VARCHAR(255),
    receiveridentifier       VARCHAR(255),
    receiptdate              VARCHAR(255),
    date_of_most_recent_info VARCHAR(255),
    reportercountry          VARCHAR(255),
    qualification            VARCHAR(255),
    is_nullified             BOOLEAN NOT NULL DEFAULT FALSE,
    load_timestamp           TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#,
};

pub const PATIENT_CHARACTERISTICS: TableDef = TableDef {
    name: "patient_characteristics",
    columns: &[
        "safetyreportid",
        "patientinitials",
        "patientonsetage",
        "patientsex",
    ],
    primary_key: &["safetyreportid"],
    version_key: None,
    has_nullified_flag: false,
    ddl: r#"
CREATE TABLE IF NOT EXISTS patient_characteristics (
    safetyreportid  VARCHAR(255) PRIMARY KEY
        REFERENCES icsr_master (safetyreportid),
    patientinitials VARCHAR(255),
    patientonsetage VARCHAR(255),
    patientsex      VARCHAR(50)
)
"#,
};

pub const REACTIONS: TableDef = TableDef {
    name: "reactions",
    columns: &["safetyreportid", "primarysourcereaction", "reactionmeddrapt"],
    primary_key: &["safetyreportid", "primarysourcereaction"],
    version_key: None,
    has_nullified_flag: false,
    ddl: r#"
CREATE TABLE IF NOT EXISTS reactions (
    safetyreportid        VARCHAR(255) NOT NULL
        REFERENCES icsr_master (safetyreportid),
    primarysourcereaction TEXT NOT NULL,
    reactionmeddrapt      TEXT,
    PRIMARY KEY (safetyreportid, primarysourcereaction)
)
"#,
};

pub const DRUGS: TableDef = TableDef {
    name: "drugs",
    columns: &[
        "safetyreportid",
        "drug_seq",
        "drugcharacterization",
        "medicinalproduct",
        "drugstructuredosagenumb",
        "drugstructuredosageunit",
        "drugdosagetext",
    ],
    primary_key: &["safetyreportid", "drug_seq"],
    version_key: None,
    has_nullified_flag: false,
    ddl: r#"
CREATE TABLE IF NOT EXISTS drugs (
    safetyreportid          VARCHAR(255) NOT NULL
        REFERENCES icsr_master (safetyreportid),
    drug_seq                INTEGER NOT NULL,
    drugcharacterization    VARCHAR(255),
    medicinalproduct        TEXT,
    drugstructuredosagenumb VARCHAR(255),
    drugstructuredosageunit VARCHAR(255),
    drugdosagetext          TEXT,
    PRIMARY KEY (safetyreportid, drug_seq)
)
"#,
};

pub const DRUG_SUBSTANCES: TableDef = TableDef {
    name: "drug_substances",
    columns: &["safetyreportid", "drug_seq", "activesubstancename"],
    primary_key: &["safetyreportid", "drug_seq", "activesubstancename"],
    version_key: None,
    has_nullified_flag: false,
    ddl: r#"
CREATE TABLE IF NOT EXISTS drug_substances (
    safetyreportid      VARCHAR(255) NOT NULL,
    drug_seq            INTEGER NOT NULL,
    activesubstancename TEXT NOT NULL,
    PRIMARY KEY (safetyreportid, drug_seq, activesubstancename),
    FOREIGN KEY (safetyreportid, drug_seq)
        REFERENCES drugs (safetyreportid, drug_seq)
)
"#,
};

pub const TESTS_PROCEDURES: TableDef = TableDef {
    name: "tests_procedures",
    columns: &[
        "safetyreportid",
        "testname",
        "testdate",
        "testresult",
        "testresultunit",
        "testcomments",
    ],
    primary_key: &["safetyreportid", "testname"],
    version_key: None,
    has_nullified_flag: false,
    ddl: r#"
CREATE TABLE IF NOT EXISTS tests_procedures (
    safetyreportid VARCHAR(255) NOT NULL
        REFERENCES icsr_master (safetyreportid),
    testname       TEXT NOT NULL,
    testdate       VARCHAR(255),
    testresult     TEXT,
    testresultunit TEXT,
    testcomments   TEXT,
    PRIMARY KEY (safetyreportid, testname)
)
"#,
};

pub const CASE_SUMMARY_NARRATIVE: TableDef = TableDef {
    name: "case_summary_narrative",
    columns: &["safetyreportid", "narrative"],
    primary_key: &["safetyreportid"],
    version_key: None,
    has_nullified_flag: false,
    ddl: r#"
CREATE TABLE IF NOT EXISTS case_summary_narrative (
    safetyreportid VARCHAR(255) PRIMARY KEY
        REFERENCES icsr_master (safetyreportid),
    narrative      TEXT
)
"#,
};

pub const ICSR_AUDIT_LOG: TableDef = TableDef {
    name: "icsr_audit_log",
    columns: &[
        "safetyreportid",
        "receiptdate",
        "icsr_payload",
        "etl_load_timestamp",
    ],
    primary_key: &["safetyreportid"],
    version_key: Some("receiptdate"),
    has_nullified_flag: false,
    ddl: r#"
CREATE TABLE IF NOT EXISTS icsr_audit_log (
    safetyreportid     VARCHAR(255) PRIMARY KEY,
    receiptdate        VARCHAR(255),
    icsr_payload       JSONB,
    etl_load_timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#,
};

pub const ETL_FILE_HISTORY: TableDef = TableDef {
    name: "etl_file_history",
    columns: &["filename", "file_hash", "status", "rows_processed"],
    primary_key: &["file_hash"],
    version_key: None,
    has_nullified_flag: false,
    ddl: r#"
CREATE TABLE IF NOT EXISTS etl_file_history (
    id             SERIAL PRIMARY KEY,
    filename       VARCHAR(255) NOT NULL,
    file_hash      VARCHAR(64) NOT NULL UNIQUE,
    status         VARCHAR(50) NOT NULL,
    rows_processed INTEGER,
    load_timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#,
};

/// Normalized target tables in load order (master first, then children;
/// drugs before drug_substances so the composite FK resolves).
pub const NORMALIZED_TABLES: &[&TableDef] = &[
    &ICSR_MASTER,
    &PATIENT_CHARACTERISTICS,
    &REACTIONS,
    &DRUGS,
    &DRUG_SUBSTANCES,
    &TESTS_PROCEDURES,
    &CASE_SUMMARY_NARRATIVE,
];

/// Child tables in deletion order for version-gated replacement
/// (drug_substances before drugs, for the composite FK).
pub const CHILD_DELETE_ORDER: &[&TableDef] = &[
    &DRUG_SUBSTANCES,
    &DRUGS,
    &REACTIONS,
    &PATIENT_CHARACTERISTICS,
    &TESTS_PROCEDURES,
    &CASE_SUMMARY_NARRATIVE,
];

/// Look up a table definition by name
pub fn table(name: &str) -> Option<&'static TableDef> {
    all_tables().iter().find(|t| t.name == name).copied()
}

/// Every table the engine knows about
pub fn all_tables() -> &'static [&'static TableDef] {
    &[
        &ICSR_MASTER,
        &PATIENT_CHARACTERISTICS,
        &REACTIONS,
        &DRUGS,
        &DRUG_SUBSTANCES,
        &TESTS_PROCEDURES,
        &CASE_SUMMARY_NARRATIVE,
        &ICSR_AUDIT_LOG,
        &ETL_FILE_HISTORY,
    ]
}

/// Data tables (everything except the history journal) for the given schema
pub fn target_tables(schema_type: SchemaType) -> Vec<&'static TableDef> {
    match schema_type {
        SchemaType::Normalized => NORMALIZED_TABLES.to_vec(),
        SchemaType::Audit => vec![&ICSR_AUDIT_LOG],
    }
}

/// DDL statements for `create_all_tables`, in dependency order.
///
/// Both representations plus the history journal are created regardless of
/// the configured schema type so a later switch needs no migration step.
pub fn ddl_statements() -> Vec<&'static str> {
    all_tables().iter().map(|t| t.ddl).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_type_parsing() {
        assert_eq!(
            "normalized".parse::<SchemaType>().unwrap(),
            SchemaType::Normalized
        );
        assert_eq!("AUDIT".parse::<SchemaType>().unwrap(), SchemaType::Audit);
        assert!("relational".parse::<SchemaType>().is_err());
    }

    #[test]
    fn test_table_lookup() {
        let drugs = table("drugs").unwrap();
        assert_eq!(drugs.primary_key, &["safetyreportid", "drug_seq"]);
        assert!(table("nonexistent").is_none());
    }

    #[test]
    fn test_master_has_version_gate() {
        assert_eq!(ICSR_MASTER.version_key, Some("date_of_most_recent_info"));
        assert!(ICSR_MASTER.has_nullified_flag);
        assert_eq!(ICSR_AUDIT_LOG.version_key, Some("receiptdate"));
        assert!(!ICSR_AUDIT_LOG.has_nullified_flag);
    }

    #[test]
    fn test_load_order_resolves_foreign_keys() {
        let names: Vec<_> = NORMALIZED_TABLES.iter().map(|t| t.name).collect();
        let master = names.iter().position(|n| *n == "icsr_master").unwrap();
        let drugs = names.iter().position(|n| *n == "drugs").unwrap();
        let substances = names.iter().position(|n| *n == "drug_substances").unwrap();
        assert!(master < drugs);
        assert!(drugs < substances);
    }

    #[test]
    fn test_delete_order_is_reverse_of_fk_dependencies() {
        let names: Vec<_> = CHILD_DELETE_ORDER.iter().map(|t| t.name).collect();
        let drugs = names.iter().position(|n| *n == "drugs").unwrap();
        let substances = names.iter().position(|n| *n == "drug_substances").unwrap();
        assert!(substances < drugs);
        assert!(!names.contains(&"icsr_master"));
    }

    #[test]
    fn test_ddl_covers_every_table() {
        let ddl = ddl_statements();
        assert_eq!(ddl.len(), all_tables().len());
        for t in all_tables() {
            assert!(t.ddl.contains(t.name));
        }
    }
}
