//! Per-patient NLP phenotype term lists and their block text format.
//!
//! The format consists of repeating blocks of a patient ID line, the column
//! header line `Criterion,Frequency`, and one `<criterion>,<frequency>` line
//! per term:
//!
//! ```text
//! MAN_0001-01
//! Criterion,Frequency
//! hp0002813_Abnormality_of_limb_bone_morphology,32
//! hp0012531_Pain,16
//! ```

pub mod combine;
pub mod filter;
pub mod filter_all;
pub mod refs;

use std::io::{BufRead, Write};
use std::path::Path;

use indexmap::{IndexMap, IndexSet};

use crate::common::io::{open_read_maybe_gz, open_write_maybe_gz};
use crate::err::{AppError, ParseError};

/// The column header line within each patient block.
pub const COLUMN_HEADER: &str = "Criterion,Frequency";

/// One observation of a phenotype criterion for a patient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TermRecord {
    /// Patient identifier from the block header.
    pub patient: String,
    /// Criterion token, ontology tag plus label, e.g., `hp0012531_Pain`.
    pub criterion: String,
    /// Raw frequency reported by the NLP engine.
    pub frequency: i64,
}

impl TermRecord {
    pub fn new(patient: &str, criterion: &str, frequency: i64) -> Self {
        Self {
            patient: patient.to_string(),
            criterion: criterion.to_string(),
            frequency,
        }
    }

    /// The ontology ID of this record's criterion.
    pub fn hpo_id(&self) -> String {
        hpo_id_from_criterion(&self.criterion)
    }
}

/// Convert a criterion token into an HPO term ID.
///
/// Everything from the first underscore on is dropped and the lower-case
/// `hp` tag becomes `HP:`, so `hp0001298_Encephalopathy` gives `HP:0001298`.
pub fn hpo_id_from_criterion(criterion: &str) -> String {
    let token = criterion.split('_').next().unwrap_or(criterion);
    match token.strip_prefix("hp") {
        Some(rest) => format!("HP:{}", rest),
        None => token.to_string(),
    }
}

/// A patient header line followed by its `(criterion, frequency)` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientBlock {
    pub patient: String,
    pub terms: Vec<(String, i64)>,
}

/// Parse the block format from `reader` into patient blocks.
///
/// Lines are trimmed first. Blank lines and column header lines are skipped,
/// a single field starts a new patient block, and two fields form a term of
/// the current block.  Everything else is an error.
pub fn parse_patient_blocks<R: BufRead>(reader: R) -> Result<Vec<PatientBlock>, ParseError> {
    let mut blocks: Vec<PatientBlock> = Vec::new();

    for (i, line) in reader.lines().enumerate() {
        let line_no = i + 1;
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line == COLUMN_HEADER {
            continue;
        }

        let fields = line.split(',').collect::<Vec<_>>();
        match fields.as_slice() {
            [name] => blocks.push(PatientBlock {
                patient: name.to_string(),
                terms: Vec::new(),
            }),
            [criterion, frequency] => {
                let block = blocks
                    .last_mut()
                    .ok_or_else(|| ParseError::TermBeforePatient {
                        line_no,
                        line: line.to_string(),
                    })?;
                let frequency =
                    frequency
                        .trim()
                        .parse::<i64>()
                        .map_err(|source| ParseError::InvalidFrequency {
                            line_no,
                            line: line.to_string(),
                            source,
                        })?;
                block.terms.push((criterion.trim().to_string(), frequency));
            }
            _ => {
                return Err(ParseError::FieldCount {
                    line_no,
                    fields: fields.len(),
                    line: line.to_string(),
                })
            }
        }
    }

    Ok(blocks)
}

/// Parse the block format from `reader` into one record per term line.
pub fn parse_blocks<R: BufRead>(reader: R) -> Result<Vec<TermRecord>, ParseError> {
    Ok(parse_patient_blocks(reader)?
        .iter()
        .flat_map(|block| {
            block.terms.iter().map(|(criterion, frequency)| {
                TermRecord::new(&block.patient, criterion, *frequency)
            })
        })
        .collect())
}

/// Parse the block format from the (possibly gzip-compressed) file at `path`.
pub fn read_blocks_from_path<P: AsRef<Path>>(path: P) -> Result<Vec<TermRecord>, anyhow::Error> {
    let reader = open_read_maybe_gz(&path)?;
    parse_blocks(reader)
        .map_err(|e| anyhow::anyhow!("could not parse {:?}: {}", path.as_ref(), e))
}

/// Remove repeated (patient, criterion, frequency) triples, keeping the first.
pub fn dedup_records(records: &[TermRecord]) -> Vec<TermRecord> {
    records
        .iter()
        .collect::<IndexSet<_>>()
        .into_iter()
        .cloned()
        .collect()
}

/// Group records by patient, in order of the patient's first appearance.
pub fn group_by_patient(records: &[TermRecord]) -> IndexMap<&str, Vec<&TermRecord>> {
    let mut groups: IndexMap<&str, Vec<&TermRecord>> = IndexMap::new();
    for record in records {
        groups
            .entry(record.patient.as_str())
            .or_default()
            .push(record);
    }
    groups
}

/// Write `records` in the block format.
pub fn write_blocks<W: Write>(writer: &mut W, records: &[TermRecord]) -> std::io::Result<()> {
    for (patient, group) in group_by_patient(records) {
        writeln!(writer, "{}", patient)?;
        writeln!(writer, "{}", COLUMN_HEADER)?;
        for record in group {
            writeln!(writer, "{},{}", record.criterion, record.frequency)?;
        }
    }
    Ok(())
}

/// Write `records` in the block format to the file at `path`.
pub fn write_blocks_to_path<P: AsRef<Path>>(
    path: P,
    records: &[TermRecord],
) -> Result<(), anyhow::Error> {
    let mut writer = open_write_maybe_gz(&path)?;
    write_blocks(&mut writer, records)?;
    writer.flush()?;
    Ok(())
}

/// Extract the criteria listed for `sample_id` in the block file at `path`.
///
/// Only the first block of the sample is used.
pub fn terms_for_sample<P: AsRef<Path>>(
    path: P,
    sample_id: &str,
) -> Result<Vec<String>, anyhow::Error> {
    let path_str = path.as_ref().display().to_string();
    let reader = open_read_maybe_gz(&path)?;
    let blocks = parse_patient_blocks(reader)
        .map_err(|e| anyhow::anyhow!("could not parse {:?}: {}", &path_str, e))?;

    let block = blocks
        .into_iter()
        .find(|block| block.patient == sample_id)
        .ok_or_else(|| AppError::SampleNotFound {
            sample_id: sample_id.to_string(),
            path: path_str.clone(),
        })?;
    if block.terms.is_empty() {
        return Err(AppError::SampleWithoutTerms {
            sample_id: sample_id.to_string(),
            path: path_str,
        }
        .into());
    }

    Ok(block
        .terms
        .into_iter()
        .map(|(criterion, _)| criterion)
        .collect())
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;

    use super::*;

    const EXAMPLE: &str = "MAN_0001-01\n\
        Criterion,Frequency\n\
        hp0002813_Abnormality_of_limb_bone_morphology,32\n \
        hp0012531_Pain,16\n\
        MAN_0002-01\n\
        Criterion,Frequency\n\
        hp0001298_Encephalopathy,19\n\
        hp0002273_Tetraparesis,10\n";

    #[rstest::rstest]
    #[case("hp0001298_Encephalopathy", "HP:0001298")]
    #[case("hp0002813_Abnormality_of_limb_bone_morphology", "HP:0002813")]
    #[case("hp0012531", "HP:0012531")]
    #[case("HP:0012531", "HP:0012531")]
    fn hpo_id_transform(#[case] criterion: &str, #[case] expected: &str) {
        assert_eq!(hpo_id_from_criterion(criterion), expected);
    }

    #[test]
    fn parse_example() -> Result<(), anyhow::Error> {
        let records = parse_blocks(EXAMPLE.as_bytes())?;

        assert_eq!(
            records,
            vec![
                TermRecord::new(
                    "MAN_0001-01",
                    "hp0002813_Abnormality_of_limb_bone_morphology",
                    32
                ),
                TermRecord::new("MAN_0001-01", "hp0012531_Pain", 16),
                TermRecord::new("MAN_0002-01", "hp0001298_Encephalopathy", 19),
                TermRecord::new("MAN_0002-01", "hp0002273_Tetraparesis", 10),
            ]
        );

        Ok(())
    }

    #[test]
    fn parse_skips_blank_lines() -> Result<(), anyhow::Error> {
        let text = concat!(
            "MAN_0001-01\nCriterion,Frequency\nhp0012531_Pain,16\n",
            "\n   \n",
            "hp0001298_Encephalopathy,19\n"
        );
        let records = parse_blocks(text.as_bytes())?;

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.patient == "MAN_0001-01"));

        Ok(())
    }

    #[rstest::rstest]
    #[case("MAN_0001-01\nhp0012531_Pain,16,3\n", "expected 1 or 2")]
    #[case("hp0012531_Pain,16\n", "before any patient header")]
    #[case("MAN_0001-01\nhp0012531_Pain,many\n", "invalid frequency")]
    fn parse_errors(#[case] text: &str, #[case] message: &str) {
        let err = parse_blocks(text.as_bytes()).expect_err("must fail");
        assert!(
            err.to_string().contains(message),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn write_example() -> Result<(), anyhow::Error> {
        let records = parse_blocks(EXAMPLE.as_bytes())?;
        let mut buf = Vec::new();
        write_blocks(&mut buf, &records)?;

        insta::assert_snapshot!(String::from_utf8(buf)?.trim_end(), @r###"
        MAN_0001-01
        Criterion,Frequency
        hp0002813_Abnormality_of_limb_bone_morphology,32
        hp0012531_Pain,16
        MAN_0002-01
        Criterion,Frequency
        hp0001298_Encephalopathy,19
        hp0002273_Tetraparesis,10
        "###);

        Ok(())
    }

    #[test]
    fn write_groups_interleaved_patients() -> Result<(), anyhow::Error> {
        let records = vec![
            TermRecord::new("B", "hp0000001_x", 1),
            TermRecord::new("A", "hp0000002_y", 2),
            TermRecord::new("B", "hp0000003_z", 3),
        ];
        let mut buf = Vec::new();
        write_blocks(&mut buf, &records)?;

        assert_eq!(
            String::from_utf8(buf)?,
            "B\nCriterion,Frequency\nhp0000001_x,1\nhp0000003_z,3\n\
             A\nCriterion,Frequency\nhp0000002_y,2\n"
        );

        Ok(())
    }

    #[test]
    fn format_round_trip() -> Result<(), anyhow::Error> {
        let records = read_blocks_from_path("tests/terms/raw_terms.txt")?;
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("out.txt");
        write_blocks_to_path(&path, &records)?;
        let reparsed = read_blocks_from_path(&path)?;

        assert_eq!(
            records.into_iter().collect::<HashSet<_>>(),
            reparsed.into_iter().collect::<HashSet<_>>()
        );

        Ok(())
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let records = vec![
            TermRecord::new("A", "hp0000002_y", 2),
            TermRecord::new("A", "hp0000001_x", 1),
            TermRecord::new("A", "hp0000002_y", 2),
        ];

        assert_eq!(
            dedup_records(&records),
            vec![
                TermRecord::new("A", "hp0000002_y", 2),
                TermRecord::new("A", "hp0000001_x", 1),
            ]
        );
    }

    #[test]
    fn terms_for_sample_found() -> Result<(), anyhow::Error> {
        let terms = terms_for_sample("tests/terms/raw_terms.txt", "MAN_0002-01")?;

        assert_eq!(
            terms,
            vec![
                "hp0001298_Encephalopathy".to_string(),
                "hp0002273_Tetraparesis".to_string(),
                "hp0001250_Seizure".to_string(),
            ]
        );

        Ok(())
    }

    #[test]
    fn terms_for_sample_missing() {
        let err = terms_for_sample("tests/terms/raw_terms.txt", "MAN_9999-01")
            .expect_err("must fail");
        let app_err = err.downcast_ref::<AppError>().expect("must be AppError");

        assert!(matches!(
            app_err,
            AppError::SampleNotFound { sample_id, path }
                if sample_id == "MAN_9999-01" && path == "tests/terms/raw_terms.txt"
        ));
    }

    #[test]
    fn terms_for_sample_without_terms() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("terms.txt");
        std::fs::write(&path, "MAN_0001-01\nCriterion,Frequency\nMAN_0002-01\nhp0012531_Pain,1\n")?;

        let err = terms_for_sample(&path, "MAN_0001-01").expect_err("must fail");
        assert!(matches!(
            err.downcast_ref::<AppError>(),
            Some(AppError::SampleWithoutTerms { .. })
        ));

        Ok(())
    }
}
