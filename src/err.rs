use std::num::ParseIntError;

/// Errors that abort a command with a diagnostic message.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("invalid configuration in {path}: {reason}")]
    Config { path: String, reason: String },
    #[error("sample {sample_id} not found in phenotype file {path}")]
    SampleNotFound { sample_id: String, path: String },
    #[error("sample {sample_id} has no phenotype terms in {path}")]
    SampleWithoutTerms { sample_id: String, path: String },
    #[error("{failed} of {total} jobs failed permanently, see {report}")]
    JobsFailed {
        failed: usize,
        total: usize,
        report: String,
    },
}

/// Errors raised when reading the per-patient block format.
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("line {line_no}: expected 1 or 2 comma-separated fields, found {fields} in {line:?}")]
    FieldCount {
        line_no: usize,
        fields: usize,
        line: String,
    },
    #[error("line {line_no}: term line {line:?} before any patient header")]
    TermBeforePatient { line_no: usize, line: String },
    #[error("line {line_no}: invalid frequency in {line:?}")]
    InvalidFrequency {
        line_no: usize,
        line: String,
        #[source]
        source: ParseIntError,
    },
    #[error("could not read term file: {0}")]
    Io(#[from] std::io::Error),
}
