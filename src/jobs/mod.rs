//! Scoring jobs, one per pair of run and sample.

pub mod dispatch;
pub mod results;
pub mod retry;
pub mod worker;

use std::collections::HashMap;

use crate::common::s3::ObjectLocation;
use crate::conf::PipelineConf;
use crate::runs::{RunKind, RunSpec};
use crate::terms::filter::output_filename;

/// One invocation of the scoring tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Identifier, the job prefix followed by the run label.
    pub job_id: String,
    /// Label of the run the job belongs to.
    pub run_label: String,
    /// The term file with the sample's phenotypes.
    pub hpo_file: ObjectLocation,
    /// The sample's variants.
    pub vcf_file: ObjectLocation,
}

impl Job {
    /// Values for the placeholders of the dispatch command.
    pub fn template_values(&self) -> HashMap<&'static str, String> {
        HashMap::from([
            ("job_id", self.job_id.clone()),
            ("vcf_file", self.vcf_file.to_string()),
            ("hpo_file", self.hpo_file.to_string()),
            ("bucket", self.hpo_file.bucket.clone()),
        ])
    }
}

/// Location of the term file used by `run`.
pub fn hpo_file_for_run(conf: &PipelineConf, run: &RunSpec) -> ObjectLocation {
    match &run.kind {
        RunKind::Manual => conf.bucket_object(&conf.manual_hpo_filename),
        RunKind::Nlp(params) => {
            conf.bucket_object(&output_filename(&conf.nlp_hpo_filename_prefix, params))
        }
    }
}

/// Build one job per run and VCF file, grouped by run.
pub fn build_jobs(conf: &PipelineConf, runs: &[RunSpec]) -> Vec<Job> {
    runs.iter()
        .flat_map(|run| {
            let hpo_file = hpo_file_for_run(conf, run);
            conf.vcf_files.iter().map(move |vcf_file| Job {
                job_id: format!("{}{}", &conf.dispatch.job_prefix, &run.label),
                run_label: run.label.clone(),
                hpo_file: hpo_file.clone(),
                vcf_file: vcf_file.clone(),
            })
        })
        .collect()
}
