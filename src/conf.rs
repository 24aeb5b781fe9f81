//! Pipeline configuration, read once from a YAML file.

use std::path::{Path, PathBuf};

use serde::{de, Deserialize, Deserializer, Serialize};

use crate::common::s3::ObjectLocation;
use crate::err::AppError;
use crate::jobs::retry::{CommandTemplate, RetryPolicy};
use crate::runs::{check_output_filenames, check_unique_labels, default_runs, RunGrid, RunSpec};

fn default_depth_table_key() -> String {
    "hpo_multishortest_paths_stats.csv".to_string()
}

fn default_clade_table_key() -> String {
    "hpo_multishortest_paths.csv".to_string()
}

/// Deserialize a list of `s3://bucket/key` strings.
fn from_object_locations<'de, D>(deserializer: D) -> Result<Vec<ObjectLocation>, D::Error>
where
    D: Deserializer<'de>,
{
    let values: Vec<String> = Deserialize::deserialize(deserializer)?;
    values
        .iter()
        .map(|s| s.parse::<ObjectLocation>().map_err(de::Error::custom))
        .collect()
}

fn default_scoring_command() -> CommandTemplate {
    CommandTemplate {
        program: "nlp-pheno-worker".to_string(),
        args: [
            "jobs",
            "run",
            "--job-id",
            "{job_id}",
            "--vcf-file",
            "{vcf_file}",
            "--hpo-file",
            "{hpo_file}",
            "--analysis-file",
            "s3://{bucket}/test-analysis-exome.yml",
            "--write-bucket",
            "{bucket}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
}

fn default_minutes_per_job() -> f64 {
    7.0
}

/// Settings for `jobs dispatch`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DispatchConf {
    /// Command run per job, with `{job_id}`, `{vcf_file}`, `{hpo_file}`, and
    /// `{bucket}` placeholders.
    #[serde(default = "default_scoring_command")]
    pub command: CommandTemplate,
    /// Prefix prepended to the run label to form the job ID.
    #[serde(default)]
    pub job_prefix: String,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Expected wall clock time of one job, used for the runtime estimate.
    #[serde(default = "default_minutes_per_job")]
    pub minutes_per_job: f64,
}

impl Default for DispatchConf {
    fn default() -> Self {
        Self {
            command: default_scoring_command(),
            job_prefix: String::new(),
            retry: RetryPolicy::default(),
            minutes_per_job: default_minutes_per_job(),
        }
    }
}

/// Configuration of the whole pipeline.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PipelineConf {
    /// Local working directory, `~` and environment variables are expanded.
    pub workdir: PathBuf,
    /// Name of the combined NLP term file, locally and in the bucket.
    pub nlp_terms_filename: String,
    /// Directory below `workdir` for the filtered term files.
    pub nlp_output_dir: String,
    /// Prefix of the filtered term file names.
    pub nlp_hpo_filename_prefix: String,
    /// Key prefix of the per-patient raw NLP term files.
    pub nlp_terms_orig_dirname: String,
    /// Key of the manually curated term file.
    pub manual_hpo_filename: String,
    /// Bucket with inputs and outputs.
    pub s3_bucket_name: String,
    /// Locations of the sample VCF files.
    #[serde(deserialize_with = "from_object_locations")]
    pub vcf_files: Vec<ObjectLocation>,
    #[serde(default = "default_depth_table_key")]
    pub depth_table_key: String,
    #[serde(default = "default_clade_table_key")]
    pub clade_table_key: String,
    /// Explicit list of runs, exclusive with `grid`.
    #[serde(default)]
    pub runs: Option<Vec<RunSpec>>,
    /// Parameter grid for the NLP runs, exclusive with `runs`.
    #[serde(default)]
    pub grid: Option<RunGrid>,
    #[serde(default)]
    pub dispatch: DispatchConf,
}

impl PipelineConf {
    /// Load and check the configuration at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path_str = path.as_ref().display().to_string();
        let config_err = |reason: String| AppError::Config {
            path: path_str.clone(),
            reason,
        };

        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| config_err(format!("could not read file: {}", e)))?;
        let mut conf: PipelineConf =
            serde_yaml::from_str(&text).map_err(|e| config_err(e.to_string()))?;

        let workdir = conf.workdir.display().to_string();
        conf.workdir = PathBuf::from(
            shellexpand::full(&workdir)
                .map_err(|e| config_err(format!("could not expand workdir: {}", e)))?
                .as_ref(),
        );

        if conf.vcf_files.is_empty() {
            return Err(config_err("no vcf_files given".to_string()).into());
        }
        if conf.runs.is_some() && conf.grid.is_some() {
            return Err(config_err("only one of runs and grid may be given".to_string()).into());
        }
        let runs = conf.runs();
        check_unique_labels(&runs).map_err(|e| config_err(e.to_string()))?;
        check_output_filenames(&runs, &conf.nlp_hpo_filename_prefix)
            .map_err(|e| config_err(e.to_string()))?;

        tracing::debug!("loaded configuration from {}", &path_str);
        Ok(conf)
    }

    /// The configured runs, the default study design if neither `runs` nor
    /// `grid` is given.
    pub fn runs(&self) -> Vec<RunSpec> {
        match (&self.runs, &self.grid) {
            (Some(runs), _) => runs.clone(),
            (None, Some(grid)) => default_runs(grid),
            (None, None) => default_runs(&RunGrid::default()),
        }
    }

    /// Local directory for the filtered term files.
    pub fn nlp_output_path(&self) -> PathBuf {
        self.workdir.join(&self.nlp_output_dir)
    }

    /// Location of an object in the pipeline bucket.
    pub fn bucket_object(&self, key: &str) -> ObjectLocation {
        ObjectLocation::new(&self.s3_bucket_name, key)
    }
}
