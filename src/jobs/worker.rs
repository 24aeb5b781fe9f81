//! Implementation of `jobs run` sub command, a single scoring job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;

use super::results::json_to_tab;
use super::retry::CommandTemplate;
use crate::common::s3::ObjectLocation;
use crate::common::store::ObjectStore;
use crate::terms::{hpo_id_from_criterion, terms_for_sample};

/// Command line arguments for `jobs run` sub command.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Run one scoring job", long_about = None)]
pub struct Args {
    /// Identifier of the job, names the results directory.
    #[arg(long, env = "exomiser_job_id")]
    pub job_id: String,
    /// Location of the sample's VCF file; its file stem is the sample ID.
    #[arg(long, env = "exomiser_vcf_file")]
    pub vcf_file: ObjectLocation,
    /// Location of the per-patient term file.
    #[arg(long, env = "exomiser_hpo_file")]
    pub hpo_file: ObjectLocation,
    /// Location of the base analysis file of the scoring tool.
    #[arg(long, env = "exomiser_base_yml_file")]
    pub analysis_file: ObjectLocation,
    /// Bucket to upload the results to.
    #[arg(long, env = "write_bucket")]
    pub write_bucket: String,
    /// Key prefix for the results.
    #[arg(long, default_value = "exomiser_results")]
    pub results_prefix: String,
    /// Maximal Java heap size, available as `{xmx}` in the scoring command.
    #[arg(long, env = "exomiser_Xmx", default_value = "4g")]
    pub xmx: String,
    /// Directory below which the inputs are staged.
    #[arg(long, default_value = "/usr/share/data")]
    pub path_data_root: PathBuf,
    /// Directory below which the results are written.
    #[arg(long, default_value = "/usr/share/results")]
    pub path_results_root: PathBuf,
    /// YAML file with the scoring command template, see `default_scoring_command`.
    #[arg(long)]
    pub path_command: Option<PathBuf>,
    /// Use this local directory as object store instead of S3.
    #[arg(long)]
    pub path_local_store: Option<PathBuf>,
}

/// Example invocation of the scoring tool, used without `--path-command`.
///
/// The scoring CLI must accept the per-sample `--vcf`, `--sample`,
/// `--hpo-ids` and `--output-prefix` flags next to `--analysis`.  Builds that
/// only read the analysis file need their own template via `--path-command`,
/// otherwise the sample's terms are not passed on.
pub fn default_scoring_command() -> CommandTemplate {
    CommandTemplate {
        program: "java".to_string(),
        args: [
            "-Xmx{xmx}",
            "-jar",
            "exomiser-cli-12.1.0/exomiser-cli-12.1.0.jar",
            "--analysis",
            "{analysis}",
            "--vcf",
            "{vcf}",
            "--sample",
            "{sample_id}",
            "--hpo-ids",
            "{hpo_ids}",
            "--output-prefix",
            "{output_prefix}",
            "--spring.config.location=exomiser-cli-12.1.0/application.properties",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
}

/// Per-invocation directories for inputs and results.
#[derive(Debug)]
struct RunDirs {
    data: PathBuf,
    results: PathBuf,
}

impl RunDirs {
    fn create(data_root: &Path, results_root: &Path) -> Result<Self, anyhow::Error> {
        let name = uuid::Uuid::new_v4().simple().to_string();
        let dirs = Self {
            data: data_root.join(&name),
            results: results_root.join(&name),
        };
        for dir in [&dirs.data, &dirs.results] {
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", dir, e))?;
        }
        Ok(dirs)
    }

    fn remove(&self) {
        for dir in [&self.data, &self.results] {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                tracing::warn!("could not remove {:?}: {}", dir, e);
            }
        }
    }
}

/// Download `loc` into `dir`, keeping its basename.
async fn stage(
    store: &ObjectStore,
    loc: &ObjectLocation,
    dir: &Path,
) -> Result<PathBuf, anyhow::Error> {
    let path = dir.join(loc.basename());
    store.download(loc, &path).await?;
    Ok(path)
}

async fn run_job(
    store: &ObjectStore,
    template: &CommandTemplate,
    args: &Args,
    dirs: &RunDirs,
) -> Result<(), anyhow::Error> {
    let sample_id = args.vcf_file.file_stem().to_string();
    tracing::info!("Staging inputs for sample {}...", &sample_id);
    let vcf = stage(store, &args.vcf_file, &dirs.data).await?;
    let hpo = stage(store, &args.hpo_file, &dirs.data).await?;
    let analysis = stage(store, &args.analysis_file, &dirs.data).await?;

    let hpo_ids = terms_for_sample(&hpo, &sample_id)?
        .iter()
        .map(|criterion| hpo_id_from_criterion(criterion))
        .collect::<Vec<_>>();
    tracing::info!("... {} phenotype terms: {}", hpo_ids.len(), hpo_ids.join(","));

    let output_prefix = dirs.results.join(&sample_id);
    let values = HashMap::from([
        ("job_id", args.job_id.clone()),
        ("sample_id", sample_id.clone()),
        ("vcf", vcf.display().to_string()),
        ("hpo_ids", hpo_ids.join(",")),
        ("analysis", analysis.display().to_string()),
        ("output_prefix", output_prefix.display().to_string()),
        ("xmx", args.xmx.clone()),
    ]);
    let command = template.render(&values)?;

    tracing::info!("Running scoring tool...");
    let before_scoring = Instant::now();
    let log_path = dirs.data.join(format!("{}.log", &sample_id));
    let status = command.run(&log_path)?;
    if !status.success() {
        let log = std::fs::read_to_string(&log_path).unwrap_or_default();
        anyhow::bail!(
            "scoring tool exited with {} for job {}, output:\n{}",
            status,
            &args.job_id,
            log.trim_end()
        );
    }
    tracing::info!("... done in {:?}", before_scoring.elapsed());

    tracing::info!("Collecting and uploading results...");
    let path_json = dirs.results.join(format!("{}.json", &sample_id));
    let path_tab = dirs.results.join(format!("{}.tab", &sample_id));
    let num_genes = json_to_tab(&path_json, &path_tab)?;
    tracing::info!("... {} genes in results", num_genes);

    for ext in ["html", "json", "tab"] {
        let src = dirs.results.join(format!("{}.{}", &sample_id, ext));
        let dst = ObjectLocation::new(
            &args.write_bucket,
            &format!(
                "{}/{}/{}/{}.{}",
                &args.results_prefix, &args.job_id, ext, &sample_id, ext
            ),
        );
        store.upload(&src, &dst).await?;
    }

    Ok(())
}

/// Main entry point for `jobs run` sub command.
pub async fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = Instant::now();
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let template = match &args.path_command {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("could not read {:?}: {}", path, e))?;
            serde_yaml::from_str(&text)
                .map_err(|e| anyhow::anyhow!("invalid command template in {:?}: {}", path, e))?
        }
        None => default_scoring_command(),
    };
    let store = ObjectStore::from_env(args.path_local_store.as_deref()).await?;

    let dirs = RunDirs::create(&args.path_data_root, &args.path_results_root)?;
    let result = run_job(&store, &template, args, &dirs).await;
    dirs.remove();
    result?;

    tracing::info!(
        "All of `jobs run` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(())
}
