//! Implementation of `jobs dispatch` sub command.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;
use rayon::prelude::*;
use thousands::Separable;

use super::retry::{RetryOutcome, RetryPolicy};
use super::{build_jobs, Job};
use crate::conf::PipelineConf;
use crate::err::AppError;

/// Command line arguments for `jobs dispatch` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run the scoring jobs of all runs and samples", long_about = None)]
pub struct Args {
    /// Path to the pipeline configuration YAML file.
    #[arg(long, required = true)]
    pub path_conf: PathBuf,
    /// Number of jobs to run concurrently, defaults to number of cores.
    #[arg(long)]
    pub num_threads: Option<usize>,
    /// Only dispatch the runs with these labels.
    #[arg(long)]
    pub run_label: Vec<String>,
    /// Directory for per-job log files, defaults to `<workdir>/job_logs`.
    #[arg(long)]
    pub path_log_dir: Option<PathBuf>,
    /// Path of the report on failed jobs, defaults to `<workdir>/failed_jobs.tsv`.
    #[arg(long)]
    pub path_report: Option<PathBuf>,
    /// Only list the jobs.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

/// Final state of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub job: Job,
    /// Exit code of the last attempt, `None` if terminated by a signal.
    pub outcome: RetryOutcome<Option<i32>>,
}

/// Row of the failed jobs report.
#[derive(Debug, serde::Serialize)]
struct FailedJobRow<'a> {
    job_id: &'a str,
    run_label: &'a str,
    vcf_file: String,
    hpo_file: String,
    attempts: u32,
    last_error: String,
}

impl<'a> FailedJobRow<'a> {
    fn from_result(result: &'a JobResult) -> Option<Self> {
        let last_error = match &result.outcome {
            RetryOutcome::Succeeded { .. } => return None,
            RetryOutcome::Exhausted {
                last_error: Some(e),
                ..
            } => e.clone(),
            RetryOutcome::Exhausted {
                last_value: Some(Some(code)),
                ..
            } => format!("exit code {}", code),
            RetryOutcome::Exhausted { .. } => "terminated by signal".to_string(),
        };
        Some(Self {
            job_id: &result.job.job_id,
            run_label: &result.job.run_label,
            vcf_file: result.job.vcf_file.to_string(),
            hpo_file: result.job.hpo_file.to_string(),
            attempts: result.outcome.attempts(),
            last_error,
        })
    }
}

/// Estimated wall clock time in hours of running `num_jobs` jobs on `num_threads`.
pub fn estimate_hours(num_jobs: usize, num_threads: usize, minutes_per_job: f64) -> f64 {
    num_jobs as f64 / num_threads.max(1) as f64 * minutes_per_job / 60.0
}

/// Run all `jobs` with `policy` on `num_threads` threads.
///
/// `invoke` runs one attempt of a job and returns its exit code, an exit
/// code of zero is a success.  Failing jobs do not affect the others.
pub fn dispatch_jobs<F>(
    jobs: &[Job],
    policy: &RetryPolicy,
    num_threads: usize,
    invoke: F,
) -> Result<Vec<JobResult>, anyhow::Error>
where
    F: Fn(&Job, u32) -> Result<Option<i32>, anyhow::Error> + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map_err(|e| anyhow::anyhow!("building Rayon thread pool failed: {}", e))?;

    Ok(pool.install(|| {
        jobs.par_iter()
            .map(|job| {
                let outcome = policy.run(|attempt| invoke(job, attempt), |code| *code == Some(0));
                if outcome.is_success() {
                    tracing::debug!("job {} on {} done", &job.job_id, &job.vcf_file);
                } else {
                    tracing::warn!(
                        "job {} on {} failed after {} attempt(s)",
                        &job.job_id,
                        &job.vcf_file,
                        outcome.attempts()
                    );
                }
                JobResult {
                    job: job.clone(),
                    outcome,
                }
            })
            .collect()
    }))
}

/// Write the failed jobs of `results` as TSV to `path`, returns their number.
pub fn write_failed_report(path: &Path, results: &[JobResult]) -> Result<usize, anyhow::Error> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)
        .map_err(|e| anyhow::anyhow!("could not open {:?} for writing: {}", path, e))?;
    // explicit header so that it is also written without failed jobs
    writer.write_record([
        "job_id",
        "run_label",
        "vcf_file",
        "hpo_file",
        "attempts",
        "last_error",
    ])?;
    let mut count = 0;
    for row in results.iter().filter_map(FailedJobRow::from_result) {
        writer.serialize(&row)?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

/// Main entry point for `jobs dispatch` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = Instant::now();
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let conf = PipelineConf::load(&args.path_conf)?;
    let mut runs = conf.runs();
    if !args.run_label.is_empty() {
        for label in &args.run_label {
            if !runs.iter().any(|run| &run.label == label) {
                anyhow::bail!("unknown run label {:?}", label);
            }
        }
        runs.retain(|run| args.run_label.contains(&run.label));
    }
    let jobs = build_jobs(&conf, &runs);

    let num_threads = args
        .num_threads
        .unwrap_or_else(rayon::current_num_threads)
        .max(1);
    tracing::info!(
        "{} jobs for {} runs and {} samples on {} threads, estimated runtime: {:.1} hours",
        jobs.len().separate_with_commas(),
        runs.len(),
        conf.vcf_files.len(),
        num_threads,
        estimate_hours(jobs.len(), num_threads, conf.dispatch.minutes_per_job)
    );

    if args.dry_run {
        for job in &jobs {
            let command = conf.dispatch.command.render(&job.template_values())?;
            tracing::info!("would run: {}", command);
        }
        return Ok(());
    }

    let log_dir = args
        .path_log_dir
        .clone()
        .unwrap_or_else(|| conf.workdir.join("job_logs"));
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", &log_dir, e))?;

    let before_jobs = Instant::now();
    let results = dispatch_jobs(&jobs, &conf.dispatch.retry, num_threads, |job, attempt| {
        let command = conf.dispatch.command.render(&job.template_values())?;
        tracing::debug!("attempt {} of job {}: {}", attempt, &job.job_id, &command);
        let log_path = log_dir.join(format!("{}__{}.log", &job.job_id, job.vcf_file.file_stem()));
        Ok(command.run(&log_path)?.code())
    })?;
    tracing::info!("... ran jobs in {:?}", before_jobs.elapsed());

    let report = args
        .path_report
        .clone()
        .unwrap_or_else(|| conf.workdir.join("failed_jobs.tsv"));
    let failed = write_failed_report(&report, &results)?;

    tracing::info!(
        "All of `jobs dispatch` completed in {:?}",
        before_anything.elapsed()
    );
    if failed > 0 {
        return Err(AppError::JobsFailed {
            failed,
            total: results.len(),
            report: report.display().to_string(),
        }
        .into());
    }
    Ok(())
}
