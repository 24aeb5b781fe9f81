//! Implementation of `terms combine` sub command.
//!
//! The NLP engine writes one raw term file per patient.  These are fetched
//! for each configured VCF file and concatenated into the block format.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;

use super::read_blocks_from_path;
use crate::common::s3::ObjectLocation;
use crate::common::store::ObjectStore;
use crate::conf::PipelineConf;
use crate::err::AppError;

/// Command line arguments for `terms combine` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Combine per-patient NLP term files", long_about = None)]
pub struct Args {
    /// Path to the pipeline configuration YAML file.
    #[arg(long, required = true)]
    pub path_conf: PathBuf,
    /// Use this local directory as object store instead of S3.
    #[arg(long)]
    pub path_local_store: Option<PathBuf>,
}

/// Patient ID and key of the raw term file that belong to `vcf_file`.
///
/// The patient ID is the file stem, e.g., `MAN_0001-01.hg19`, and the raw
/// terms are stored as `<orig_dirname>/0001-01.csv`.
pub fn raw_terms_key(
    orig_dirname: &str,
    vcf_file: &ObjectLocation,
) -> Result<(String, String), AppError> {
    let re = regex::Regex::new(r"MAN_(\d+-\d+)").map_err(|e| AppError::Config {
        path: vcf_file.to_string(),
        reason: e.to_string(),
    })?;
    let caps = re
        .captures(vcf_file.basename())
        .ok_or_else(|| AppError::Config {
            path: vcf_file.to_string(),
            reason: "VCF file name has no MAN_<digits>-<digits> sample ID".to_string(),
        })?;
    Ok((
        vcf_file.file_stem().to_string(),
        format!("{}/{}.csv", orig_dirname, &caps[1]),
    ))
}

/// Lower-case the `HP` tag at line starts and terminate the last line.
pub fn normalize_raw_terms(body: &str) -> String {
    let mut result = body.replace("\nHP", "\nhp");
    if !result.ends_with('\n') {
        result.push('\n');
    }
    result
}

/// Fetch the raw term files of all samples and write the combined file to `path_out`.
pub async fn combine_to_path(
    store: &ObjectStore,
    conf: &PipelineConf,
    path_out: &Path,
) -> Result<(), anyhow::Error> {
    let mut writer = std::io::BufWriter::new(
        std::fs::File::create(path_out)
            .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", path_out, e))?,
    );
    for vcf_file in &conf.vcf_files {
        let (patient, key) = raw_terms_key(&conf.nlp_terms_orig_dirname, vcf_file)?;
        let body = store.get_string(&conf.bucket_object(&key)).await?;
        tracing::debug!("adding terms of {} from {}", &patient, &key);
        write!(writer, "{}\n{}", &patient, normalize_raw_terms(&body))?;
    }
    writer.flush()?;
    Ok(())
}

/// Main entry point for `terms combine` sub command.
pub async fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = Instant::now();
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let conf = PipelineConf::load(&args.path_conf)?;
    let store = ObjectStore::from_env(args.path_local_store.as_deref()).await?;
    std::fs::create_dir_all(&conf.workdir)
        .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", &conf.workdir, e))?;

    tracing::info!("Combining terms of {} samples...", conf.vcf_files.len());
    let path_out = conf.workdir.join(&conf.nlp_terms_filename);
    combine_to_path(&store, &conf, &path_out).await?;
    let records = read_blocks_from_path(&path_out)?;
    tracing::info!(
        "... wrote {} term records to {}",
        records.len(),
        path_out.display()
    );

    store
        .upload(&path_out, &conf.bucket_object(&conf.nlp_terms_filename))
        .await?;

    tracing::info!(
        "All of `terms combine` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(())
}
