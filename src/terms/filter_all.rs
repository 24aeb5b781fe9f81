//! Implementation of `terms filter-all` sub command.

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use indexmap::IndexSet;
use rayon::prelude::*;
use thousands::Separable;

use super::filter::{filter_to_dir, FilterFile, FilterParams};
use super::read_blocks_from_path;
use super::refs::{CladeTable, DepthTable};
use crate::common::s3::ObjectLocation;
use crate::common::store::ObjectStore;
use crate::common::trace_rss_now;
use crate::conf::PipelineConf;

/// Command line arguments for `terms filter-all` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Filter NLP term lists for all configured runs", long_about = None)]
pub struct Args {
    /// Path to the pipeline configuration YAML file.
    #[arg(long, required = true)]
    pub path_conf: PathBuf,
    /// Use this local directory as object store instead of S3.
    #[arg(long)]
    pub path_local_store: Option<PathBuf>,
    /// Set the number of threads to use, defaults to number of cores.
    #[arg(long)]
    pub num_threads: Option<usize>,
}

/// Download `loc` into the work directory unless present there already.
async fn fetch_to_workdir(
    store: &ObjectStore,
    conf: &PipelineConf,
    loc: &ObjectLocation,
) -> Result<PathBuf, anyhow::Error> {
    let path = conf.workdir.join(loc.basename());
    if path.exists() {
        tracing::debug!("using existing {:?}", &path);
    } else {
        store.download(loc, &path).await?;
    }
    Ok(path)
}

/// Main entry point for `terms filter-all` sub command.
pub async fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = Instant::now();
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let conf = PipelineConf::load(&args.path_conf)?;
    let store = ObjectStore::from_env(args.path_local_store.as_deref()).await?;
    let output_dir = conf.nlp_output_path();
    std::fs::create_dir_all(&output_dir)
        .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", &output_dir, e))?;

    tracing::info!("Loading reference tables and terms...");
    let depths = DepthTable::load(
        fetch_to_workdir(&store, &conf, &conf.bucket_object(&conf.depth_table_key)).await?,
    )?;
    let clades = CladeTable::load(
        fetch_to_workdir(&store, &conf, &conf.bucket_object(&conf.clade_table_key)).await?,
    )?;
    let raw_terms = read_blocks_from_path(
        fetch_to_workdir(&store, &conf, &conf.bucket_object(&conf.nlp_terms_filename)).await?,
    )?;
    tracing::info!(
        "... loaded {} term records, depths of {} and clades of {} terms",
        raw_terms.len().separate_with_commas(),
        depths.len().separate_with_commas(),
        clades.len().separate_with_commas()
    );
    trace_rss_now();

    // runs with the same parameters share one output file
    let params = conf
        .runs()
        .iter()
        .filter_map(|run| run.filter_params().cloned())
        .collect::<IndexSet<FilterParams>>()
        .into_iter()
        .collect::<Vec<_>>();

    tracing::info!("Filtering for {} parameter sets...", params.len());
    let before_filter = Instant::now();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.num_threads.unwrap_or(0))
        .build()
        .map_err(|e| anyhow::anyhow!("building Rayon thread pool failed: {}", e))?;
    let files = pool.install(|| {
        params
            .par_iter()
            .map(|params| {
                filter_to_dir(
                    &raw_terms,
                    &depths,
                    &clades,
                    params,
                    &output_dir,
                    &conf.nlp_hpo_filename_prefix,
                )
            })
            .collect::<Result<Vec<FilterFile>, _>>()
    })?;
    tracing::info!(
        "... done filtering ({} cached) in {:?}",
        files.iter().filter(|f| f.cached).count(),
        before_filter.elapsed()
    );

    tracing::info!("Uploading {} files...", files.len());
    for file in &files {
        store
            .upload(
                &output_dir.join(&file.filename),
                &conf.bucket_object(&file.filename),
            )
            .await?;
    }

    tracing::info!(
        "All of `terms filter-all` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::*;

    fn setup(tmp_dir: &Path) -> Result<Args, anyhow::Error> {
        let bucket = tmp_dir.join("store/mybucket");
        std::fs::create_dir_all(&bucket)?;
        std::fs::copy("tests/terms/raw_terms.txt", bucket.join("UnDx_output.txt"))?;
        for name in [
            "hpo_multishortest_paths_stats.csv",
            "hpo_multishortest_paths.csv",
        ] {
            std::fs::copy(format!("tests/terms/refs/{}", name), bucket.join(name))?;
        }

        let minimal = std::fs::read_to_string("tests/conf/minimal.yaml")?;
        let path_conf = tmp_dir.join("conf.yaml");
        std::fs::write(
            &path_conf,
            format!(
                "{}runs:\n  - label: Manual\n    kind: manual\n  - label: NLP\n    kind: nlp\n  \
                 - label: NLP_default\n    kind: nlp\n  \
                 - label: strict\n    kind: nlp\n    min_freq: 40\n    min_depth: 4\n    \
                 max_clades: 1\n    min_terms: 0\n",
                minimal.replace("/tmp/pheno", &tmp_dir.join("work").display().to_string())
            ),
        )?;

        Ok(Args {
            path_conf,
            path_local_store: Some(tmp_dir.join("store")),
            num_threads: Some(2),
        })
    }

    #[tokio::test]
    async fn run_filters_and_uploads() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let args = setup(&tmp_dir)?;

        run(&crate::common::Args::default(), &args).await?;

        let bucket = tmp_dir.join("store/mybucket");
        let mut expected = std::fs::File::open("tests/terms/filtered_fp40_d4_c1.txt")?;
        let mut actual = std::fs::File::open(bucket.join(
            "UnDx_NLPoutput_minfreqpercent40_mindepth4_maxdepth100_numclades1.txt",
        ))?;
        assert!(file_diff::diff_files(&mut expected, &mut actual));

        // every patient is restored with the default minimum of five terms
        let mut expected = std::fs::File::open("tests/terms/raw_terms.txt")?;
        let mut actual = std::fs::File::open(bucket.join(
            "UnDx_NLPoutput_minfreqpercent0_mindepth0_maxdepth100_numclades100.txt",
        ))?;
        assert!(file_diff::diff_files(&mut expected, &mut actual));

        let mut outputs = std::fs::read_dir(tmp_dir.join("work/UnDx_filtered_NLP_outputs"))?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        outputs.retain(|name| !name.starts_with('.'));
        assert_eq!(outputs.len(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn run_twice_keeps_outputs() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let args = setup(&tmp_dir)?;

        run(&crate::common::Args::default(), &args).await?;
        let path = tmp_dir.join(
            "work/UnDx_filtered_NLP_outputs/\
             UnDx_NLPoutput_minfreqpercent40_mindepth4_maxdepth100_numclades1.txt",
        );
        std::fs::write(&path, "MAN_0001-01\nCriterion,Frequency\nhp0012531_Pain,16\n")?;
        run(&crate::common::Args::default(), &args).await?;

        assert_eq!(
            std::fs::read_to_string(tmp_dir.join(
                "store/mybucket/UnDx_NLPoutput_minfreqpercent40_mindepth4_maxdepth100_numclades1.txt"
            ))?,
            "MAN_0001-01\nCriterion,Frequency\nhp0012531_Pain,16\n"
        );

        Ok(())
    }
}
