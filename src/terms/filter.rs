//! Filtering of per-patient NLP term lists by frequency, depth, and clade diversity.
//!
//! All stages use the patient-relative percentile rank of the raw frequency.
//! Patients left with too few terms get their complete original list back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;
use indexmap::{IndexMap, IndexSet};
use thousands::Separable;

use super::refs::{CladeTable, DepthTable};
use super::{dedup_records, read_blocks_from_path, write_blocks_to_path, TermRecord};
use crate::common::trace_rss_now;

/// Interpretation of the minimal frequency threshold.
#[derive(
    serde::Serialize,
    serde::Deserialize,
    clap::ValueEnum,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FreqMode {
    /// Threshold on the patient-relative percentile, in percent.
    #[default]
    Percentile,
    /// Threshold on the raw frequency.
    Absolute,
}

/// Default for the minimal number of terms per patient.
pub fn default_min_terms() -> usize {
    5
}

/// Parameters of one filter invocation.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct FilterParams {
    /// Minimal frequency, interpreted according to `freq_mode`.
    pub min_freq: u32,
    pub freq_mode: FreqMode,
    /// Minimal ontology depth (inclusive).
    pub min_depth: u32,
    /// Maximal ontology depth (inclusive).
    pub max_depth: u32,
    /// Maximal dense rank of a term's clade.
    pub max_clades: u32,
    /// Patients with at most this many terms left are reset to their full list.
    pub min_terms: usize,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            min_freq: 0,
            freq_mode: FreqMode::Percentile,
            min_depth: 0,
            max_depth: 100,
            max_clades: 100,
            min_terms: default_min_terms(),
        }
    }
}

/// Name of the output file for `params`, also used as the cache key.
pub fn output_filename(prefix: &str, params: &FilterParams) -> String {
    format!(
        "{}_minfreq{}{}_mindepth{}_maxdepth{}_numclades{}.txt",
        prefix,
        if params.freq_mode == FreqMode::Percentile {
            "percent"
        } else {
            ""
        },
        params.min_freq,
        params.min_depth,
        params.max_depth,
        params.max_clades
    )
}

/// Fractional rank of a frequency among the frequencies of the same patient.
///
/// Stored as twice the (average) rank and the group size so that threshold
/// checks are exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Percentile {
    twice_rank: u64,
    count: u64,
}

impl Percentile {
    /// The percentile as a fraction in `(0, 1]`.
    pub fn value(&self) -> f64 {
        self.twice_rank as f64 / (2 * self.count) as f64
    }

    /// Whether `100 * self.value() >= percent`.
    pub fn is_at_least(&self, percent: u32) -> bool {
        self.twice_rank * 100 >= 2 * percent as u64 * self.count
    }
}

/// Compute the percentile of each record within its patient.
///
/// Ties receive the average of their ascending ranks.
pub fn percentiles(records: &[TermRecord]) -> Vec<Percentile> {
    let mut by_patient: IndexMap<&str, Vec<usize>> = IndexMap::new();
    for (i, record) in records.iter().enumerate() {
        by_patient.entry(record.patient.as_str()).or_default().push(i);
    }

    let mut result = vec![Percentile::default(); records.len()];
    for idxs in by_patient.values() {
        let mut sorted = idxs.clone();
        sorted.sort_by_key(|&i| records[i].frequency);
        let count = sorted.len() as u64;

        let mut start = 0;
        while start < sorted.len() {
            let frequency = records[sorted[start]].frequency;
            let end = start
                + sorted[start..]
                    .iter()
                    .take_while(|&&i| records[i].frequency == frequency)
                    .count();
            // 1-based ranks `start + 1..=end` share their average.
            let twice_rank = (start + 1 + end) as u64;
            for &i in &sorted[start..end] {
                result[i] = Percentile { twice_rank, count };
            }
            start = end;
        }
    }

    result
}

/// Clade of a term row; terms without membership go to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Clade<'a> {
    Known(&'a str),
    Unknown,
}

/// Result of filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Surviving records, rescued patients last.
    pub records: Vec<TermRecord>,
    /// Patients whose full original list was restored.
    pub rescued_patients: Vec<String>,
}

/// Keep the row indices of `rows` whose clade is unknown or ranks within `max_clades`.
///
/// The clade frequency is the mean percentile of a patient's rows in that
/// clade; clades are ranked per patient by descending clade frequency with
/// dense ranks.
fn filter_by_clades<'a>(
    records: &'a [TermRecord],
    percentiles: &[Percentile],
    rows: &[(usize, Clade<'a>)],
    max_clades: u32,
) -> Vec<usize> {
    let mut sums: IndexMap<(&str, Clade), (f64, usize)> = IndexMap::new();
    for &(i, clade) in rows {
        let entry = sums
            .entry((records[i].patient.as_str(), clade))
            .or_insert((0.0, 0));
        entry.0 += percentiles[i].value();
        entry.1 += 1;
    }
    let means: HashMap<(&str, Clade), f64> = sums
        .into_iter()
        .map(|(key, (sum, n))| (key, sum / n as f64))
        .collect();

    let mut distinct: HashMap<&str, Vec<f64>> = HashMap::new();
    for ((patient, _), mean) in &means {
        distinct.entry(*patient).or_default().push(*mean);
    }
    for values in distinct.values_mut() {
        values.sort_by(|a, b| b.total_cmp(a));
        values.dedup();
    }

    rows.iter()
        .filter(|(i, clade)| match clade {
            Clade::Unknown => true,
            Clade::Known(_) => {
                let patient = records[*i].patient.as_str();
                let mean = means[&(patient, *clade)];
                let rank = distinct[patient]
                    .iter()
                    .position(|m| *m == mean)
                    .map(|pos| pos + 1)
                    .unwrap_or(usize::MAX);
                rank <= max_clades as usize
            }
        })
        .map(|(i, _)| *i)
        .collect()
}

/// Filter `raw_terms` according to `params`.
pub fn filter_terms(
    raw_terms: &[TermRecord],
    depths: &DepthTable,
    clades: &CladeTable,
    params: &FilterParams,
) -> FilterOutcome {
    let records = dedup_records(raw_terms);
    let percentiles = percentiles(&records);
    let hpo_ids = records.iter().map(|r| r.hpo_id()).collect::<Vec<_>>();

    let by_freq = (0..records.len())
        .filter(|&i| match params.freq_mode {
            FreqMode::Percentile => percentiles[i].is_at_least(params.min_freq),
            FreqMode::Absolute => records[i].frequency >= params.min_freq as i64,
        })
        .collect::<Vec<_>>();

    let by_depth = by_freq
        .into_iter()
        .filter(|&i| match depths.get(&hpo_ids[i]) {
            Some(depth) => depth >= params.min_depth as f64 && depth <= params.max_depth as f64,
            None => true,
        })
        .collect::<Vec<_>>();

    let clade_rows = by_depth
        .iter()
        .flat_map(|&i| {
            let known = clades
                .get(&hpo_ids[i])
                .map(|clade| (i, Clade::Known(clade)))
                .collect::<Vec<_>>();
            if known.is_empty() {
                vec![(i, Clade::Unknown)]
            } else {
                known
            }
        })
        .collect::<Vec<_>>();
    let kept = filter_by_clades(&records, &percentiles, &clade_rows, params.max_clades)
        .into_iter()
        .collect::<IndexSet<_>>();
    tracing::debug!(
        "{} records, {} after frequency/depth filter, {} after clade filter",
        records.len(),
        by_depth.len(),
        kept.len()
    );

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for &i in &kept {
        *counts.entry(records[i].patient.as_str()).or_default() += 1;
    }
    let rescued = records
        .iter()
        .map(|r| r.patient.as_str())
        .filter(|patient| {
            counts
                .get(patient)
                .map(|count| *count <= params.min_terms)
                .unwrap_or(true)
        })
        .collect::<IndexSet<_>>();

    let mut result = kept
        .iter()
        .map(|&i| &records[i])
        .filter(|r| !rescued.contains(r.patient.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    result.extend(
        records
            .iter()
            .filter(|r| rescued.contains(r.patient.as_str()))
            .cloned(),
    );

    FilterOutcome {
        records: result,
        rescued_patients: rescued.into_iter().map(String::from).collect(),
    }
}

/// Result of `filter_to_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterFile {
    /// Name of the output file within the output directory.
    pub filename: String,
    /// Whether the file existed already and nothing was computed.
    pub cached: bool,
}

/// Name of the hidden file next to `filename` that records its parameters.
fn params_filename(filename: &str) -> String {
    format!(".{}.params.json", filename)
}

/// Fail if the parameters recorded for a cached output differ from `params`.
///
/// The output file name does not carry `min_terms`, the recorded parameters do.
fn check_cached_params(
    output_dir: &Path,
    filename: &str,
    params: &FilterParams,
) -> Result<(), anyhow::Error> {
    let path = output_dir.join(params_filename(filename));
    if !path.exists() {
        tracing::debug!("no parameters recorded for {}", filename);
        return Ok(());
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("could not read {:?}: {}", &path, e))?;
    let recorded: FilterParams = serde_json::from_str(&text)
        .map_err(|e| anyhow::anyhow!("invalid parameters in {:?}: {}", &path, e))?;
    if &recorded != params {
        anyhow::bail!(
            "{} exists but was written with {:?}, not {:?}",
            filename,
            recorded,
            params
        );
    }
    Ok(())
}

/// Filter `raw_terms` and write the result to `output_dir`.
///
/// Nothing is computed when the output file for `params` exists already.  It
/// is an error if that file was written with different parameters.
pub fn filter_to_dir(
    raw_terms: &[TermRecord],
    depths: &DepthTable,
    clades: &CladeTable,
    params: &FilterParams,
    output_dir: &Path,
    prefix: &str,
) -> Result<FilterFile, anyhow::Error> {
    let filename = output_filename(prefix, params);
    let path = output_dir.join(&filename);
    if path.exists() {
        check_cached_params(output_dir, &filename, params)?;
        tracing::debug!("{:?} exists, skipping", &path);
        return Ok(FilterFile {
            filename,
            cached: true,
        });
    }

    let outcome = filter_terms(raw_terms, depths, clades, params);
    if !outcome.rescued_patients.is_empty() {
        tracing::info!(
            "{}: restored full term list for {} patient(s): {}",
            &filename,
            outcome.rescued_patients.len(),
            outcome.rescued_patients.join(", ")
        );
    }

    let path_params = output_dir.join(params_filename(&filename));
    std::fs::write(&path_params, serde_json::to_string(params)?)
        .map_err(|e| anyhow::anyhow!("could not write {:?}: {}", &path_params, e))?;
    let tmp_path = output_dir.join(format!(".{}.tmp", &filename));
    write_blocks_to_path(&tmp_path, &outcome.records)?;
    std::fs::rename(&tmp_path, &path)
        .map_err(|e| anyhow::anyhow!("could not move {:?} to {:?}: {}", &tmp_path, &path, e))?;

    Ok(FilterFile {
        filename,
        cached: false,
    })
}

/// Command line arguments for `terms filter` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Filter NLP term lists with one parameter set", long_about = None)]
pub struct Args {
    /// Path to the combined per-patient term file.
    #[arg(long, required = true)]
    pub path_input: PathBuf,
    /// Path to the CSV file with `HPO_ID` and `min_path_length`.
    #[arg(long, required = true)]
    pub path_depth_table: PathBuf,
    /// Path to the CSV file with `HPO_ID` and `root_phenos`.
    #[arg(long, required = true)]
    pub path_clade_table: PathBuf,
    /// Directory to write the filtered file to.
    #[arg(long, required = true)]
    pub path_output_dir: PathBuf,
    /// Prefix of the output file name.
    #[arg(long, default_value = "NLPoutput")]
    pub prefix: String,

    /// Minimal frequency.
    #[arg(long, default_value_t = 0)]
    pub min_freq: u32,
    /// Interpretation of `--min-freq`.
    #[arg(long, value_enum, default_value_t = FreqMode::Percentile)]
    pub freq_mode: FreqMode,
    /// Minimal ontology depth.
    #[arg(long, default_value_t = 0)]
    pub min_depth: u32,
    /// Maximal ontology depth.
    #[arg(long, default_value_t = 100)]
    pub max_depth: u32,
    /// Maximal rank of a term's clade.
    #[arg(long, default_value_t = 100)]
    pub max_clades: u32,
    /// Minimal number of terms per patient.
    #[arg(long, default_value_t = 5)]
    pub min_terms: usize,
}

impl Args {
    pub fn params(&self) -> FilterParams {
        FilterParams {
            min_freq: self.min_freq,
            freq_mode: self.freq_mode,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
            max_clades: self.max_clades,
            min_terms: self.min_terms,
        }
    }
}

/// Main entry point for `terms filter` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = Instant::now();
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    tracing::info!("Loading reference tables...");
    let depths = DepthTable::load(&args.path_depth_table)?;
    let clades = CladeTable::load(&args.path_clade_table)?;
    tracing::info!(
        "...loaded depths for {} and clades for {} terms",
        depths.len().separate_with_commas(),
        clades.len().separate_with_commas()
    );

    tracing::info!("Loading terms...");
    let raw_terms = read_blocks_from_path(&args.path_input)?;
    tracing::info!(
        "...loaded {} term records",
        raw_terms.len().separate_with_commas()
    );
    trace_rss_now();

    std::fs::create_dir_all(&args.path_output_dir)?;
    let result = filter_to_dir(
        &raw_terms,
        &depths,
        &clades,
        &args.params(),
        &args.path_output_dir,
        &args.prefix,
    )?;
    tracing::info!(
        "wrote {} (cached: {})",
        args.path_output_dir.join(&result.filename).display(),
        result.cached
    );

    tracing::info!(
        "All of `terms filter` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(())
}
