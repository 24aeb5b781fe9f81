//! Run specifications, i.e., the phenotype sources that scoring jobs are run with.

use std::collections::{HashMap, HashSet};

use itertools::iproduct;
use serde::{Deserialize, Serialize};

use crate::terms::filter::{default_min_terms, output_filename, FilterParams, FreqMode};

/// Source of the phenotype terms of a run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RunKind {
    /// The manually curated term file.
    Manual,
    /// NLP terms filtered with the given parameters.
    Nlp(FilterParams),
}

/// A named run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RunSpec {
    /// Label of the run, also used for the job ID.
    pub label: String,
    #[serde(flatten)]
    pub kind: RunKind,
}

impl RunSpec {
    /// The run with manually curated terms.
    pub fn manual() -> Self {
        Self {
            label: "Manual".to_string(),
            kind: RunKind::Manual,
        }
    }

    /// An NLP run labeled after its non-default parameters.
    pub fn nlp(params: FilterParams) -> Self {
        Self {
            label: nlp_label(&params),
            kind: RunKind::Nlp(params),
        }
    }

    /// Filter parameters of NLP runs.
    pub fn filter_params(&self) -> Option<&FilterParams> {
        match &self.kind {
            RunKind::Manual => None,
            RunKind::Nlp(params) => Some(params),
        }
    }
}

/// Label of an NLP run, e.g., `NLP_fp40_c2_d4`.
pub fn nlp_label(params: &FilterParams) -> String {
    let mut label = "NLP".to_string();
    if params.min_freq != 0 {
        label.push_str(&format!("_fp{}", params.min_freq));
    }
    if params.max_clades != 100 {
        label.push_str(&format!("_c{}", params.max_clades));
    }
    if params.min_depth != 0 {
        label.push_str(&format!("_d{}", params.min_depth));
    }
    if params.max_depth != 100 {
        label.push_str(&format!("_maxd{}", params.max_depth));
    }
    label
}

/// Parameter grid whose Cartesian product gives the NLP runs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RunGrid {
    pub min_freq: Vec<u32>,
    pub freq_mode: FreqMode,
    pub max_clades: Vec<u32>,
    pub min_depth: Vec<u32>,
    pub max_depth: Vec<u32>,
    pub min_terms: usize,
}

impl Default for RunGrid {
    fn default() -> Self {
        Self {
            min_freq: vec![0, 40, 50, 60, 70, 80, 90],
            freq_mode: FreqMode::Percentile,
            max_clades: vec![100, 2, 4, 6, 8, 10, 12],
            min_depth: vec![0, 4, 5, 6, 7, 8],
            max_depth: vec![100],
            min_terms: default_min_terms(),
        }
    }
}

impl RunGrid {
    /// One NLP run per parameter combination.
    pub fn expand(&self) -> Vec<RunSpec> {
        iproduct!(
            self.min_freq.iter(),
            self.max_clades.iter(),
            self.min_depth.iter(),
            self.max_depth.iter()
        )
        .map(|(&min_freq, &max_clades, &min_depth, &max_depth)| {
            RunSpec::nlp(FilterParams {
                min_freq,
                freq_mode: self.freq_mode,
                min_depth,
                max_depth,
                max_clades,
                min_terms: self.min_terms,
            })
        })
        .collect()
    }
}

/// The manual run followed by the runs of `grid`.
pub fn default_runs(grid: &RunGrid) -> Vec<RunSpec> {
    let mut runs = vec![RunSpec::manual()];
    runs.extend(grid.expand());
    runs
}

/// Ensure that all run labels are unique.
pub fn check_unique_labels(runs: &[RunSpec]) -> Result<(), anyhow::Error> {
    let mut seen = HashSet::new();
    for run in runs {
        if !seen.insert(run.label.as_str()) {
            anyhow::bail!("duplicate run label {:?}", &run.label);
        }
    }
    Ok(())
}

/// Fail if two NLP runs share an output file but filter differently.
///
/// The file name does not carry `min_terms`, so such runs would silently
/// read each other's terms.
pub fn check_output_filenames(runs: &[RunSpec], prefix: &str) -> Result<(), anyhow::Error> {
    let mut seen: HashMap<String, (&str, &FilterParams)> = HashMap::new();
    for run in runs {
        let Some(params) = run.filter_params() else {
            continue;
        };
        let filename = output_filename(prefix, params);
        match seen.get(&filename) {
            Some((label, other)) if *other != params => anyhow::bail!(
                "runs {:?} and {:?} both write {} but differ in their parameters",
                label,
                &run.label,
                &filename
            ),
            Some(_) => (),
            None => {
                seen.insert(filename, (run.label.as_str(), params));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[rstest::rstest]
    #[case(0, 100, 0, 100, "NLP")]
    #[case(40, 100, 0, 100, "NLP_fp40")]
    #[case(0, 2, 0, 100, "NLP_c2")]
    #[case(0, 100, 4, 100, "NLP_d4")]
    #[case(90, 12, 8, 100, "NLP_fp90_c12_d8")]
    #[case(50, 100, 5, 20, "NLP_fp50_d5_maxd20")]
    fn labels(
        #[case] min_freq: u32,
        #[case] max_clades: u32,
        #[case] min_depth: u32,
        #[case] max_depth: u32,
        #[case] expected: &str,
    ) {
        let params = FilterParams {
            min_freq,
            max_clades,
            min_depth,
            max_depth,
            ..Default::default()
        };

        assert_eq!(nlp_label(&params), expected);
    }

    #[test]
    fn default_grid() -> Result<(), anyhow::Error> {
        let runs = default_runs(&RunGrid::default());

        assert_eq!(runs.len(), 295);
        assert_eq!(runs[0], RunSpec::manual());
        assert_eq!(runs[1].label, "NLP");
        assert_eq!(runs[2].label, "NLP_d4");
        assert_eq!(runs[294].label, "NLP_fp90_c12_d8");
        assert!(runs[1..]
            .iter()
            .all(|run| run.filter_params().map(|p| p.min_terms) == Some(5)));
        check_unique_labels(&runs)?;

        Ok(())
    }

    #[test]
    fn duplicate_labels_rejected() {
        let runs = vec![
            RunSpec::manual(),
            RunSpec::nlp(FilterParams::default()),
            RunSpec::nlp(FilterParams::default()),
        ];

        assert!(check_unique_labels(&runs).is_err());
    }

    #[test]
    fn shared_output_file_needs_equal_params() -> Result<(), anyhow::Error> {
        let strict = FilterParams {
            min_freq: 50,
            ..Default::default()
        };
        let runs = vec![
            RunSpec {
                label: "a".to_string(),
                kind: RunKind::Nlp(strict.clone()),
            },
            RunSpec {
                label: "b".to_string(),
                kind: RunKind::Nlp(strict.clone()),
            },
        ];
        check_output_filenames(&runs, "UnDx_NLPoutput")?;

        let runs = vec![
            RunSpec::manual(),
            RunSpec {
                label: "a".to_string(),
                kind: RunKind::Nlp(strict.clone()),
            },
            RunSpec {
                label: "b".to_string(),
                kind: RunKind::Nlp(FilterParams {
                    min_terms: 0,
                    ..strict
                }),
            },
        ];
        let err = check_output_filenames(&runs, "UnDx_NLPoutput").expect_err("must fail");
        assert!(
            err.to_string()
                .contains("UnDx_NLPoutput_minfreqpercent50_mindepth0_maxdepth100_numclades100.txt"),
            "{}",
            err
        );

        Ok(())
    }

    #[test]
    fn default_runs_have_distinct_output_files() -> Result<(), anyhow::Error> {
        check_output_filenames(&default_runs(&RunGrid::default()), "UnDx_NLPoutput")
    }

    #[test]
    fn parse_runs_yaml() -> Result<(), anyhow::Error> {
        let yaml = "\
- label: Manual
  kind: manual
- label: strict
  kind: nlp
  min_freq: 40
  min_depth: 4
  max_depth: 100
  max_clades: 2
- label: absolute
  kind: nlp
  min_freq: 10
  freq_mode: absolute
  min_depth: 0
  max_depth: 100
  max_clades: 100
  min_terms: 3
";
        let runs: Vec<RunSpec> = serde_yaml::from_str(yaml)?;

        assert_eq!(
            runs,
            vec![
                RunSpec::manual(),
                RunSpec {
                    label: "strict".to_string(),
                    kind: RunKind::Nlp(FilterParams {
                        min_freq: 40,
                        freq_mode: FreqMode::Percentile,
                        min_depth: 4,
                        max_depth: 100,
                        max_clades: 2,
                        min_terms: 5,
                    }),
                },
                RunSpec {
                    label: "absolute".to_string(),
                    kind: RunKind::Nlp(FilterParams {
                        min_freq: 10,
                        freq_mode: FreqMode::Absolute,
                        min_depth: 0,
                        max_depth: 100,
                        max_clades: 100,
                        min_terms: 3,
                    }),
                },
            ]
        );

        Ok(())
    }
}
