//! Reference tables with ontology depth and clade membership per HPO term.

use std::collections::HashMap;
use std::path::Path;

use indexmap::IndexSet;

/// Cell values that mark a missing number, as written by pandas.
const NA_VALUES: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// Deserialize a depth cell, missing values and `NaN` become `None`.
fn from_depth_cell<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: String = serde::Deserialize::deserialize(deserializer)?;
    let value = value.trim();
    if NA_VALUES.contains(&value) {
        return Ok(None);
    }
    let depth = value
        .parse::<f64>()
        .map_err(|e| serde::de::Error::custom(format!("invalid depth {:?}: {}", value, e)))?;
    Ok(if depth.is_nan() { None } else { Some(depth) })
}

/// Row of the depth table; further columns in the file are ignored.
#[derive(Debug, Clone, serde::Deserialize)]
struct DepthRow {
    #[serde(rename = "HPO_ID")]
    hpo_id: String,
    /// Shortest path length to an ontology root, `None` if unknown.
    #[serde(deserialize_with = "from_depth_cell")]
    min_path_length: Option<f64>,
}

/// Row of the clade membership table, one per (term, clade) pair.
#[derive(Debug, Clone, serde::Deserialize)]
struct CladeRow {
    #[serde(rename = "HPO_ID")]
    hpo_id: String,
    /// The top-level phenotype the term descends from.
    root_phenos: Option<String>,
}

/// Fail unless the CSV header of `rdr` has all of `columns`.
fn require_columns<R: std::io::Read>(
    rdr: &mut csv::Reader<R>,
    columns: &[&str],
    path: &Path,
) -> Result<(), anyhow::Error> {
    let headers = rdr
        .headers()
        .map_err(|e| anyhow::anyhow!("could not read header of {:?}: {}", path, e))?;
    for column in columns {
        if !headers.iter().any(|h| h == *column) {
            anyhow::bail!("column {:?} missing in {:?}", column, path);
        }
    }
    Ok(())
}

/// Minimal shortest-path depth per HPO term ID.
#[derive(Debug, Clone, Default)]
pub struct DepthTable {
    depths: HashMap<String, f64>,
}

impl DepthTable {
    /// Build from `(hpo_id, depth)` pairs, keeping the minimal depth per ID.
    ///
    /// `NaN` depths are undefined and skipped.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        let mut depths: HashMap<String, f64> = HashMap::new();
        for (hpo_id, depth) in pairs.into_iter().filter(|(_, depth)| !depth.is_nan()) {
            depths
                .entry(hpo_id)
                .and_modify(|d| *d = d.min(depth))
                .or_insert(depth);
        }
        Self { depths }
    }

    /// Load from the CSV file at `path`; needs `HPO_ID` and `min_path_length` columns.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path.as_ref())
            .map_err(|e| anyhow::anyhow!("could not open {:?}: {}", path.as_ref(), e))?;
        require_columns(&mut rdr, &["HPO_ID", "min_path_length"], path.as_ref())?;
        let mut pairs = Vec::new();
        for result in rdr.deserialize() {
            let row: DepthRow = result
                .map_err(|e| anyhow::anyhow!("invalid depth row in {:?}: {}", path.as_ref(), e))?;
            if let Some(depth) = row.min_path_length {
                pairs.push((row.hpo_id, depth));
            }
        }
        Ok(Self::from_pairs(pairs))
    }

    /// Depth of `hpo_id`, `None` if undefined.
    pub fn get(&self, hpo_id: &str) -> Option<f64> {
        self.depths.get(hpo_id).copied()
    }

    pub fn len(&self) -> usize {
        self.depths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depths.is_empty()
    }
}

/// Clade memberships per HPO term ID.
#[derive(Debug, Clone, Default)]
pub struct CladeTable {
    clades: HashMap<String, IndexSet<String>>,
}

impl CladeTable {
    /// Build from `(hpo_id, clade)` pairs.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut clades: HashMap<String, IndexSet<String>> = HashMap::new();
        for (hpo_id, clade) in pairs {
            clades.entry(hpo_id).or_default().insert(clade);
        }
        Self { clades }
    }

    /// Load from the CSV file at `path`; needs `HPO_ID` and `root_phenos` columns.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path.as_ref())
            .map_err(|e| anyhow::anyhow!("could not open {:?}: {}", path.as_ref(), e))?;
        require_columns(&mut rdr, &["HPO_ID", "root_phenos"], path.as_ref())?;
        let mut pairs = Vec::new();
        for result in rdr.deserialize() {
            let row: CladeRow = result
                .map_err(|e| anyhow::anyhow!("invalid clade row in {:?}: {}", path.as_ref(), e))?;
            match row.root_phenos {
                Some(clade) if !clade.trim().is_empty() => {
                    pairs.push((row.hpo_id, clade.trim().to_string()))
                }
                _ => (),
            }
        }
        Ok(Self::from_pairs(pairs))
    }

    /// Clades of `hpo_id`; empty if the term has no known membership.
    pub fn get(&self, hpo_id: &str) -> impl Iterator<Item = &str> {
        self.clades
            .get(hpo_id)
            .into_iter()
            .flat_map(|clades| clades.iter().map(|c| c.as_str()))
    }

    pub fn len(&self) -> usize {
        self.clades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clades.is_empty()
    }
}
