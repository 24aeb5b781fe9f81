//! Conversion of the scoring tool's JSON gene results into a TSV table.

use std::path::Path;

/// Gene entry of the JSON result; further fields are ignored.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneResult {
    pub gene_symbol: String,
    pub combined_score: f64,
    pub variant_score: f64,
    pub priority_score: f64,
}

/// Row of the TSV table.
#[derive(Debug, serde::Serialize)]
struct TabRow<'a> {
    #[serde(rename = "Gene")]
    gene: &'a str,
    #[serde(rename = "Combined_Score")]
    combined_score: f64,
    #[serde(rename = "Genetic_Score")]
    genetic_score: f64,
    #[serde(rename = "Phenotype_score")]
    phenotype_score: f64,
}

/// Load the gene results from the JSON file at `path`.
pub fn load_gene_results(path: &Path) -> Result<Vec<GeneResult>, anyhow::Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("could not open {:?}: {}", path, e))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|e| anyhow::anyhow!("could not parse gene results {:?}: {}", path, e))
}

/// Write `genes` as tab-separated table, in input order.
pub fn write_tab<W: std::io::Write>(writer: W, genes: &[GeneResult]) -> Result<(), anyhow::Error> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(writer);
    if genes.is_empty() {
        writer.write_record(["Gene", "Combined_Score", "Genetic_Score", "Phenotype_score"])?;
    }
    for gene in genes {
        writer.serialize(TabRow {
            gene: &gene.gene_symbol,
            combined_score: gene.combined_score,
            genetic_score: gene.variant_score,
            phenotype_score: gene.priority_score,
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Convert the JSON results at `path_json` into the table at `path_tab`.
pub fn json_to_tab(path_json: &Path, path_tab: &Path) -> Result<usize, anyhow::Error> {
    let genes = load_gene_results(path_json)?;
    let file = std::fs::File::create(path_tab)
        .map_err(|e| anyhow::anyhow!("could not create {:?}: {}", path_tab, e))?;
    write_tab(std::io::BufWriter::new(file), &genes)?;
    Ok(genes.len())
}
