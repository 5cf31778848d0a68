//! `esquire rank`: run the retrieval ranker over a file of raw hits.

use esquire_config::AppConfig;
use esquire_core::retrieval::SearchHit;
use esquire_tools::{RetrievalRanker, VersionLinks};
use std::path::Path;

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|e| format!("Invalid JSON in {}: {e}", path.display()).into())
}

pub(crate) fn ranked_json(
    config: &AppConfig,
    file: &Path,
    links: Option<&Path>,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let hits: Vec<SearchHit> = read_json(file)?;
    let ranker = match links {
        Some(path) => {
            let links: VersionLinks = read_json(path)?;
            RetrievalRanker::with_version_links(links, config.retrieval.version_tolerance)
        }
        None => RetrievalRanker::new(),
    };
    Ok(serde_json::to_value(ranker.rank_hits(hits))?)
}

pub async fn run(
    config: &AppConfig,
    file: &Path,
    links: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let ranked = ranked_json(config, file, links)?;
    println!("{}", serde_json::to_string_pretty(&ranked)?);
    Ok(())
}
