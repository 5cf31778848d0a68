//! Tools exposed to the model, and the ranking they share.
//!
//! `search_law` is the only tool: it queries the law-text index and runs
//! every batch through [`RetrievalRanker`] before the model sees it.

pub mod ranking;
pub mod search_law;

use esquire_config::RetrievalConfig;
use esquire_core::retrieval::SemanticSearch;
use esquire_core::tool::ToolRegistry;
use std::sync::Arc;

pub use ranking::{RetrievalRanker, VersionLinks, rank_order};
pub use search_law::SearchLawTool;

/// Build the registry handed to the turn runner.
///
/// With `links`, older versions of linked instruments scoring within
/// `config.version_tolerance` of a newer version are suppressed.
pub fn default_registry(
    search: Arc<dyn SemanticSearch>,
    config: &RetrievalConfig,
    links: Option<VersionLinks>,
) -> ToolRegistry {
    let mut tool = SearchLawTool::new(search, config);
    if let Some(links) = links {
        tool = tool.with_version_links(links, config.version_tolerance);
    }

    let mut registry = ToolRegistry::new();
    registry.register(Box::new(tool));
    registry
}
