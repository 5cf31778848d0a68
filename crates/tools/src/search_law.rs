//! Law search tool: the model's way into the regulation index.
//!
//! Each call is one short sub-query. Hits are restricted to fragments in
//! force today, ranked newest-first and deduplicated per regulation before
//! being handed back to the model as JSON.

use async_trait::async_trait;
use chrono::Utc;
use esquire_config::RetrievalConfig;
use esquire_core::error::ToolError;
use esquire_core::retrieval::{SearchRequest, SemanticSearch};
use esquire_core::tool::{Tool, ToolResult};
use std::sync::Arc;
use tracing::debug;

use crate::ranking::{RetrievalRanker, VersionLinks};

pub struct SearchLawTool {
    search: Arc<dyn SemanticSearch>,
    ranker: RetrievalRanker,
    top_k: usize,
}

impl SearchLawTool {
    pub fn new(search: Arc<dyn SemanticSearch>, config: &RetrievalConfig) -> Self {
        Self {
            search,
            ranker: RetrievalRanker::new(),
            top_k: config.top_k,
        }
    }

    /// Also suppress older versions of linked instruments.
    pub fn with_version_links(mut self, links: VersionLinks, tolerance: f64) -> Self {
        self.ranker = RetrievalRanker::with_version_links(links, tolerance);
        self
    }
}

#[async_trait]
impl Tool for SearchLawTool {
    fn name(&self) -> &str {
        "search_law"
    }

    fn description(&self) -> &str {
        "Search the law-text index for regulation fragments in force today. \
         Use one short query per legal concept; call repeatedly for different concepts. \
         Results are ordered newest version first, one fragment per regulation."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "A short sub-query naming one legal concept"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let query = arguments["query"]
            .as_str()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'query' argument".into()))?;

        let request = SearchRequest {
            query: query.to_string(),
            limit: self.top_k,
            valid_on: Utc::now().date_naive(),
        };

        let hits = self
            .search
            .search(request)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name().to_string(),
                reason: e.to_string(),
            })?;

        let returned = hits.len();
        let ranked = self.ranker.rank_hits(hits);
        debug!(query, hits = returned, kept = ranked.len(), "search_law");

        let data = serde_json::to_value(&ranked).map_err(|e| ToolError::ExecutionFailed {
            tool_name: self.name().to_string(),
            reason: e.to_string(),
        })?;
        let output = serde_json::to_string_pretty(&data).unwrap_or_default();

        Ok(ToolResult {
            call_id: String::new(),
            success: true,
            output,
            data: Some(data),
        })
    }
}
