// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Query Router
//!
//! Dispatches a natural language query to global or local search.
//! Classification is pure keyword heuristics:
//! - "Tell me about Sarah", "Who is Bob?" → local
//! - "What are the main themes?", "Give me an overview" → global
//! - anything else → local when it names a known entity, global otherwise

use crate::knowledge_graph::global_search::{GlobalSearch, PartialAnswer};
use crate::knowledge_graph::local_search::{LocalEntity, LocalSearch};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Phrases that ask about one specific entity
const LOCAL_CUES: &[&str] = &[
    "tell me about",
    "who is",
    "who s",
    "what is",
    "what s",
    "details on",
    "details about",
    "information about",
    "info on",
    "describe",
    "what does",
    "who does",
    "works with",
    "connected to",
    "related to",
];

/// Phrases that ask about the workspace as a whole
const GLOBAL_CUES: &[&str] = &[
    "theme",
    "themes",
    "summary",
    "summarize",
    "summarise",
    "overview",
    "main",
    "trend",
    "trends",
    "overall",
    "key topics",
    "topics",
    "big picture",
    "in general",
    "across",
];

/// Requested search mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    #[default]
    Auto,
    Global,
    Local,
}

#[derive(Debug, Error)]
#[error("unknown query mode '{0}', expected auto, global or local")]
pub struct ParseModeError(String);

impl FromStr for QueryMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(QueryMode::Auto),
            "global" => Ok(QueryMode::Global),
            "local" => Ok(QueryMode::Local),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryMode::Auto => write!(f, "auto"),
            QueryMode::Global => write!(f, "global"),
            QueryMode::Local => write!(f, "local"),
        }
    }
}

/// Answer to a query, tagged by the mode that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum QueryResponse {
    Global {
        answer: String,
        communities_found: usize,
        communities_used: usize,
        partial_answers: Vec<PartialAnswer>,
        fallback_used: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Local {
        answer: String,
        start_entity: Option<String>,
        entities_found: usize,
        relationships_found: usize,
        entities: Vec<LocalEntity>,
        fallback_used: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl QueryResponse {
    pub fn mode(&self) -> QueryMode {
        match self {
            QueryResponse::Global { .. } => QueryMode::Global,
            QueryResponse::Local { .. } => QueryMode::Local,
        }
    }

    pub fn answer(&self) -> &str {
        match self {
            QueryResponse::Global { answer, .. } | QueryResponse::Local { answer, .. } => answer,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            QueryResponse::Global { error, .. } | QueryResponse::Local { error, .. } => {
                error.as_deref()
            }
        }
    }

    pub fn fallback_used(&self) -> bool {
        match self {
            QueryResponse::Global { fallback_used, .. }
            | QueryResponse::Local { fallback_used, .. } => *fallback_used,
        }
    }
}

pub struct QueryRouter {
    global: GlobalSearch,
    local: LocalSearch,
}

impl QueryRouter {
    pub fn new(global: GlobalSearch, local: LocalSearch) -> Self {
        Self { global, local }
    }

    pub fn global(&self) -> &GlobalSearch {
        &self.global
    }

    pub fn local(&self) -> &LocalSearch {
        &self.local
    }

    /// Decide between global and local search for `Auto` queries
    pub fn classify(&self, workspace_id: &str, query: &str) -> QueryMode {
        let padded = format!(
            " {} ",
            crate::knowledge_graph::entities::word_tokens(query).join(" ")
        );
        let has = |cues: &[&str]| cues.iter().any(|cue| padded.contains(&format!(" {} ", cue)));

        let local_cue = has(LOCAL_CUES);
        let global_cue = has(GLOBAL_CUES);

        match (local_cue, global_cue) {
            (true, false) => QueryMode::Local,
            (false, true) => QueryMode::Global,
            _ => {
                if self.local.mentioned_entity(workspace_id, query).is_some() {
                    QueryMode::Local
                } else {
                    QueryMode::Global
                }
            }
        }
    }

    fn resolve_mode(&self, workspace_id: &str, query: &str, mode: QueryMode) -> QueryMode {
        let resolved = match mode {
            QueryMode::Auto => self.classify(workspace_id, query),
            explicit => explicit,
        };
        debug!(workspace = workspace_id, requested = %mode, resolved = %resolved, "Routed query");
        resolved
    }

    pub async fn query(&self, workspace_id: &str, query: &str, mode: QueryMode) -> QueryResponse {
        match self.resolve_mode(workspace_id, query, mode) {
            QueryMode::Local => self.local.local_search(workspace_id, query).await,
            _ => self.global.global_search(workspace_id, query).await,
        }
    }

    /// Like [`QueryRouter::query`], abandoning backend calls once `cancel` fires
    pub async fn query_with_cancel(
        &self,
        workspace_id: &str,
        query: &str,
        mode: QueryMode,
        cancel: CancellationToken,
    ) -> QueryResponse {
        match self.resolve_mode(workspace_id, query, mode) {
            QueryMode::Local => {
                self.local
                    .local_search_with_cancel(workspace_id, query, cancel)
                    .await
            }
            _ => {
                self.global
                    .global_search_with_cancel(workspace_id, query, cancel)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommunityConfig, LLMConfig, SearchConfig};
    use crate::knowledge_graph::entities::Entity;
    use crate::knowledge_graph::graph::GraphStore;
    use crate::knowledge_graph::summarizer::CommunitySummarizer;
    use crate::llm::LLMProviderManager;
    use std::sync::Arc;

    fn router(store: &Arc<GraphStore>) -> QueryRouter {
        let llm = Arc::new(LLMProviderManager::disabled(&LLMConfig::default()));
        let summarizer = Arc::new(CommunitySummarizer::new(
            Arc::clone(store),
            Arc::clone(&llm),
            CommunityConfig::default(),
        ));
        QueryRouter::new(
            GlobalSearch::new(
                Arc::clone(store),
                summarizer,
                Arc::clone(&llm),
                SearchConfig::default(),
            ),
            LocalSearch::new(Arc::clone(store), llm, SearchConfig::default()),
        )
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("Global".parse::<QueryMode>().unwrap(), QueryMode::Global);
        assert_eq!(" local ".parse::<QueryMode>().unwrap(), QueryMode::Local);
        assert_eq!("auto".parse::<QueryMode>().unwrap(), QueryMode::Auto);
        assert!("sideways".parse::<QueryMode>().is_err());
        assert_eq!(QueryMode::Global.to_string(), "global");
    }

    #[test]
    fn test_classify() {
        let store = Arc::new(GraphStore::new());
        store
            .add_entity(Entity::new("ws1", "Sarah", "person"))
            .unwrap();
        let router = router(&store);

        assert_eq!(
            router.classify("ws1", "What are the main themes?"),
            QueryMode::Global
        );
        assert_eq!(router.classify("ws1", "Tell me about Sarah"), QueryMode::Local);
        assert_eq!(router.classify("ws1", "Who's Bob?"), QueryMode::Local);
        assert_eq!(router.classify("ws1", "Give me an overview"), QueryMode::Global);

        // No cue: depends on whether a known entity is named
        assert_eq!(router.classify("ws1", "Sarah deadlines"), QueryMode::Local);
        assert_eq!(router.classify("ws1", "deadlines this week"), QueryMode::Global);
    }

    #[tokio::test]
    async fn test_explicit_mode_overrides_classification() {
        let store = Arc::new(GraphStore::new());
        let router = router(&store);

        let response = router
            .query("ws1", "What are the main themes?", QueryMode::Local)
            .await;
        assert_eq!(response.mode(), QueryMode::Local);
        assert!(response.error().is_some());
    }

    #[test]
    fn test_response_serialization() {
        let response = QueryResponse::Global {
            answer: "none".to_string(),
            communities_found: 0,
            communities_used: 0,
            partial_answers: vec![],
            fallback_used: false,
            error: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["mode"], "global");
        assert!(json.get("error").is_none());
    }
}
