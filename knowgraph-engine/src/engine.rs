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

//! Knowledge Engine
//!
//! Facade wiring extraction, the graph store, community detection,
//! summarization and query routing into four operations:
//!
//! ```text
//! ingest(ws, doc, text)      → Extraction → GraphStore (merge)
//! rebuild_communities(ws)    → Leiden → atomic swap → summaries
//! query(ws, text, mode)      → QueryRouter → global | local search
//! stats(ws?)                 → GraphStats + engine counters
//! ```

use crate::config::EngineConfig;
use crate::error::{GraphResult, OutcomeExt};
use crate::knowledge_graph::{
    normalize_entity_name, CommunityDetector, CommunitySummarizer, Entity, EntityExtractor,
    EntityId, GlobalSearch, GraphStats, GraphStore, LeidenConfig, LocalSearch, QueryMode,
    QueryResponse, QueryRouter, Relationship, WorkspaceSnapshot,
};
use crate::llm::LLMProviderManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of ingesting one document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub doc_id: String,
    /// Entities stored (new or merged into existing ones)
    pub entities_extracted: usize,
    /// Relationships stored
    pub relationships_extracted: usize,
    /// Extracted items the store rejected
    pub skipped: usize,
    /// Whether the pattern extractor produced the result
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

/// Outcome of one community rebuild
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RebuildReport {
    pub communities_built: usize,
    pub summaries_generated: usize,
    pub summary_fallbacks: usize,
}

/// Graph statistics plus engine-level counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    #[serde(flatten)]
    pub graph: GraphStats,
    pub workspace_count: usize,
    pub llm_enabled: bool,
    pub summaries_cached: u64,
}

pub struct KnowledgeEngine {
    config: EngineConfig,
    store: Arc<GraphStore>,
    llm: Arc<LLMProviderManager>,
    extractor: EntityExtractor,
    summarizer: Arc<CommunitySummarizer>,
    detector: CommunityDetector,
    router: QueryRouter,
}

impl KnowledgeEngine {
    /// Build an engine with the providers configured in `config`
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let llm = Arc::new(LLMProviderManager::new(&config.llm)?);
        Ok(Self::with_llm(config, llm))
    }

    /// Build an engine around an existing provider manager
    pub fn with_llm(config: EngineConfig, llm: Arc<LLMProviderManager>) -> Self {
        let store = Arc::new(GraphStore::new());

        let extractor = EntityExtractor::new(config.extraction.clone(), Arc::clone(&llm));
        let summarizer = Arc::new(CommunitySummarizer::new(
            Arc::clone(&store),
            Arc::clone(&llm),
            config.community.clone(),
        ));
        let detector = CommunityDetector::new(
            Arc::clone(&store),
            Arc::clone(&summarizer),
            LeidenConfig::from(&config.community),
        );
        let router = QueryRouter::new(
            GlobalSearch::new(
                Arc::clone(&store),
                Arc::clone(&summarizer),
                Arc::clone(&llm),
                config.search.clone(),
            ),
            LocalSearch::new(Arc::clone(&store), Arc::clone(&llm), config.search.clone()),
        );

        Self {
            config,
            store,
            llm,
            extractor,
            summarizer,
            detector,
            router,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn router(&self) -> &QueryRouter {
        &self.router
    }

    /// Extract entities and relationships from `text` and merge them into the workspace
    ///
    /// Never fails: backend problems switch to the pattern extractor and
    /// items the store rejects are counted in `skipped`.
    pub async fn ingest(
        &self,
        workspace_id: &str,
        doc_id: &str,
        text: &str,
        source: &str,
    ) -> IngestReport {
        let start = Instant::now();
        let outcome = self
            .extractor
            .extract(text, doc_id, source, workspace_id)
            .await;

        let mut report = IngestReport {
            doc_id: doc_id.to_string(),
            fallback_used: outcome.used_fallback(),
            fallback_reason: outcome.as_ref().err().map(|f| f.reason.clone()),
            ..Default::default()
        };
        let extraction = outcome.into_value();

        let mut ids: HashMap<String, EntityId> = HashMap::new();
        for extracted in extraction.entities {
            let entity = Entity::new(workspace_id, extracted.name, extracted.entity_type)
                .with_description(extracted.description)
                .with_source(doc_id);
            match self.store.add_entity(entity) {
                Ok(stored) => {
                    ids.insert(stored.normalized_name(), stored.id);
                    report.entities_extracted += 1;
                }
                Err(e) => {
                    warn!(workspace = workspace_id, doc_id, "Skipping entity: {}", e);
                    report.skipped += 1;
                }
            }
        }

        for extracted in extraction.relationships {
            let resolve = |name: &str| {
                ids.get(&normalize_entity_name(name))
                    .copied()
                    .or_else(|| self.store.get_entity(workspace_id, name).map(|e| e.id))
            };
            let (Some(from), Some(to)) = (resolve(&extracted.from), resolve(&extracted.to)) else {
                warn!(
                    workspace = workspace_id,
                    doc_id,
                    from = %extracted.from,
                    to = %extracted.to,
                    "Skipping relationship with unresolved endpoint"
                );
                report.skipped += 1;
                continue;
            };

            let relationship = Relationship::new(workspace_id, from, to, extracted.rel_type)
                .with_description(extracted.description)
                .with_source(doc_id);
            match self.store.add_relationship(relationship) {
                Ok(_) => report.relationships_extracted += 1,
                Err(e) => {
                    warn!(workspace = workspace_id, doc_id, "Skipping relationship: {}", e);
                    report.skipped += 1;
                }
            }
        }

        info!(
            workspace = workspace_id,
            doc_id,
            entities = report.entities_extracted,
            relationships = report.relationships_extracted,
            fallback_used = report.fallback_used,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Ingested document"
        );

        report
    }

    /// Re-partition the workspace into communities and summarize them
    ///
    /// `min_community_size` defaults to the configured value.
    pub async fn rebuild_communities(
        &self,
        workspace_id: &str,
        min_community_size: Option<usize>,
    ) -> RebuildReport {
        let min_size = min_community_size.unwrap_or(self.config.community.min_community_size);
        let communities_built = self.detector.build_communities(workspace_id, min_size);
        let summaries = self.summarizer.summarize_all(workspace_id).await;

        RebuildReport {
            communities_built,
            summaries_generated: summaries.generated,
            summary_fallbacks: summaries.fallbacks,
        }
    }

    /// Answer a natural language query; failures are reported inside the response
    pub async fn query(&self, workspace_id: &str, text: &str, mode: QueryMode) -> QueryResponse {
        self.router.query(workspace_id, text, mode).await
    }

    pub async fn query_with_cancel(
        &self,
        workspace_id: &str,
        text: &str,
        mode: QueryMode,
        cancel: CancellationToken,
    ) -> QueryResponse {
        self.router
            .query_with_cancel(workspace_id, text, mode, cancel)
            .await
    }

    /// Statistics for one workspace, or summed over all of them
    pub fn stats(&self, workspace_id: Option<&str>) -> EngineStats {
        let (graph, workspace_count, summaries_cached) = match workspace_id {
            Some(ws) => {
                let exists = self.store.workspace_ids().iter().any(|id| id == ws);
                (
                    self.store.stats(ws),
                    usize::from(exists),
                    self.summarizer.cached_in_workspace(ws),
                )
            }
            None => (
                self.store.global_stats(),
                self.store.workspace_ids().len(),
                self.summarizer.cached_count(),
            ),
        };

        EngineStats {
            graph,
            workspace_count,
            llm_enabled: self.llm.is_enabled(),
            summaries_cached,
        }
    }

    /// Remove a workspace and its cached summaries
    pub fn drop_workspace(&self, workspace_id: &str) -> bool {
        self.summarizer.invalidate_workspace(workspace_id);
        let dropped = self.store.drop_workspace(workspace_id);
        if dropped {
            info!(workspace = workspace_id, "Dropped workspace");
        }
        dropped
    }

    pub fn snapshot(&self, workspace_id: &str) -> GraphResult<WorkspaceSnapshot> {
        self.store.snapshot(workspace_id)
    }

    /// Load a snapshot into its workspace; communities must be rebuilt afterwards
    pub fn restore(&self, snapshot: &WorkspaceSnapshot) -> GraphResult<(usize, usize)> {
        let (entities, relationships) = self.store.restore(snapshot)?;
        info!(
            workspace = %snapshot.workspace_id,
            entities, relationships, "Restored workspace snapshot"
        );
        Ok((entities, relationships))
    }
}
