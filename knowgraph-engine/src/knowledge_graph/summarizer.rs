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

//! Community Summarizer
//!
//! Produces a short synopsis per community, either from the model or
//! mechanically from member names and the dominant relationship type.
//! Summaries are cached per `(workspace, community)` until the workspace's
//! community set is replaced.

use crate::config::CommunityConfig;
use crate::error::{FallbackUsed, LlmError, Outcome};
use crate::knowledge_graph::entities::{Community, CommunityId, Entity, EntityId, Relationship};
use crate::knowledge_graph::graph::GraphStore;
use crate::llm::LLMProviderManager;
use futures::future::join_all;
use moka::sync::Cache;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

type SummaryKey = (String, CommunityId);

#[derive(Debug, Clone)]
struct CachedSummary {
    text: String,
    fallback: bool,
}

/// Counts from one [`CommunitySummarizer::summarize_all`] run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryReport {
    /// Communities that received a summary
    pub generated: usize,
    /// How many of those came from the mechanical fallback
    pub fallbacks: usize,
}

pub struct CommunitySummarizer {
    store: Arc<GraphStore>,
    llm: Arc<LLMProviderManager>,
    config: CommunityConfig,
    cache: Cache<SummaryKey, CachedSummary>,
}

impl CommunitySummarizer {
    pub fn new(store: Arc<GraphStore>, llm: Arc<LLMProviderManager>, config: CommunityConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.summary_cache_capacity)
            .support_invalidation_closures()
            .build();

        Self {
            store,
            llm,
            config,
            cache,
        }
    }

    /// Summarize one community, consulting the cache first
    pub async fn summarize(&self, community: &Community) -> Outcome<String> {
        let key = (community.workspace_id.clone(), community.id);
        if let Some(cached) = self.cache.get(&key) {
            return if cached.fallback {
                Err(FallbackUsed::new(cached.text, "cached fallback summary"))
            } else {
                Ok(cached.text)
            };
        }

        let (members, relationships) = self.members_and_links(community);

        let outcome = if !self.llm.is_enabled() {
            Err(FallbackUsed::new(
                self.fallback_summary(&members, &relationships),
                "no LLM provider configured",
            ))
        } else {
            match self.summarize_with_llm(&members, &relationships).await {
                Ok(text) => Ok(text),
                Err(e) => {
                    warn!(
                        workspace = %community.workspace_id,
                        community = community.id,
                        "LLM summary failed, using mechanical summary: {}", e
                    );
                    Err(FallbackUsed::new(
                        self.fallback_summary(&members, &relationships),
                        e.to_string(),
                    ))
                }
            }
        };

        let (text, fallback) = match &outcome {
            Ok(text) => (text.clone(), false),
            Err(f) => (f.value.clone(), true),
        };
        self.cache.insert(key, CachedSummary { text, fallback });

        outcome
    }

    /// Summary text to show for a community, whichever path produced it
    pub async fn summary_for(&self, community: &Community) -> String {
        if let Some(cached) = self.cached(&community.workspace_id, community.id) {
            return cached;
        }
        if !community.summary.is_empty() {
            return community.summary.clone();
        }
        match self.summarize(community).await {
            Ok(text) => text,
            Err(fallback) => fallback.value,
        }
    }

    pub fn cached(&self, workspace_id: &str, community_id: CommunityId) -> Option<String> {
        self.cache
            .get(&(workspace_id.to_string(), community_id))
            .map(|c| c.text)
    }

    /// Drop every cached summary of a workspace
    pub fn invalidate_workspace(&self, workspace_id: &str) {
        let workspace_id = workspace_id.to_string();
        if let Err(e) = self
            .cache
            .invalidate_entries_if(move |(ws, _), _| *ws == workspace_id)
        {
            warn!("Failed to register summary invalidation: {}", e);
        }
        self.cache.run_pending_tasks();
    }

    /// Cached summaries for the workspace's current communities
    pub fn cached_in_workspace(&self, workspace_id: &str) -> u64 {
        self.store
            .communities(workspace_id)
            .communities
            .iter()
            .filter(|c| self.cached(workspace_id, c.id).is_some())
            .count() as u64
    }

    /// Approximate number of cached summaries across all workspaces
    pub fn cached_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    /// Summarize the workspace's current community set with bounded concurrency
    ///
    /// The summaries are attached to the set only if no rebuild replaced it
    /// in the meantime.
    pub async fn summarize_all(&self, workspace_id: &str) -> SummaryReport {
        let set = self.store.communities(workspace_id);
        if set.is_empty() {
            return SummaryReport::default();
        }

        let semaphore = Semaphore::new(self.config.summary_concurrency.max(1));
        let tasks = set.communities.iter().map(|community| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok();
                (community.id, self.summarize(community).await)
            }
        });

        let mut summaries: HashMap<CommunityId, String> = HashMap::new();
        let mut report = SummaryReport::default();
        for (id, outcome) in join_all(tasks).await {
            report.generated += 1;
            let text = match outcome {
                Ok(text) => text,
                Err(fallback) => {
                    report.fallbacks += 1;
                    fallback.value
                }
            };
            summaries.insert(id, text);
        }

        if !self
            .store
            .attach_summaries(workspace_id, set.generation, &summaries)
        {
            debug!(
                workspace = workspace_id,
                generation = set.generation,
                "Community set replaced during summarization, summaries not attached"
            );
        }

        info!(
            workspace = workspace_id,
            generated = report.generated,
            fallbacks = report.fallbacks,
            "Summarized communities"
        );

        report
    }

    fn members_and_links(&self, community: &Community) -> (Vec<Entity>, Vec<Relationship>) {
        let members: Vec<Entity> = community
            .entity_ids
            .iter()
            .filter_map(|&id| self.store.get_entity_by_id(&community.workspace_id, id))
            .collect();
        let ids: HashSet<EntityId> = community.entity_ids.iter().copied().collect();
        let relationships = self.store.relationships_among(&community.workspace_id, &ids);
        (members, relationships)
    }

    async fn summarize_with_llm(
        &self,
        members: &[Entity],
        relationships: &[Relationship],
    ) -> Result<String, LlmError> {
        let prompt = build_summary_prompt(members, relationships);
        let text = self
            .llm
            .complete(
                "You summarize clusters of a workplace knowledge graph. Reply with 2-3 plain sentences.",
                prompt,
            )
            .await?;
        Ok(text.trim().to_string())
    }

    /// "<top-N names> (most common relationship: <type>)"
    ///
    /// Members are ranked by degree inside the community, then by name.
    pub fn fallback_summary(&self, members: &[Entity], relationships: &[Relationship]) -> String {
        let mut degree: HashMap<EntityId, usize> = HashMap::new();
        let mut rel_counts: HashMap<&str, usize> = HashMap::new();
        for rel in relationships {
            *degree.entry(rel.from_entity).or_default() += 1;
            *degree.entry(rel.to_entity).or_default() += 1;
            *rel_counts.entry(rel.rel_type.as_str()).or_default() += 1;
        }

        let mut ranked: Vec<&Entity> = members.iter().collect();
        ranked.sort_by(|a, b| {
            let da = degree.get(&a.id).copied().unwrap_or(0);
            let db = degree.get(&b.id).copied().unwrap_or(0);
            db.cmp(&da).then_with(|| a.name.cmp(&b.name))
        });

        let names: Vec<&str> = ranked
            .iter()
            .take(self.config.fallback_top_n.max(1))
            .map(|e| e.name.as_str())
            .collect();

        let most_common = rel_counts
            .into_iter()
            .max_by(|(ta, ca), (tb, cb)| ca.cmp(cb).then_with(|| tb.cmp(ta)))
            .map(|(t, _)| t)
            .unwrap_or("none");

        format!(
            "{} (most common relationship: {})",
            names.join(", "),
            most_common
        )
    }
}

fn build_summary_prompt(members: &[Entity], relationships: &[Relationship]) -> String {
    let names: HashMap<EntityId, &str> = members.iter().map(|e| (e.id, e.name.as_str())).collect();

    let mut prompt = String::from("Summarize what connects the following entities.\n\n## ENTITIES\n");
    for entity in members {
        if entity.description.is_empty() {
            prompt.push_str(&format!("- {} ({})\n", entity.name, entity.entity_type));
        } else {
            prompt.push_str(&format!(
                "- {} ({}): {}\n",
                entity.name, entity.entity_type, entity.description
            ));
        }
    }

    if !relationships.is_empty() {
        prompt.push_str("\n## RELATIONSHIPS\n");
        for rel in relationships {
            let from = names.get(&rel.from_entity).copied().unwrap_or("?");
            let to = names.get(&rel.to_entity).copied().unwrap_or("?");
            prompt.push_str(&format!("- {} {} {}\n", from, rel.rel_type, to));
        }
    }

    prompt.push_str("\nWrite a 2-3 sentence synopsis of this group: who is involved, what they work on, and how they relate.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LLMConfig;
    use crate::error::OutcomeExt;

    fn setup() -> (Arc<GraphStore>, CommunitySummarizer, Community) {
        let store = Arc::new(GraphStore::new());
        let sarah = store.add_entity(Entity::new("ws1", "Sarah", "person")).unwrap();
        let bob = store.add_entity(Entity::new("ws1", "Bob", "person")).unwrap();
        let q4 = store
            .add_entity(Entity::new("ws1", "Q4 Campaign", "project"))
            .unwrap();
        store
            .add_relationship(Relationship::new("ws1", sarah.id, q4.id, "leads"))
            .unwrap();
        store
            .add_relationship(Relationship::new("ws1", bob.id, sarah.id, "works_with"))
            .unwrap();
        store
            .add_relationship(Relationship::new("ws1", bob.id, q4.id, "works_with"))
            .unwrap();

        let llm = Arc::new(LLMProviderManager::disabled(&LLMConfig::default()));
        let summarizer =
            CommunitySummarizer::new(Arc::clone(&store), llm, CommunityConfig::default());

        let id = store.allocate_community_id();
        let community = Community::new(id, "ws1", vec![sarah.id, bob.id, q4.id]);
        store.replace_communities_with("ws1", |_| vec![community.clone()]);

        (store, summarizer, community)
    }

    #[tokio::test]
    async fn test_fallback_summary() {
        let (_store, summarizer, community) = setup();

        let outcome = summarizer.summarize(&community).await;
        assert!(outcome.used_fallback());
        assert_eq!(
            outcome.into_value(),
            "Bob, Q4 Campaign, Sarah (most common relationship: works_with)"
        );
    }

    #[tokio::test]
    async fn test_cache_and_invalidation() {
        let (_store, summarizer, community) = setup();

        assert!(summarizer.cached("ws1", community.id).is_none());
        summarizer.summarize(&community).await.into_value();
        assert!(summarizer.cached("ws1", community.id).is_some());

        // Cached fallbacks are still reported as fallbacks
        assert!(summarizer.summarize(&community).await.used_fallback());

        summarizer.invalidate_workspace("ws2");
        assert!(summarizer.cached("ws1", community.id).is_some());

        summarizer.invalidate_workspace("ws1");
        assert!(summarizer.cached("ws1", community.id).is_none());
    }

    #[tokio::test]
    async fn test_cached_count_per_workspace() {
        let (store, summarizer, community) = setup();
        let dana = store.add_entity(Entity::new("ws2", "Dana", "person")).unwrap();
        let eli = store.add_entity(Entity::new("ws2", "Eli", "person")).unwrap();
        let other = Community::new(store.allocate_community_id(), "ws2", vec![dana.id, eli.id]);
        store.replace_communities_with("ws2", |_| vec![other]);

        summarizer.summarize(&community).await.into_value();

        assert_eq!(summarizer.cached_in_workspace("ws1"), 1);
        assert_eq!(summarizer.cached_in_workspace("ws2"), 0);
        assert_eq!(summarizer.cached_in_workspace("missing"), 0);
        assert_eq!(summarizer.cached_count(), 1);
    }

    #[tokio::test]
    async fn test_summarize_all_attaches_summaries() {
        let (store, summarizer, community) = setup();

        let report = summarizer.summarize_all("ws1").await;
        assert_eq!(
            report,
            SummaryReport {
                generated: 1,
                fallbacks: 1
            }
        );

        let set = store.communities("ws1");
        let stored = set.get(community.id).unwrap();
        assert!(stored.summary.contains("Sarah"));

        assert_eq!(summarizer.summarize_all("empty").await, SummaryReport::default());
    }

    #[test]
    fn test_fallback_without_relationships() {
        let (_store, summarizer, _) = setup();
        let lone = vec![Entity::new("ws1", "Dana", "person")];
        assert_eq!(
            summarizer.fallback_summary(&lone, &[]),
            "Dana (most common relationship: none)"
        );
    }
}
