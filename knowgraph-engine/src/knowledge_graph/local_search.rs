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

//! Local Search
//!
//! Answers questions about one entity from its graph neighbourhood:
//! - "Tell me about Sarah"
//! - "Who works with Bob?"
//! - "Q4 Campaign"

use crate::config::SearchConfig;
use crate::error::{FallbackUsed, Outcome};
use crate::knowledge_graph::entities::{word_tokens, Entity, EntityId, Relationship};
use crate::knowledge_graph::global_search::QUERY_STOP_WORDS;
use crate::knowledge_graph::graph::GraphStore;
use crate::knowledge_graph::router::QueryResponse;
use crate::llm::LLMProviderManager;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An entity in a local-search context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalEntity {
    pub name: String,
    pub entity_type: String,
    pub description: String,
    /// Distance from the anchor entity
    pub hops: usize,
}

/// How the anchor entity was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// The whole query is an entity name or id
    Exact,
    /// An entity name appears inside the query
    Contained,
    /// Token overlap above the fuzzy threshold
    Fuzzy,
}

pub struct LocalSearch {
    store: Arc<GraphStore>,
    llm: Arc<LLMProviderManager>,
    config: SearchConfig,
}

impl LocalSearch {
    pub fn new(store: Arc<GraphStore>, llm: Arc<LLMProviderManager>, config: SearchConfig) -> Self {
        Self { store, llm, config }
    }

    /// Find the entity a query is about
    pub fn resolve_entity(&self, workspace_id: &str, query: &str) -> Option<(Entity, MatchKind)> {
        if let Some(entity) = self.store.get_entity(workspace_id, query) {
            return Some((entity, MatchKind::Exact));
        }

        let entities = self.store.all_entities(workspace_id);
        if let Some(entity) = longest_contained(&entities, query) {
            return Some((entity.clone(), MatchKind::Contained));
        }

        best_fuzzy(&entities, query, self.config.fuzzy_threshold)
            .map(|entity| (entity.clone(), MatchKind::Fuzzy))
    }

    /// Entity named verbatim in the query (exact or contained, never fuzzy)
    pub fn mentioned_entity(&self, workspace_id: &str, query: &str) -> Option<Entity> {
        if let Some(entity) = self.store.get_entity(workspace_id, query) {
            return Some(entity);
        }
        let entities = self.store.all_entities(workspace_id);
        longest_contained(&entities, query).cloned()
    }

    pub async fn local_search(&self, workspace_id: &str, query: &str) -> QueryResponse {
        let Some((anchor, kind)) = self.resolve_entity(workspace_id, query) else {
            return QueryResponse::Local {
                answer: format!("No matching entity found for '{}'.", query.trim()),
                start_entity: None,
                entities_found: 0,
                relationships_found: 0,
                entities: Vec::new(),
                fallback_used: false,
                error: Some(format!(
                    "no matching entity for '{}' in workspace '{}'",
                    query.trim(),
                    workspace_id
                )),
            };
        };

        debug!(workspace = workspace_id, anchor = %anchor.name, ?kind, "Resolved local search anchor");

        let mut neighborhood = self
            .store
            .neighborhood(workspace_id, anchor.id, self.config.local_depth);
        neighborhood.truncate(self.config.max_context_entities.max(1));

        let ids: HashSet<EntityId> = neighborhood.iter().map(|(e, _)| e.id).collect();
        let relationships = self.store.relationships_among(workspace_id, &ids);

        let (answer, fallback_used) = match self.answer(query, &neighborhood, &relationships).await {
            Ok(answer) => (answer, false),
            Err(fallback) => (fallback.value, true),
        };

        QueryResponse::Local {
            answer,
            start_entity: Some(anchor.name.clone()),
            entities_found: neighborhood.len(),
            relationships_found: relationships.len(),
            entities: neighborhood
                .into_iter()
                .map(|(e, hops)| LocalEntity {
                    name: e.name,
                    entity_type: e.entity_type,
                    description: e.description,
                    hops,
                })
                .collect(),
            fallback_used,
            error: None,
        }
    }

    /// Local search that gives up as soon as `cancel` fires
    pub async fn local_search_with_cancel(
        &self,
        workspace_id: &str,
        query: &str,
        cancel: CancellationToken,
    ) -> QueryResponse {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(workspace = workspace_id, "Local search cancelled");
                QueryResponse::Local {
                    answer: "Search cancelled before an answer was produced.".to_string(),
                    start_entity: None,
                    entities_found: 0,
                    relationships_found: 0,
                    entities: Vec::new(),
                    fallback_used: false,
                    error: Some("cancelled".to_string()),
                }
            }
            response = self.local_search(workspace_id, query) => response,
        }
    }

    async fn answer(
        &self,
        query: &str,
        neighborhood: &[(Entity, usize)],
        relationships: &[Relationship],
    ) -> Outcome<String> {
        let context = render_context(neighborhood, relationships);

        if !self.llm.is_enabled() {
            return Err(FallbackUsed::new(context, "no LLM provider configured"));
        }

        let prompt = format!(
            "## CONTEXT\n{context}\n\n## QUESTION\n{query}\n\nAnswer the question using only the context above. If the context does not contain the answer, say so."
        );

        match self
            .llm
            .complete(
                "You answer questions about people, projects and their relationships from a knowledge graph.",
                prompt,
            )
            .await
        {
            Ok(answer) => Ok(answer.trim().to_string()),
            Err(e) => {
                warn!("Local answer call failed, returning graph facts: {}", e);
                Err(FallbackUsed::new(context, e.to_string()))
            }
        }
    }
}

/// Entity whose full name appears on word boundaries in the query; longest wins
fn longest_contained<'a>(entities: &'a [Entity], query: &str) -> Option<&'a Entity> {
    let padded_query = format!(" {} ", word_tokens(query).join(" "));

    entities
        .iter()
        .filter_map(|entity| {
            let tokens = word_tokens(&entity.name);
            if tokens.is_empty() {
                return None;
            }
            let padded_name = format!(" {} ", tokens.join(" "));
            padded_query
                .contains(&padded_name)
                .then_some((entity, tokens.len(), padded_name.len()))
        })
        // Ties go to the lowest id
        .max_by(|(a, at, ac), (b, bt, bc)| at.cmp(bt).then(ac.cmp(bc)).then(b.id.cmp(&a.id)))
        .map(|(entity, _, _)| entity)
}

/// Best Jaccard overlap between query terms and entity-name terms
fn best_fuzzy<'a>(entities: &'a [Entity], query: &str, threshold: f64) -> Option<&'a Entity> {
    let query_terms = fuzzy_terms(query);
    if query_terms.is_empty() {
        return None;
    }

    let mut best: Option<(&Entity, f64)> = None;
    for entity in entities {
        let name_terms = fuzzy_terms(&entity.name);
        if name_terms.is_empty() {
            continue;
        }
        let shared = query_terms.intersection(&name_terms).count() as f64;
        let union = query_terms.union(&name_terms).count() as f64;
        let score = shared / union;

        if score >= threshold && best.map_or(true, |(_, s)| score > s) {
            best = Some((entity, score));
        }
    }
    best.map(|(entity, _)| entity)
}

/// Stop-word-free tokens with a trailing plural "s" stripped
fn fuzzy_terms(text: &str) -> HashSet<String> {
    word_tokens(text)
        .into_iter()
        .filter(|t| !QUERY_STOP_WORDS.contains(&t.as_str()))
        .map(|t| {
            if t.len() > 3 && t.ends_with('s') && !t.ends_with("ss") {
                t[..t.len() - 1].to_string()
            } else {
                t
            }
        })
        .collect()
}

/// Plain-text facts about a neighbourhood, used as prompt context and as the fallback answer
fn render_context(neighborhood: &[(Entity, usize)], relationships: &[Relationship]) -> String {
    let names: HashMap<EntityId, &str> = neighborhood
        .iter()
        .map(|(e, _)| (e.id, e.name.as_str()))
        .collect();

    let mut lines = Vec::new();
    if let Some((anchor, _)) = neighborhood.first() {
        if anchor.description.is_empty() {
            lines.push(format!("{} ({})", anchor.name, anchor.entity_type));
        } else {
            lines.push(format!(
                "{} ({}): {}",
                anchor.name, anchor.entity_type, anchor.description
            ));
        }
    }

    let connected: Vec<String> = neighborhood
        .iter()
        .skip(1)
        .map(|(e, _)| format!("{} ({})", e.name, e.entity_type))
        .collect();
    if !connected.is_empty() {
        lines.push(format!("Connected: {}", connected.join(", ")));
    }

    if !relationships.is_empty() {
        lines.push("Facts:".to_string());
        for rel in relationships {
            let from = names.get(&rel.from_entity).copied().unwrap_or("?");
            let to = names.get(&rel.to_entity).copied().unwrap_or("?");
            let mut fact = format!("- {} {} {}", from, rel.rel_type.replace('_', " "), to);
            if !rel.description.is_empty() {
                fact.push_str(&format!(" ({})", rel.description));
            }
            lines.push(fact);
        }
    }

    lines.join("\n")
}
