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

//! Entity, Relationship and Community Types
//!
//! Defines the vocabulary of the knowledge graph.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A unique identifier for entities in the knowledge graph
pub type EntityId = u64;

/// A unique identifier for relationships
pub type RelationshipId = u64;

/// A unique identifier for communities (never reused across detection runs)
pub type CommunityId = u64;

/// Type tag used when the extractor cannot name a more specific one
pub const GENERIC_ENTITY_TYPE: &str = "entity";

/// Relationship tag used when the model omits one
pub const GENERIC_RELATION_TYPE: &str = "related_to";

/// A knowledge graph entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    /// Unique identifier (assigned by the store)
    pub id: EntityId,
    /// Display name (first-seen spelling)
    pub name: String,
    /// Open type tag (e.g., "person", "project", "task")
    pub entity_type: String,
    /// Free-text description, may be empty
    pub description: String,
    /// Owning workspace
    pub workspace_id: String,
    /// Documents/messages this entity was extracted from
    pub source_refs: BTreeSet<String>,
}

impl Entity {
    /// Create an entity that has not been stored yet (`id` is assigned on insert)
    pub fn new(
        workspace_id: impl Into<String>,
        name: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into().trim().to_string(),
            entity_type: normalize_type(&entity_type.into()),
            description: String::new(),
            workspace_id: workspace_id.into(),
            source_refs: BTreeSet::new(),
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into().trim().to_string();
        self
    }

    /// Add an originating document
    pub fn with_source(mut self, doc_id: impl Into<String>) -> Self {
        self.source_refs.insert(doc_id.into());
        self
    }

    /// Dedup key within a workspace
    pub fn normalized_name(&self) -> String {
        normalize_entity_name(&self.name)
    }

    /// Fold a re-extraction of the same entity into this one
    pub(crate) fn merge_from(&mut self, other: &Entity) {
        self.source_refs.extend(other.source_refs.iter().cloned());

        let incoming = other.description.trim();
        if !incoming.is_empty() && !self.description.contains(incoming) {
            if self.description.is_empty() {
                self.description = incoming.to_string();
            } else {
                self.description = format!("{}; {}", self.description, incoming);
            }
        }

        if self.entity_type == GENERIC_ENTITY_TYPE && other.entity_type != GENERIC_ENTITY_TYPE {
            self.entity_type = other.entity_type.clone();
        }
    }
}

/// A directed, typed link between two entities of one workspace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    /// Unique identifier (assigned by the store)
    pub id: RelationshipId,
    /// Source entity
    pub from_entity: EntityId,
    /// Target entity
    pub to_entity: EntityId,
    /// Open relationship tag in snake case (e.g., "works_on", "leads")
    pub rel_type: String,
    /// Free-text description
    pub description: String,
    /// Owning workspace
    pub workspace_id: String,
    /// Document the relationship was extracted from
    pub source_ref: Option<String>,
}

impl Relationship {
    /// Create a relationship that has not been stored yet
    pub fn new(
        workspace_id: impl Into<String>,
        from_entity: EntityId,
        to_entity: EntityId,
        rel_type: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            from_entity,
            to_entity,
            rel_type: normalize_relation_type(&rel_type.into()),
            description: String::new(),
            workspace_id: workspace_id.into(),
            source_ref: None,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into().trim().to_string();
        self
    }

    /// Set the originating document
    pub fn with_source(mut self, doc_id: impl Into<String>) -> Self {
        self.source_ref = Some(doc_id.into());
        self
    }

    /// The endpoint opposite to `entity_id` (the entity itself for self-loops)
    pub fn other_end(&self, entity_id: EntityId) -> EntityId {
        if self.from_entity == entity_id {
            self.to_entity
        } else {
            self.from_entity
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.from_entity == self.to_entity
    }
}

/// A community/cluster of densely connected entities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    /// Community ID
    pub id: CommunityId,
    /// Owning workspace
    pub workspace_id: String,
    /// Member entities (never empty)
    pub entity_ids: Vec<EntityId>,
    /// Synopsis, empty until summarization runs
    pub summary: String,
    /// Hierarchy level (0 for the flat partition)
    pub level: u32,
    /// Contribution of this community to the partition's modularity
    pub modularity: f64,
}

impl Community {
    /// Create a new community
    pub fn new(id: CommunityId, workspace_id: impl Into<String>, entity_ids: Vec<EntityId>) -> Self {
        Self {
            id,
            workspace_id: workspace_id.into(),
            entity_ids,
            summary: String::new(),
            level: 0,
            modularity: 0.0,
        }
    }

    pub fn size(&self) -> usize {
        self.entity_ids.len()
    }
}

/// Statistics about one workspace (or the whole store)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphStats {
    /// Total number of entities
    pub entity_count: usize,
    /// Total number of relationships
    pub relationship_count: usize,
    /// Number of communities
    pub community_count: usize,
    /// Average relationships per entity
    pub avg_degree: f64,
    /// Graph density (actual edges / possible edges)
    pub density: f64,
    /// Distribution of entity types
    pub entity_type_distribution: HashMap<String, usize>,
    /// Distribution of relationship types
    pub relationship_type_distribution: HashMap<String, usize>,
}

impl GraphStats {
    /// Fold another workspace's stats into this one
    pub fn absorb(&mut self, other: &GraphStats) {
        self.entity_count += other.entity_count;
        self.relationship_count += other.relationship_count;
        self.community_count += other.community_count;
        for (k, v) in &other.entity_type_distribution {
            *self.entity_type_distribution.entry(k.clone()).or_default() += v;
        }
        for (k, v) in &other.relationship_type_distribution {
            *self
                .relationship_type_distribution
                .entry(k.clone())
                .or_default() += v;
        }
        self.recompute_ratios();
    }

    pub(crate) fn recompute_ratios(&mut self) {
        let n = self.entity_count;
        self.avg_degree = if n > 0 {
            self.relationship_count as f64 / n as f64
        } else {
            0.0
        };
        self.density = if n > 1 {
            self.relationship_count as f64 / (n * (n - 1)) as f64
        } else {
            0.0
        };
    }
}

/// Normalize entity name for deduplication and lookup
///
/// Trims surrounding punctuation, lower-cases and collapses whitespace, so
/// "Q4  Campaign", "q4 campaign" and "'Q4 Campaign'" share one key.
pub fn normalize_entity_name(name: &str) -> String {
    name.trim_matches(|c: char| !c.is_alphanumeric())
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lower-cased alphanumeric words of a text, in order
pub fn word_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Lower-case a type tag, defaulting to [`GENERIC_ENTITY_TYPE`]
pub fn normalize_type(entity_type: &str) -> String {
    let t = entity_type.trim().to_lowercase();
    if t.is_empty() {
        GENERIC_ENTITY_TYPE.to_string()
    } else {
        t
    }
}

/// Snake-case a relationship tag, defaulting to [`GENERIC_RELATION_TYPE`]
pub fn normalize_relation_type(rel_type: &str) -> String {
    let t = rel_type
        .trim()
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if t.is_empty() {
        GENERIC_RELATION_TYPE.to_string()
    } else {
        t
    }
}
