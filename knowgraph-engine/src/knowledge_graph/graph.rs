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

//! Graph Store
//!
//! Per-workspace in-memory index of entities and relationships:
//! - Entities keyed by id, with a normalized-name index for dedup
//! - Relationships in an arena keyed by id, adjacency lists per entity
//!   (both directions), so cycles never create ownership problems
//! - The current community set behind an `Arc`, swapped atomically
//!
//! Each workspace carries its own writer guard: `add_entity`,
//! `add_relationship` and community replacement are serialized per
//! workspace, while reads (and other workspaces) never wait on it.

use crate::error::{GraphError, GraphResult};
use crate::knowledge_graph::entities::{
    normalize_entity_name, Community, CommunityId, Entity, EntityId, GraphStats, Relationship,
    RelationshipId,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{create_dir_all, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// The community partition of one workspace, as produced by one detection run
#[derive(Debug, Clone, Default)]
pub struct CommunitySet {
    /// Incremented on every replacement
    pub generation: u64,
    /// Communities, largest first
    pub communities: Vec<Community>,
}

impl CommunitySet {
    pub fn is_empty(&self) -> bool {
        self.communities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.communities.len()
    }

    pub fn get(&self, id: CommunityId) -> Option<&Community> {
        self.communities.iter().find(|c| c.id == id)
    }
}

/// Owned copy of a workspace's graph, handed to the community detector
#[derive(Debug, Clone, Default)]
pub struct WorkspaceView {
    pub workspace_id: String,
    pub entity_ids: Vec<EntityId>,
    pub relationships: Vec<Relationship>,
}

#[derive(Default)]
struct WorkspaceState {
    entities: HashMap<EntityId, Entity>,
    relationships: HashMap<RelationshipId, Relationship>,
    name_index: HashMap<String, EntityId>,
    adjacency: HashMap<EntityId, Vec<RelationshipId>>,
}

impl WorkspaceState {
    fn resolve(&self, name_or_id: &str) -> Option<EntityId> {
        let by_name = self.name_index.get(&normalize_entity_name(name_or_id));
        match by_name {
            Some(id) => Some(*id),
            None => name_or_id
                .trim()
                .parse::<EntityId>()
                .ok()
                .filter(|id| self.entities.contains_key(id)),
        }
    }

    fn incident(&self, entity_id: EntityId) -> impl Iterator<Item = &Relationship> {
        self.adjacency
            .get(&entity_id)
            .into_iter()
            .flatten()
            .filter_map(|rid| self.relationships.get(rid))
    }

    fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            entity_count: self.entities.len(),
            relationship_count: self.relationships.len(),
            ..Default::default()
        };
        for entity in self.entities.values() {
            *stats
                .entity_type_distribution
                .entry(entity.entity_type.clone())
                .or_default() += 1;
        }
        for rel in self.relationships.values() {
            *stats
                .relationship_type_distribution
                .entry(rel.rel_type.clone())
                .or_default() += 1;
        }
        stats.recompute_ratios();
        stats
    }
}

struct Workspace {
    /// Single-writer guard for mutations of this workspace
    writer: Mutex<()>,
    state: RwLock<WorkspaceState>,
    communities: RwLock<Arc<CommunitySet>>,
}

impl Workspace {
    fn new() -> Self {
        Self {
            writer: Mutex::new(()),
            state: RwLock::new(WorkspaceState::default()),
            communities: RwLock::new(Arc::new(CommunitySet::default())),
        }
    }
}

/// Workspace-partitioned entity/relationship store
pub struct GraphStore {
    workspaces: DashMap<String, Arc<Workspace>>,
    next_entity_id: AtomicU64,
    next_relationship_id: AtomicU64,
    next_community_id: AtomicU64,
}

impl GraphStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            workspaces: DashMap::new(),
            next_entity_id: AtomicU64::new(1),
            next_relationship_id: AtomicU64::new(1),
            next_community_id: AtomicU64::new(1),
        }
    }

    fn workspace(&self, workspace_id: &str) -> Option<Arc<Workspace>> {
        // Clone the Arc so the shard lock is released immediately
        self.workspaces.get(workspace_id).map(|w| Arc::clone(&w))
    }

    fn workspace_or_create(&self, workspace_id: &str) -> Arc<Workspace> {
        if let Some(ws) = self.workspace(workspace_id) {
            return ws;
        }
        Arc::clone(
            &self
                .workspaces
                .entry(workspace_id.to_string())
                .or_insert_with(|| Arc::new(Workspace::new())),
        )
    }

    /// Insert an entity, merging it into an existing one with the same normalized name
    ///
    /// Returns the canonical (possibly pre-existing) entity.
    pub fn add_entity(&self, entity: Entity) -> GraphResult<Entity> {
        let key = entity.normalized_name();
        if key.is_empty() {
            return Err(GraphError::InvalidEntity(format!(
                "entity name '{}' is empty after normalization",
                entity.name
            )));
        }

        let ws = self.workspace_or_create(&entity.workspace_id);
        let _writer = ws.writer.lock();
        let mut state = ws.state.write();

        let existing_id = state.name_index.get(&key).copied();
        if let Some(id) = existing_id {
            let existing = state
                .entities
                .get_mut(&id)
                .ok_or_else(|| GraphError::InvalidEntity(format!("dangling name index for {key}")))?;
            existing.merge_from(&entity);
            return Ok(existing.clone());
        }

        let id = self.next_entity_id.fetch_add(1, Ordering::SeqCst);
        let mut entity = entity;
        entity.id = id;

        state.name_index.insert(key, id);
        state.entities.insert(id, entity.clone());
        debug!(workspace = %entity.workspace_id, id, name = %entity.name, "Added entity");

        Ok(entity)
    }

    /// Insert a relationship; both endpoints must already exist in its workspace
    pub fn add_relationship(&self, relationship: Relationship) -> GraphResult<Relationship> {
        let unknown = |entity: EntityId| GraphError::UnknownEntity {
            workspace_id: relationship.workspace_id.clone(),
            entity: entity.to_string(),
        };

        let ws = self
            .workspace(&relationship.workspace_id)
            .ok_or_else(|| unknown(relationship.from_entity))?;
        let _writer = ws.writer.lock();
        let mut state = ws.state.write();

        for endpoint in [relationship.from_entity, relationship.to_entity] {
            if !state.entities.contains_key(&endpoint) {
                return Err(unknown(endpoint));
            }
        }

        let id = self.next_relationship_id.fetch_add(1, Ordering::SeqCst);
        let mut relationship = relationship;
        relationship.id = id;

        state
            .adjacency
            .entry(relationship.from_entity)
            .or_default()
            .push(id);
        if !relationship.is_self_loop() {
            state
                .adjacency
                .entry(relationship.to_entity)
                .or_default()
                .push(id);
        }
        state.relationships.insert(id, relationship.clone());

        Ok(relationship)
    }

    /// Look up an entity by name (normalized) or by numeric id
    pub fn get_entity(&self, workspace_id: &str, name_or_id: &str) -> Option<Entity> {
        let ws = self.workspace(workspace_id)?;
        let state = ws.state.read();
        let id = state.resolve(name_or_id)?;
        state.entities.get(&id).cloned()
    }

    pub fn get_entity_by_id(&self, workspace_id: &str, entity_id: EntityId) -> Option<Entity> {
        let ws = self.workspace(workspace_id)?;
        let state = ws.state.read();
        state.entities.get(&entity_id).cloned()
    }

    /// Entities directly connected to `entity_id` in either direction
    pub fn neighbors(&self, workspace_id: &str, entity_id: EntityId) -> Vec<Entity> {
        let Some(ws) = self.workspace(workspace_id) else {
            return Vec::new();
        };
        let state = ws.state.read();

        let mut seen = HashSet::new();
        state
            .incident(entity_id)
            .map(|rel| rel.other_end(entity_id))
            .filter(|&other| other != entity_id && seen.insert(other))
            .filter_map(|other| state.entities.get(&other).cloned())
            .collect()
    }

    /// Relationships touching an entity, in insertion order
    pub fn relationships_of(&self, workspace_id: &str, entity_id: EntityId) -> Vec<Relationship> {
        let Some(ws) = self.workspace(workspace_id) else {
            return Vec::new();
        };
        let state = ws.state.read();
        state.incident(entity_id).cloned().collect()
    }

    /// Relationships whose endpoints both lie in `members`
    pub fn relationships_among(
        &self,
        workspace_id: &str,
        members: &HashSet<EntityId>,
    ) -> Vec<Relationship> {
        let Some(ws) = self.workspace(workspace_id) else {
            return Vec::new();
        };
        let state = ws.state.read();

        let mut rels: Vec<Relationship> = members
            .iter()
            .flat_map(|&id| state.incident(id))
            .filter(|r| members.contains(&r.from_entity) && members.contains(&r.to_entity))
            .cloned()
            .collect();
        rels.sort_by_key(|r| r.id);
        rels.dedup_by_key(|r| r.id);
        rels
    }

    /// Breadth-first expansion around an entity
    ///
    /// Returns `(entity, hops)` pairs, starting with the anchor at hop 0.
    pub fn neighborhood(
        &self,
        workspace_id: &str,
        entity_id: EntityId,
        depth: usize,
    ) -> Vec<(Entity, usize)> {
        let Some(ws) = self.workspace(workspace_id) else {
            return Vec::new();
        };
        let state = ws.state.read();
        if !state.entities.contains_key(&entity_id) {
            return Vec::new();
        }

        let mut visited: HashSet<EntityId> = HashSet::from([entity_id]);
        let mut order = vec![(entity_id, 0usize)];
        let mut queue = VecDeque::from([(entity_id, 0usize)]);

        while let Some((current, hops)) = queue.pop_front() {
            if hops >= depth {
                continue;
            }
            for rel in state.incident(current) {
                let next = rel.other_end(current);
                if visited.insert(next) {
                    order.push((next, hops + 1));
                    queue.push_back((next, hops + 1));
                }
            }
        }

        order
            .into_iter()
            .filter_map(|(id, hops)| state.entities.get(&id).map(|e| (e.clone(), hops)))
            .collect()
    }

    /// All entities of a workspace, ordered by id
    pub fn all_entities(&self, workspace_id: &str) -> Vec<Entity> {
        let Some(ws) = self.workspace(workspace_id) else {
            return Vec::new();
        };
        let state = ws.state.read();
        let mut entities: Vec<Entity> = state.entities.values().cloned().collect();
        entities.sort_by_key(|e| e.id);
        entities
    }

    /// All relationships of a workspace, ordered by id
    pub fn all_relationships(&self, workspace_id: &str) -> Vec<Relationship> {
        let Some(ws) = self.workspace(workspace_id) else {
            return Vec::new();
        };
        let state = ws.state.read();
        let mut rels: Vec<Relationship> = state.relationships.values().cloned().collect();
        rels.sort_by_key(|r| r.id);
        rels
    }

    /// Reserve a community id that no other detection run will reuse
    pub fn allocate_community_id(&self) -> CommunityId {
        self.next_community_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Run `detect` on a snapshot of the workspace and install its output
    ///
    /// Holds the workspace writer guard for the whole run, so no entity or
    /// relationship lands between the snapshot and the swap. Readers keep
    /// seeing the previous set until the swap.
    pub fn replace_communities_with<F>(&self, workspace_id: &str, detect: F) -> Arc<CommunitySet>
    where
        F: FnOnce(&WorkspaceView) -> Vec<Community>,
    {
        let Some(ws) = self.workspace(workspace_id) else {
            return Arc::new(CommunitySet::default());
        };
        let _writer = ws.writer.lock();

        let view = {
            let state = ws.state.read();
            let mut entity_ids: Vec<EntityId> = state.entities.keys().copied().collect();
            entity_ids.sort_unstable();
            let mut relationships: Vec<Relationship> =
                state.relationships.values().cloned().collect();
            relationships.sort_by_key(|r| r.id);
            WorkspaceView {
                workspace_id: workspace_id.to_string(),
                entity_ids,
                relationships,
            }
        };

        let communities = detect(&view);

        let mut slot = ws.communities.write();
        let next = Arc::new(CommunitySet {
            generation: slot.generation + 1,
            communities,
        });
        *slot = Arc::clone(&next);
        next
    }

    /// Current community set (empty when never built)
    pub fn communities(&self, workspace_id: &str) -> Arc<CommunitySet> {
        match self.workspace(workspace_id) {
            Some(ws) => Arc::clone(&ws.communities.read()),
            None => Arc::new(CommunitySet::default()),
        }
    }

    /// Copy summaries into the current set if it is still `generation`
    ///
    /// Returns false when a newer detection run replaced the set meanwhile.
    pub fn attach_summaries(
        &self,
        workspace_id: &str,
        generation: u64,
        summaries: &HashMap<CommunityId, String>,
    ) -> bool {
        let Some(ws) = self.workspace(workspace_id) else {
            return false;
        };
        let mut slot = ws.communities.write();
        if slot.generation != generation {
            return false;
        }

        let mut updated = CommunitySet::clone(&slot);
        for community in &mut updated.communities {
            if let Some(summary) = summaries.get(&community.id) {
                community.summary = summary.clone();
            }
        }
        *slot = Arc::new(updated);
        true
    }

    /// Statistics for one workspace
    pub fn stats(&self, workspace_id: &str) -> GraphStats {
        let Some(ws) = self.workspace(workspace_id) else {
            return GraphStats::default();
        };
        let mut stats = ws.state.read().stats();
        stats.community_count = ws.communities.read().len();
        stats
    }

    /// Statistics summed over every workspace
    pub fn global_stats(&self) -> GraphStats {
        let mut total = GraphStats::default();
        for id in self.workspace_ids() {
            total.absorb(&self.stats(&id));
        }
        total
    }

    /// Ids of all workspaces, sorted
    pub fn workspace_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workspaces.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Remove a workspace with all its entities, relationships and communities
    pub fn drop_workspace(&self, workspace_id: &str) -> bool {
        self.workspaces.remove(workspace_id).is_some()
    }

    /// Export a workspace's entities and relationships
    pub fn snapshot(&self, workspace_id: &str) -> GraphResult<WorkspaceSnapshot> {
        if self.workspace(workspace_id).is_none() {
            return Err(GraphError::WorkspaceNotFound(workspace_id.to_string()));
        }
        Ok(WorkspaceSnapshot {
            workspace_id: workspace_id.to_string(),
            entities: self.all_entities(workspace_id),
            relationships: self.all_relationships(workspace_id),
        })
    }

    /// Replay a snapshot through the normal add paths
    ///
    /// Ids are reassigned; relationships are remapped onto the new entity ids.
    /// Returns the number of entities and relationships added.
    pub fn restore(&self, snapshot: &WorkspaceSnapshot) -> GraphResult<(usize, usize)> {
        let mut id_map: HashMap<EntityId, EntityId> = HashMap::new();
        for entity in &snapshot.entities {
            let mut copy = entity.clone();
            copy.workspace_id = snapshot.workspace_id.clone();
            let stored = self.add_entity(copy)?;
            id_map.insert(entity.id, stored.id);
        }

        let mut added = 0;
        for rel in &snapshot.relationships {
            let remap = |old: EntityId| {
                id_map
                    .get(&old)
                    .copied()
                    .ok_or_else(|| GraphError::UnknownEntity {
                        workspace_id: snapshot.workspace_id.clone(),
                        entity: old.to_string(),
                    })
            };
            let mut copy = rel.clone();
            copy.workspace_id = snapshot.workspace_id.clone();
            copy.from_entity = remap(rel.from_entity)?;
            copy.to_entity = remap(rel.to_entity)?;
            self.add_relationship(copy)?;
            added += 1;
        }

        Ok((id_map.len(), added))
    }
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable copy of one workspace's graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub workspace_id: String,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

impl WorkspaceSnapshot {
    /// Write as JSON via a temp file + rename
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);

        serde_json::to_writer(&mut writer, self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        writer.flush()?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        serde_json::from_reader(reader)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(ws: &str, name: &str) -> Entity {
        Entity::new(ws, name, "person")
    }

    #[test]
    fn test_add_entity_dedup() {
        let store = GraphStore::new();

        let first = store
            .add_entity(person("ws1", "Sarah").with_source("doc1"))
            .unwrap();
        let second = store
            .add_entity(person("ws1", "  sarah ").with_source("doc2"))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.all_entities("ws1").len(), 1);
        let sarah = store.get_entity("ws1", "SARAH").unwrap();
        assert_eq!(sarah.name, "Sarah");
        assert!(sarah.source_refs.contains("doc1"));
        assert!(sarah.source_refs.contains("doc2"));
    }

    #[test]
    fn test_empty_name_rejected() {
        let store = GraphStore::new();
        let err = store.add_entity(person("ws1", " - ")).unwrap_err();
        assert!(matches!(err, GraphError::InvalidEntity(_)));
        assert!(store.workspace_ids().is_empty());
    }

    #[test]
    fn test_add_relationship_unknown_endpoint() {
        let store = GraphStore::new();
        let sarah = store.add_entity(person("ws1", "Sarah")).unwrap();
        let before = store.stats("ws1");

        let err = store
            .add_relationship(Relationship::new("ws1", sarah.id, 9999, "leads"))
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownEntity { .. }));

        let after = store.stats("ws1");
        assert_eq!(before.entity_count, after.entity_count);
        assert_eq!(after.relationship_count, 0);
    }

    #[test]
    fn test_workspace_isolation() {
        let store = GraphStore::new();
        let a = store.add_entity(person("ws1", "Sarah")).unwrap();
        let b = store.add_entity(person("ws2", "Bob")).unwrap();

        // Endpoint from another workspace is unknown here
        let err = store
            .add_relationship(Relationship::new("ws1", a.id, b.id, "knows"))
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownEntity { .. }));

        assert!(store.get_entity("ws2", "Sarah").is_none());
        assert!(store.get_entity("ws1", &b.id.to_string()).is_none());
        assert!(store.get_entity("ws1", &a.id.to_string()).is_some());
    }

    #[test]
    fn test_neighbors_both_directions() {
        let store = GraphStore::new();
        let sarah = store.add_entity(person("ws1", "Sarah")).unwrap();
        let bob = store.add_entity(person("ws1", "Bob")).unwrap();
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
            .add_relationship(Relationship::new("ws1", bob.id, sarah.id, "reports_to"))
            .unwrap();
        store
            .add_relationship(Relationship::new("ws1", sarah.id, sarah.id, "manages"))
            .unwrap();

        let names: Vec<String> = store
            .neighbors("ws1", sarah.id)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"Bob".to_string()));
        assert!(names.contains(&"Q4 Campaign".to_string()));
        assert_eq!(store.relationships_of("ws1", sarah.id).len(), 4);
    }

    #[test]
    fn test_neighborhood_depth() {
        let store = GraphStore::new();
        let a = store.add_entity(person("ws1", "A")).unwrap();
        let b = store.add_entity(person("ws1", "B")).unwrap();
        let c = store.add_entity(person("ws1", "C")).unwrap();
        store
            .add_relationship(Relationship::new("ws1", a.id, b.id, "knows"))
            .unwrap();
        store
            .add_relationship(Relationship::new("ws1", b.id, c.id, "knows"))
            .unwrap();

        assert_eq!(store.neighborhood("ws1", a.id, 1).len(), 2);
        let two_hops = store.neighborhood("ws1", a.id, 2);
        assert_eq!(two_hops.len(), 3);
        assert_eq!(two_hops[2].1, 2);
    }

    #[test]
    fn test_replace_communities_is_atomic_swap() {
        let store = GraphStore::new();
        let a = store.add_entity(person("ws1", "A")).unwrap();
        let b = store.add_entity(person("ws1", "B")).unwrap();

        let before = store.communities("ws1");
        assert!(before.is_empty());

        let id = store.allocate_community_id();
        let set = store.replace_communities_with("ws1", |view| {
            assert_eq!(view.entity_ids.len(), 2);
            vec![Community::new(id, "ws1", vec![a.id, b.id])]
        });

        // Old snapshot is untouched, new one is visible
        assert!(before.is_empty());
        assert_eq!(set.generation, 1);
        assert_eq!(store.communities("ws1").len(), 1);

        let summaries = HashMap::from([(id, "A and B".to_string())]);
        assert!(store.attach_summaries("ws1", 1, &summaries));
        assert!(!store.attach_summaries("ws1", 0, &summaries));
        assert_eq!(store.communities("ws1").communities[0].summary, "A and B");
    }

    #[test]
    fn test_snapshot_restore() {
        let store = GraphStore::new();
        let a = store.add_entity(person("ws1", "Sarah")).unwrap();
        let b = store.add_entity(person("ws1", "Bob")).unwrap();
        store
            .add_relationship(Relationship::new("ws1", b.id, a.id, "works_with"))
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ws1.json");
        store.snapshot("ws1").unwrap().save(&path).unwrap();

        let restored = GraphStore::new();
        let snapshot = WorkspaceSnapshot::load(&path).unwrap();
        assert_eq!(restored.restore(&snapshot).unwrap(), (2, 1));

        let sarah = restored.get_entity("ws1", "sarah").unwrap();
        assert_eq!(restored.neighbors("ws1", sarah.id)[0].name, "Bob");
    }

    #[test]
    fn test_drop_workspace() {
        let store = GraphStore::new();
        store.add_entity(person("ws1", "Sarah")).unwrap();
        assert!(store.drop_workspace("ws1"));
        assert!(store.all_entities("ws1").is_empty());
        assert!(matches!(
            store.snapshot("ws1"),
            Err(GraphError::WorkspaceNotFound(_))
        ));
    }
}
