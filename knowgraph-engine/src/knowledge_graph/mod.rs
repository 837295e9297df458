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

//! Knowledge Graph Module
//!
//! GraphRAG-style knowledge graph over workplace text:
//! - Entity and relationship extraction using an LLM, with a pattern fallback
//! - Per-workspace graph store with name-based deduplication
//! - Leiden community detection and community summaries
//! - Global (map-reduce over communities) and local (neighbourhood) search
//!
//! ## Architecture
//!
//! ```text
//! Documents → Extraction → GraphStore (per workspace)
//!                 ↓              ↓
//!            (LLM/patterns)   Leiden → Communities → Summaries
//!                                                       ↓
//! Query → QueryRouter ─┬─ global: map-reduce over summaries
//!                      └─ local:  anchor entity + neighbourhood
//! ```
//!
//! ## Queries
//!
//! - "What are the main themes?" (global)
//! - "Tell me about Sarah" (local)
//! - "Who works on the Q4 Campaign?" (local)

pub mod entities;
pub mod extractor;
pub mod global_search;
pub mod graph;
pub mod leiden;
pub mod local_search;
pub mod router;
pub mod summarizer;

pub use entities::*;
pub use extractor::{EntityExtractor, Extraction, PatternExtractor};
pub use global_search::{GlobalSearch, PartialAnswer};
pub use graph::{CommunitySet, GraphStore, WorkspaceSnapshot, WorkspaceView};
pub use leiden::{CommunityDetector, LeidenClustering, LeidenConfig, LeidenPartition};
pub use local_search::{LocalEntity, LocalSearch, MatchKind};
pub use router::{QueryMode, QueryResponse, QueryRouter};
pub use summarizer::{CommunitySummarizer, SummaryReport};
