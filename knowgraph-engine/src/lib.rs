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

//! Knowgraph Engine
//!
//! Turns unstructured workplace text into per-workspace knowledge graphs and
//! answers natural language questions against them.

pub mod config;
pub mod engine;
pub mod error;
pub mod knowledge_graph;
pub mod llm;

pub use config::EngineConfig;
pub use engine::{EngineStats, IngestReport, KnowledgeEngine, RebuildReport};
pub use error::{FallbackUsed, GraphError, GraphResult, LlmError, Outcome, OutcomeExt};
pub use knowledge_graph::{QueryMode, QueryResponse};
