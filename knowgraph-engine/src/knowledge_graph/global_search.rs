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

//! Global Search
//!
//! Map-reduce over community summaries for questions about a workspace as
//! a whole ("What are the main themes?").
//!
//! - **Map**: score every community summary against the query (model call
//!   returning `{"score", "answer"}`, or lexical term overlap), bounded by a
//!   semaphore of `map_concurrency` permits
//! - **Reduce**: synthesize the top-K partial answers (model call, or plain
//!   concatenation)

use crate::config::SearchConfig;
use crate::error::{FallbackUsed, LlmError, Outcome};
use crate::knowledge_graph::entities::{word_tokens, Community, CommunityId};
use crate::knowledge_graph::graph::GraphStore;
use crate::knowledge_graph::router::QueryResponse;
use crate::knowledge_graph::summarizer::CommunitySummarizer;
use crate::llm::{extract_json_block, LLMProviderManager};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Words ignored when scoring lexical overlap
pub(crate) const QUERY_STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "what", "which", "who", "whom", "how", "why",
    "when", "where", "is", "of", "to", "in", "on", "at", "a", "an", "about", "me", "tell",
    "give", "show", "do", "does", "did", "this", "that", "these", "those", "with", "there",
    "their", "any", "all", "our", "we", "you", "it", "its", "be", "been", "has", "have",
];

/// One community's contribution to a global answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialAnswer {
    pub community_id: CommunityId,
    /// Relevance 0-100
    pub score: u32,
    pub answer: String,
}

/// Raw `{"score", "answer"}` object from the map prompt
#[derive(Debug, Deserialize)]
struct RawScore {
    score: f64,
    #[serde(default)]
    answer: String,
}

pub struct GlobalSearch {
    store: Arc<GraphStore>,
    summarizer: Arc<CommunitySummarizer>,
    llm: Arc<LLMProviderManager>,
    config: SearchConfig,
}

impl GlobalSearch {
    pub fn new(
        store: Arc<GraphStore>,
        summarizer: Arc<CommunitySummarizer>,
        llm: Arc<LLMProviderManager>,
        config: SearchConfig,
    ) -> Self {
        Self {
            store,
            summarizer,
            llm,
            config,
        }
    }

    /// Answer a thematic question from the workspace's community summaries
    pub async fn global_search(&self, workspace_id: &str, query: &str) -> QueryResponse {
        let set = self.store.communities(workspace_id);
        if set.is_empty() {
            return no_communities(workspace_id);
        }

        let communities_found = set.len();

        // Map
        let semaphore = Semaphore::new(self.config.map_concurrency.max(1));
        let tasks = set.communities.iter().map(|community| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok();
                self.map_community(community, query).await
            }
        });

        let mut fallback_used = false;
        let mut partials: Vec<PartialAnswer> = join_all(tasks)
            .await
            .into_iter()
            .map(|outcome| match outcome {
                Ok(partial) => partial,
                Err(fallback) => {
                    fallback_used = true;
                    fallback.value
                }
            })
            .collect();

        // Reduce
        partials.sort_by(|a, b| b.score.cmp(&a.score));
        let top_k = self.config.top_k.max(1);
        let relevant: Vec<PartialAnswer> = partials
            .iter()
            .filter(|p| p.score > 0)
            .take(top_k)
            .cloned()
            .collect();
        let selected = if relevant.is_empty() {
            partials.into_iter().take(top_k).collect()
        } else {
            relevant
        };

        let answer = match self.reduce(query, &selected).await {
            Ok(answer) => answer,
            Err(fallback) => {
                fallback_used = true;
                fallback.value
            }
        };

        info!(
            workspace = workspace_id,
            communities_found,
            communities_used = selected.len(),
            fallback_used,
            "Global search complete"
        );

        QueryResponse::Global {
            answer,
            communities_found,
            communities_used: selected.len(),
            partial_answers: selected,
            fallback_used,
            error: None,
        }
    }

    /// Global search that gives up as soon as `cancel` fires
    ///
    /// In-flight map calls are dropped; the store is never written.
    pub async fn global_search_with_cancel(
        &self,
        workspace_id: &str,
        query: &str,
        cancel: CancellationToken,
    ) -> QueryResponse {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(workspace = workspace_id, "Global search cancelled");
                QueryResponse::Global {
                    answer: "Search cancelled before an answer was produced.".to_string(),
                    communities_found: self.store.communities(workspace_id).len(),
                    communities_used: 0,
                    partial_answers: Vec::new(),
                    fallback_used: false,
                    error: Some("cancelled".to_string()),
                }
            }
            response = self.global_search(workspace_id, query) => response,
        }
    }

    async fn map_community(&self, community: &Community, query: &str) -> Outcome<PartialAnswer> {
        let summary = self.summarizer.summary_for(community).await;

        let lexical = || PartialAnswer {
            community_id: community.id,
            score: lexical_score(query, &summary),
            answer: summary.clone(),
        };

        if !self.llm.is_enabled() {
            return Err(FallbackUsed::new(lexical(), "no LLM provider configured"));
        }

        match self.score_with_llm(query, &summary).await {
            Ok((score, answer)) => Ok(PartialAnswer {
                community_id: community.id,
                score,
                answer,
            }),
            Err(e) => {
                debug!(community = community.id, "Map call failed, scoring lexically: {}", e);
                Err(FallbackUsed::new(lexical(), e.to_string()))
            }
        }
    }

    async fn score_with_llm(&self, query: &str, summary: &str) -> Result<(u32, String), LlmError> {
        let prompt = format!(
            r#"## COMMUNITY SUMMARY
{summary}

## QUESTION
{query}

Rate how useful this summary is for answering the question and answer it from the summary alone.
Return ONLY a JSON object: {{"score": <0-100>, "answer": "<answer or empty>"}}"#
        );

        let response = self
            .llm
            .complete(
                "You score knowledge-graph community summaries against questions. Output only valid JSON.",
                prompt,
            )
            .await?;

        let json = extract_json_block(&response, '{', '}').ok_or_else(|| {
            LlmError::MalformedResponse("no JSON object in map response".to_string())
        })?;
        let raw: RawScore = serde_json::from_str(json)?;
        if !raw.score.is_finite() {
            return Err(LlmError::MalformedResponse("non-finite score".to_string()));
        }

        let score = raw.score.clamp(0.0, 100.0).round() as u32;
        Ok((score, raw.answer.trim().to_string()))
    }

    async fn reduce(&self, query: &str, partials: &[PartialAnswer]) -> Outcome<String> {
        let concatenated = || {
            let lines: Vec<String> = partials
                .iter()
                .filter(|p| !p.answer.is_empty())
                .map(|p| format!("- {}", p.answer))
                .collect();
            if lines.is_empty() {
                format!(
                    "No relevant information found in {} communities.",
                    partials.len()
                )
            } else {
                lines.join("\n")
            }
        };

        if !self.llm.is_enabled() {
            return Err(FallbackUsed::new(concatenated(), "no LLM provider configured"));
        }

        let mut prompt = format!("## QUESTION\n{query}\n\n## PARTIAL ANSWERS (most relevant first)\n");
        for (i, partial) in partials.iter().enumerate() {
            prompt.push_str(&format!("{}. [score {}] {}\n", i + 1, partial.score, partial.answer));
        }
        prompt.push_str("\nCombine the partial answers into one concise answer to the question.");

        match self
            .llm
            .complete(
                "You synthesize answers about a workplace knowledge graph.",
                prompt,
            )
            .await
        {
            Ok(answer) => Ok(answer.trim().to_string()),
            Err(e) => {
                warn!("Reduce call failed, concatenating partial answers: {}", e);
                Err(FallbackUsed::new(concatenated(), e.to_string()))
            }
        }
    }
}

fn no_communities(workspace_id: &str) -> QueryResponse {
    QueryResponse::Global {
        answer: format!(
            "No communities found in workspace '{}'. Ingest documents and rebuild communities first.",
            workspace_id
        ),
        communities_found: 0,
        communities_used: 0,
        partial_answers: Vec::new(),
        fallback_used: false,
        error: None,
    }
}

/// Share of meaningful query terms present in `text`, scaled to 0-100
pub fn lexical_score(query: &str, text: &str) -> u32 {
    let terms: HashSet<String> = word_tokens(query)
        .into_iter()
        .filter(|t| t.len() > 1 && !QUERY_STOP_WORDS.contains(&t.as_str()))
        .collect();
    if terms.is_empty() {
        return 0;
    }

    let words: HashSet<String> = word_tokens(text).into_iter().collect();
    let matched = terms
        .iter()
        .filter(|t| {
            words.contains(*t)
                || words.contains(t.trim_end_matches('s'))
                || words.contains(&format!("{}s", t))
        })
        .count();

    ((matched as f64 / terms.len() as f64) * 100.0).round() as u32
}
