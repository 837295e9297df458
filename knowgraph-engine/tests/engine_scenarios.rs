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

//! End-to-end engine scenarios against a scripted in-process provider

use knowgraph_engine::config::EngineConfig;
use knowgraph_engine::knowledge_graph::WorkspaceSnapshot;
use knowgraph_engine::llm::{ChatMessage, ChatResponse, LLMProvider, LLMProviderManager};
use knowgraph_engine::{KnowledgeEngine, QueryMode, QueryResponse};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SARAH_DOC: &str = "Sarah leads the Q4 Campaign.";
const BOB_DOC: &str = "Bob works with Sarah on the Q4 Campaign.";
const DANA_DOC: &str = "Dana manages the Budget Review with Eli.";

/// Answers every prompt kind the engine sends with canned replies
#[derive(Default)]
struct ScriptedProvider {
    /// Sleep this long before answering map (scoring) calls
    scoring_delay: Option<Duration>,
    /// Map calls find nothing relevant in any community
    blank_map: bool,
    /// Reduce calls fail at the backend
    fail_reduce: bool,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn extraction_reply(input: &str) -> &'static str {
        if input.contains(SARAH_DOC) {
            r#"{"entities": [
                {"name": "Sarah", "type": "person", "description": "Campaign lead"},
                {"name": "Q4 Campaign", "type": "project", "description": "Marketing push for Q4"}
            ], "relationships": [
                {"from": "Sarah", "to": "Q4 Campaign", "type": "leads", "description": "Sarah leads it"}
            ]}"#
        } else if input.contains(BOB_DOC) {
            r#"Sure! ```json
            {"entities": [
                {"name": "Bob", "type": "person"},
                {"name": "sarah", "type": "person"}
            ], "relationships": [
                {"from": "Bob", "to": "Sarah", "type": "works with"},
                {"from": "Bob", "to": "Q4 Campaign", "type": "works_on"}
            ]}
            ```"#
        } else if input.contains(DANA_DOC) {
            r#"{"entities": [
                {"name": "Dana", "type": "person"},
                {"name": "Budget Review", "type": "meeting"},
                {"name": "Eli", "type": "person"}
            ], "relationships": [
                {"from": "Dana", "to": "Budget Review", "type": "manages"},
                {"from": "Eli", "to": "Budget Review", "type": "attends"},
                {"from": "Dana", "to": "Eli", "type": "works_with"}
            ]}"#
        } else {
            "I could not find any entities in this text."
        }
    }
}

#[async_trait::async_trait]
impl LLMProvider for ScriptedProvider {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        model: Option<String>,
    ) -> anyhow::Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let system = messages.first().map(|m| m.content.clone()).unwrap_or_default();
        let user = messages.last().map(|m| m.content.clone()).unwrap_or_default();

        let content = if system.contains("extraction") {
            let input = user.split("## INPUT").nth(1).unwrap_or_default();
            Self::extraction_reply(input).to_string()
        } else if system.contains("summarize clusters") {
            if user.contains("Sarah") {
                "Sarah and Bob collaborate on the Q4 Campaign.".to_string()
            } else {
                "Dana and Eli run the Budget Review.".to_string()
            }
        } else if system.contains("You score") {
            if let Some(delay) = self.scoring_delay {
                tokio::time::sleep(delay).await;
            }
            if !self.blank_map && user.contains("Q4 Campaign") {
                r#"{"score": 90, "answer": "The Q4 Campaign, led by Sarah."}"#.to_string()
            } else {
                r#"{"score": 0, "answer": ""}"#.to_string()
            }
        } else if system.contains("synthesize") {
            if self.fail_reduce {
                anyhow::bail!("synthesis backend unavailable");
            }
            "The main theme is the Q4 Campaign.".to_string()
        } else {
            "Sarah leads the Q4 Campaign and works with Bob.".to_string()
        };

        Ok(ChatResponse {
            content,
            provider: "scripted".to_string(),
            model: model.unwrap_or_else(|| "scripted-1".to_string()),
            response_model: None,
            input_tokens: None,
            output_tokens: None,
            finish_reason: Some("stop".to_string()),
            duration_ms: 0,
        })
    }

    fn list_models(&self) -> Vec<String> {
        vec!["scripted-1".to_string()]
    }

    fn name(&self) -> &str {
        "Scripted"
    }
}

/// Never answers within any reasonable timeout
struct StalledProvider;

#[async_trait::async_trait]
impl LLMProvider for StalledProvider {
    async fn chat(
        &self,
        _messages: Vec<ChatMessage>,
        _model: Option<String>,
    ) -> anyhow::Result<ChatResponse> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        anyhow::bail!("stalled")
    }

    fn list_models(&self) -> Vec<String> {
        vec![]
    }

    fn name(&self) -> &str {
        "Stalled"
    }
}

fn engine_with(provider: Arc<dyn LLMProvider>, config: EngineConfig) -> KnowledgeEngine {
    let llm = LLMProviderManager::disabled(&config.llm);
    llm.register(config.llm.provider_id.clone(), provider);
    KnowledgeEngine::with_llm(config, Arc::new(llm))
}

fn scripted_engine() -> KnowledgeEngine {
    let mut config = EngineConfig::default();
    config.community.seed = Some(42);
    engine_with(Arc::new(ScriptedProvider::default()), config)
}

fn offline_engine() -> KnowledgeEngine {
    let config = EngineConfig::default();
    let llm = Arc::new(LLMProviderManager::disabled(&config.llm));
    KnowledgeEngine::with_llm(config, llm)
}

async fn ingest_scenario(engine: &KnowledgeEngine) {
    for (doc_id, text) in [("doc1", SARAH_DOC), ("doc2", BOB_DOC), ("doc3", DANA_DOC)] {
        let report = engine.ingest("ws1", doc_id, text, "message").await;
        assert!(!report.fallback_used, "{} fell back: {:?}", doc_id, report);
        assert_eq!(report.skipped, 0);
    }
}

#[tokio::test]
async fn test_sarah_bob_scenario() {
    let engine = scripted_engine();
    ingest_scenario(&engine).await;

    let stats = engine.stats(Some("ws1"));
    assert_eq!(stats.graph.entity_count, 6);
    assert_eq!(stats.graph.relationship_count, 6);
    assert_eq!(stats.graph.entity_type_distribution["person"], 4);

    // Sarah was mentioned by two documents and merged
    let sarah = engine.store().get_entity("ws1", "Sarah").unwrap();
    assert!(sarah.source_refs.contains("doc1") && sarah.source_refs.contains("doc2"));

    let rebuild = engine.rebuild_communities("ws1", Some(2)).await;
    assert_eq!(rebuild.communities_built, 2);
    assert_eq!(rebuild.summaries_generated, 2);
    assert_eq!(rebuild.summary_fallbacks, 0);

    let response = engine.query("ws1", "Sarah", QueryMode::Local).await;
    match response {
        QueryResponse::Local {
            entities_found,
            entities,
            start_entity,
            fallback_used,
            answer,
            ..
        } => {
            assert!(entities_found >= 2);
            assert_eq!(start_entity.as_deref(), Some("Sarah"));
            let names: Vec<&str> = entities.iter().map(|e| e.name.as_str()).collect();
            assert!(names.contains(&"Bob"));
            assert!(names.contains(&"Q4 Campaign"));
            assert!(!fallback_used);
            assert!(answer.contains("works with Bob"));
        }
        other => panic!("expected local response, got {:?}", other),
    }
}

#[tokio::test]
async fn test_global_search_with_llm() {
    let engine = scripted_engine();
    ingest_scenario(&engine).await;
    engine.rebuild_communities("ws1", None).await;

    let response = engine
        .query("ws1", "What are the main themes?", QueryMode::Auto)
        .await;
    match response {
        QueryResponse::Global {
            answer,
            communities_found,
            communities_used,
            partial_answers,
            fallback_used,
            error,
        } => {
            assert_eq!(communities_found, 2);
            assert_eq!(communities_used, 1);
            assert_eq!(partial_answers[0].score, 90);
            assert!(!fallback_used);
            assert!(error.is_none());
            assert_eq!(answer, "The main theme is the Q4 Campaign.");
        }
        other => panic!("expected global response, got {:?}", other),
    }
}

#[tokio::test]
async fn test_global_search_answer_when_nothing_relevant() {
    let mut config = EngineConfig::default();
    config.community.seed = Some(42);
    let provider = Arc::new(ScriptedProvider {
        blank_map: true,
        fail_reduce: true,
        ..Default::default()
    });
    let engine = engine_with(provider, config);
    ingest_scenario(&engine).await;
    engine.rebuild_communities("ws1", None).await;

    let response = engine
        .query("ws1", "Who approved the invoice?", QueryMode::Global)
        .await;
    match response {
        QueryResponse::Global {
            answer,
            communities_used,
            fallback_used,
            ..
        } => {
            assert_eq!(communities_used, 2);
            assert!(fallback_used);
            assert_eq!(answer, "No relevant information found in 2 communities.");
        }
        other => panic!("expected global response, got {:?}", other),
    }
}

#[tokio::test]
async fn test_auto_routing() {
    let engine = scripted_engine();
    ingest_scenario(&engine).await;
    engine.rebuild_communities("ws1", None).await;

    let global = engine
        .query("ws1", "What are the main themes?", QueryMode::Auto)
        .await;
    assert_eq!(global.mode(), QueryMode::Global);

    let local = engine
        .query("ws1", "Tell me about Sarah", QueryMode::Auto)
        .await;
    assert_eq!(local.mode(), QueryMode::Local);
    assert!(local.error().is_none());
}

#[tokio::test]
async fn test_empty_and_unknown() {
    let engine = scripted_engine();

    let response = engine
        .query("empty_ws", "What are the main themes?", QueryMode::Global)
        .await;
    match response {
        QueryResponse::Global {
            communities_found,
            answer,
            ..
        } => {
            assert_eq!(communities_found, 0);
            assert!(answer.contains("No communities found"));
        }
        other => panic!("expected global response, got {:?}", other),
    }

    ingest_scenario(&engine).await;
    let response = engine
        .query("ws1", "nonexistent_name", QueryMode::Local)
        .await;
    match &response {
        QueryResponse::Local { entities_found, .. } => assert_eq!(*entities_found, 0),
        other => panic!("expected local response, got {:?}", other),
    }
    assert!(response.error().is_some());
}

#[tokio::test]
async fn test_malformed_extraction_falls_back() {
    let engine = scripted_engine();

    let report = engine
        .ingest("ws1", "note", "Random note about Zed and the launch", "document")
        .await;
    assert!(report.fallback_used);
    assert!(report.fallback_reason.is_some());
    assert!(engine.store().get_entity("ws1", "Zed").is_some());
    assert!(engine.store().get_entity("ws1", "launch").is_some());
}

#[tokio::test]
async fn test_timeout_falls_back() {
    let mut config = EngineConfig::default();
    config.llm.request_timeout_ms = 50;
    let engine = engine_with(Arc::new(StalledProvider), config);

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        engine.ingest("ws1", "doc1", SARAH_DOC, "message"),
    )
    .await
    .expect("ingest should finish after the backend timeout");

    assert!(report.fallback_used);
    assert_eq!(report.entities_extracted, 2);
    assert_eq!(report.relationships_extracted, 0);
}

#[tokio::test]
async fn test_offline_engine_never_fails() {
    let engine = offline_engine();

    let inputs = [
        "",
        "   \n\t",
        "lowercase text without names",
        "!!! ??? ...",
        "The The The",
        "Überraschung für Zoë bei ACME GmbH",
        SARAH_DOC,
    ];
    for (i, text) in inputs.iter().enumerate() {
        let report = engine
            .ingest("ws1", &format!("doc{}", i), text, "document")
            .await;
        assert_eq!(report.skipped, 0);
    }

    let rebuild = engine.rebuild_communities("ws1", None).await;
    // Pattern extraction produces no relationships, hence no communities
    assert_eq!(rebuild.communities_built, 0);

    let response = engine
        .query("ws1", "What are the main themes?", QueryMode::Auto)
        .await;
    assert_eq!(response.mode(), QueryMode::Global);
}

#[tokio::test]
async fn test_isolated_entity_has_no_community() {
    let engine = offline_engine();
    engine.ingest("ws1", "doc1", "Sarah", "message").await;

    let rebuild = engine.rebuild_communities("ws1", Some(2)).await;
    assert_eq!(rebuild.communities_built, 0);
    assert_eq!(engine.stats(Some("ws1")).graph.community_count, 0);
}

#[tokio::test]
async fn test_cancelled_global_search_returns_promptly() {
    let mut config = EngineConfig::default();
    config.community.seed = Some(42);
    let provider = Arc::new(ScriptedProvider {
        scoring_delay: Some(Duration::from_secs(10)),
        ..Default::default()
    });
    let engine = engine_with(provider, config);
    ingest_scenario(&engine).await;
    engine.rebuild_communities("ws1", None).await;

    let before = engine.stats(Some("ws1"));
    let generation = engine.store().communities("ws1").generation;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let response = tokio::time::timeout(
        Duration::from_secs(2),
        engine.query_with_cancel("ws1", "What are the main themes?", QueryMode::Global, cancel),
    )
    .await
    .expect("cancelled search should return promptly");

    assert_eq!(response.error(), Some("cancelled"));

    let after = engine.stats(Some("ws1"));
    assert_eq!(before.graph.entity_count, after.graph.entity_count);
    assert_eq!(before.graph.community_count, after.graph.community_count);
    assert_eq!(engine.store().communities("ws1").generation, generation);
}

#[tokio::test]
async fn test_concurrent_ingest_across_workspaces() {
    let engine = Arc::new(offline_engine());

    let mut handles = Vec::new();
    for i in 0..20 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let ws = if i % 2 == 0 { "even" } else { "odd" };
            engine
                .ingest(ws, &format!("doc{}", i), &format!("Person{} met Shared", i), "message")
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().entities_extracted, 2);
    }

    // Ten distinct people plus one merged "Shared" entity per workspace
    assert_eq!(engine.stats(Some("even")).graph.entity_count, 11);
    assert_eq!(engine.stats(Some("odd")).graph.entity_count, 11);
    let shared = engine.store().get_entity("even", "shared").unwrap();
    assert_eq!(shared.source_refs.len(), 10);
}

#[tokio::test]
async fn test_snapshot_restore_and_drop() {
    let engine = scripted_engine();
    ingest_scenario(&engine).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ws1.json");
    engine.snapshot("ws1").unwrap().save(&path).unwrap();

    let restored = offline_engine();
    let mut snapshot = WorkspaceSnapshot::load(&path).unwrap();
    snapshot.workspace_id = "copy".to_string();
    assert_eq!(restored.restore(&snapshot).unwrap(), (6, 6));
    assert_eq!(restored.rebuild_communities("copy", Some(2)).await.communities_built, 2);

    assert!(engine.drop_workspace("ws1"));
    assert_eq!(engine.stats(None).workspace_count, 0);
    assert!(engine.snapshot("ws1").is_err());
}
