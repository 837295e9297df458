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

//! Entity and Relationship Extraction
//!
//! Turns free text (documents, chat messages, emails) into entities and
//! relationships.
//!
//! ## Extraction Process
//!
//! 1. Truncate the input and build the extraction prompt
//! 2. Call the backend via `LLMProviderManager` (bounded by its timeout)
//! 3. Slice the JSON object out of the reply and deserialize it into the
//!    strict raw schema
//! 4. Validate and coerce into [`Extraction`]
//!
//! Any failure in 2-4 falls through to [`PatternExtractor`], a pure lexical
//! scan that never fails.
//!
//! ## Example
//!
//! Input: "Sarah leads the Q4 Campaign"
//!
//! Output (model path):
//! - entities: Sarah (person), Q4 Campaign (project)
//! - relationships: (Sarah, leads, Q4 Campaign)

use crate::config::ExtractionConfig;
use crate::error::{FallbackUsed, LlmError, Outcome};
use crate::knowledge_graph::entities::{
    normalize_entity_name, normalize_relation_type, normalize_type, GENERIC_ENTITY_TYPE,
};
use crate::llm::{extract_json_block, LLMProviderManager};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// An entity as produced by extraction, before it is stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
    pub description: String,
}

/// A relationship between two extracted entity names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub from: String,
    pub to: String,
    pub rel_type: String,
    pub description: String,
}

/// Validated output of one extraction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

/// Extractor backed by the model, falling back to [`PatternExtractor`]
pub struct EntityExtractor {
    config: ExtractionConfig,
    llm: Arc<LLMProviderManager>,
    fallback: PatternExtractor,
}

impl EntityExtractor {
    pub fn new(config: ExtractionConfig, llm: Arc<LLMProviderManager>) -> Self {
        let fallback = PatternExtractor::new(config.max_entities);
        Self {
            config,
            llm,
            fallback,
        }
    }

    /// Check if model extraction is available
    pub fn has_llm(&self) -> bool {
        self.llm.is_enabled()
    }

    /// Extract entities and relationships from one piece of text
    ///
    /// `Ok` carries the model's extraction, `Err` the pattern fallback.
    /// Neither branch ever signals an ingestion failure.
    pub async fn extract(
        &self,
        text: &str,
        doc_id: &str,
        source: &str,
        workspace_id: &str,
    ) -> Outcome<Extraction> {
        if text.trim().is_empty() {
            return Ok(Extraction::default());
        }

        if !self.has_llm() {
            return Err(FallbackUsed::new(
                self.fallback.extract(text),
                "no LLM provider configured",
            ));
        }

        match self.extract_with_llm(text, source).await {
            Ok(extraction) => {
                debug!(
                    workspace = workspace_id,
                    doc_id,
                    entities = extraction.entities.len(),
                    relationships = extraction.relationships.len(),
                    "Extracted with LLM"
                );
                Ok(extraction)
            }
            Err(e) => {
                warn!(
                    workspace = workspace_id,
                    doc_id, "LLM extraction failed, falling back to patterns: {}", e
                );
                Err(FallbackUsed::new(self.fallback.extract(text), e.to_string()))
            }
        }
    }

    async fn extract_with_llm(&self, text: &str, source: &str) -> Result<Extraction, LlmError> {
        let prompt = self.build_extraction_prompt(text, source);
        let response = self
            .llm
            .complete(
                "You are a knowledge graph extraction system. Extract entities and relationships from workplace text. Output only valid JSON.",
                prompt,
            )
            .await?;

        self.parse_extraction(&response)
    }

    /// Build the extraction prompt with one worked example
    fn build_extraction_prompt(&self, text: &str, source: &str) -> String {
        let truncated: String = text.chars().take(self.config.max_input_chars).collect();

        format!(
            r#"Extract the entities and relationships mentioned in the {source} below.

## ENTITY TYPES (prefer these)
person, project, task, team, organization, meeting, document, product, event, concept

## RELATIONSHIP TYPES (snake_case verbs)
leads, works_on, works_with, manages, reports_to, owns, attends, depends_on, part_of, related_to

## EXAMPLE

Input: "Priya manages the Atlas Migration and meets Tom every Friday"
Output:
{{"entities": [
  {{"name": "Priya", "type": "person", "description": "Manager of the Atlas Migration"}},
  {{"name": "Atlas Migration", "type": "project", "description": "Project managed by Priya"}},
  {{"name": "Tom", "type": "person", "description": "Meets Priya weekly"}}
], "relationships": [
  {{"from": "Priya", "to": "Atlas Migration", "type": "manages", "description": "Priya manages the project"}},
  {{"from": "Priya", "to": "Tom", "type": "works_with", "description": "Weekly Friday meeting"}}
]}}

## INPUT
{truncated}

## OUTPUT
Return ONLY a JSON object with keys "entities" and "relationships". Every relationship endpoint must be an entity name. No markdown, no explanation."#
        )
    }

    /// Parse and validate the model reply against the strict schema
    fn parse_extraction(&self, response: &str) -> Result<Extraction, LlmError> {
        let json_str = extract_json_block(response, '{', '}').ok_or_else(|| {
            LlmError::MalformedResponse("no JSON object in LLM response".to_string())
        })?;

        let raw: RawExtraction = serde_json::from_str(json_str)?;

        let mut extraction = Extraction::default();
        let mut seen: HashSet<String> = HashSet::new();

        for entity in raw.entities {
            if extraction.entities.len() >= self.config.max_entities {
                break;
            }
            let key = normalize_entity_name(&entity.name);
            if key.is_empty() || !seen.insert(key) {
                continue;
            }
            extraction.entities.push(ExtractedEntity {
                name: entity.name.trim().to_string(),
                entity_type: normalize_type(entity.entity_type.as_deref().unwrap_or("")),
                description: entity.description.unwrap_or_default().trim().to_string(),
            });
        }

        for rel in raw.relationships {
            if extraction.relationships.len() >= self.config.max_relationships {
                break;
            }
            let from = rel.from.trim().to_string();
            let to = rel.to.trim().to_string();
            let (from_key, to_key) = (normalize_entity_name(&from), normalize_entity_name(&to));
            if from_key.is_empty() || to_key.is_empty() {
                continue;
            }

            // Endpoints the model named only inside a relationship are added
            // while the entity cap allows; otherwise the relationship is dropped
            let mut missing: Vec<(String, &String)> = Vec::new();
            for (key, endpoint) in [(from_key, &from), (to_key, &to)] {
                if !seen.contains(&key) && !missing.iter().any(|(k, _)| *k == key) {
                    missing.push((key, endpoint));
                }
            }
            if extraction.entities.len() + missing.len() > self.config.max_entities {
                debug!(from = %from, to = %to, "Dropping relationship past the entity cap");
                continue;
            }
            for (key, endpoint) in missing {
                seen.insert(key);
                extraction.entities.push(ExtractedEntity {
                    name: endpoint.clone(),
                    entity_type: GENERIC_ENTITY_TYPE.to_string(),
                    description: String::new(),
                });
            }

            extraction.relationships.push(ExtractedRelationship {
                from,
                to,
                rel_type: normalize_relation_type(rel.rel_type.as_deref().unwrap_or("")),
                description: rel.description.unwrap_or_default().trim().to_string(),
            });
        }

        debug!(
            entities = extraction.entities.len(),
            relationships = extraction.relationships.len(),
            "Parsed extraction from LLM response"
        );

        Ok(extraction)
    }
}

/// Raw extraction object from LLM JSON output; unknown keys are ignored
#[derive(Debug, Deserialize)]
struct RawExtraction {
    entities: Vec<RawEntity>,
    #[serde(default)]
    relationships: Vec<RawRelationship>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    #[serde(rename = "type", default)]
    entity_type: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
    from: String,
    to: String,
    #[serde(rename = "type", default)]
    rel_type: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Runs of capitalized tokens ("Sarah", "Q4 Campaign", "Acme Corp")
static CAPITALIZED_RUN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z][\w&'-]*(?:[ \t]+[A-Z0-9][\w&'-]*)*").expect("valid capitalized-run regex")
});

/// Role and noun cues that are worth indexing even in lower case
static CUE_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(project|meeting|manager|deadline|budget|campaign|client|customer|team|report|task|milestone|proposal|contract|invoice|launch|review|sprint|roadmap|release)s?\b",
    )
    .expect("valid cue regex")
});

/// Capitalized words that do not name anything on their own
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "i", "we", "you", "he", "she", "it", "they", "this", "that", "these",
    "those", "on", "in", "at", "for", "and", "but", "or", "if", "when", "then", "so", "to",
    "of", "with", "my", "our", "your", "his", "her", "their", "hi", "hello", "hey", "dear",
    "thanks", "thank", "please", "regards", "best", "yes", "no", "ok", "also", "there",
    "here", "what", "who", "how", "why", "where", "let", "just", "re", "fw", "fwd", "ask",
    "tell", "cc",
];

/// Deterministic extractor used when the model backend is unavailable
///
/// Pure and linear in the input length. Produces entities with the generic
/// type and never any relationships.
#[derive(Debug, Clone)]
pub struct PatternExtractor {
    max_entities: usize,
}

impl PatternExtractor {
    pub fn new(max_entities: usize) -> Self {
        Self { max_entities }
    }

    pub fn extract(&self, text: &str) -> Extraction {
        let mut entities: Vec<ExtractedEntity> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for m in CAPITALIZED_RUN.find_iter(text) {
            if entities.len() >= self.max_entities {
                break;
            }
            let Some(name) = strip_stop_words(m.as_str()) else {
                continue;
            };
            if seen.insert(normalize_entity_name(&name)) {
                entities.push(generic_entity(name));
            }
        }

        // Cue words already covered by a capitalized name ("Q4 Campaign") are skipped
        let covered: HashSet<String> = seen
            .iter()
            .flat_map(|name| name.split(' ').map(str::to_string).collect::<Vec<_>>())
            .collect();

        for caps in CUE_WORD.captures_iter(text) {
            if entities.len() >= self.max_entities {
                break;
            }
            let cue = caps[1].to_lowercase();
            if covered.contains(&cue) {
                continue;
            }
            if seen.insert(cue.clone()) {
                entities.push(generic_entity(cue));
            }
        }

        Extraction {
            entities,
            relationships: Vec::new(),
        }
    }
}

fn generic_entity(name: String) -> ExtractedEntity {
    ExtractedEntity {
        name,
        entity_type: GENERIC_ENTITY_TYPE.to_string(),
        description: String::new(),
    }
}

/// Drop leading/trailing stop words from a capitalized run
fn strip_stop_words(run: &str) -> Option<String> {
    let words: Vec<&str> = run.split_whitespace().collect();
    let is_stop = |w: &&str| {
        let lower = w
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        lower.is_empty() || STOP_WORDS.contains(&lower.as_str())
    };

    let start = words.iter().position(|w| !is_stop(w))?;
    let end = words.iter().rposition(|w| !is_stop(w))?;
    let name = words[start..=end]
        .join(" ")
        .trim_end_matches(|c: char| !c.is_alphanumeric())
        .to_string();

    (name.chars().count() > 1).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LLMConfig;

    fn fallback_only() -> EntityExtractor {
        let llm = Arc::new(LLMProviderManager::disabled(&LLMConfig::default()));
        EntityExtractor::new(ExtractionConfig::default(), llm)
    }

    fn names(extraction: &Extraction) -> Vec<&str> {
        extraction.entities.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_parse_extraction() {
        let extractor = fallback_only();

        let response = r#"
        Here is what I found:
        ```json
        {"entities": [
            {"name": "Sarah", "type": "Person", "description": "Campaign lead", "confidence": 0.9},
            {"name": "Q4 Campaign", "type": "project"},
            {"name": "sarah", "type": "person"}
        ],
        "relationships": [
            {"from": "Sarah", "to": "Q4 Campaign", "type": "Leads"},
            {"from": "Bob", "to": "Sarah", "type": "works with", "description": null}
        ]}
        ```
        "#;

        let extraction = extractor.parse_extraction(response).unwrap();
        assert_eq!(names(&extraction), vec!["Sarah", "Q4 Campaign", "Bob"]);
        assert_eq!(extraction.entities[0].entity_type, "person");
        assert_eq!(extraction.entities[2].entity_type, GENERIC_ENTITY_TYPE);
        assert_eq!(extraction.relationships[0].rel_type, "leads");
        assert_eq!(extraction.relationships[1].rel_type, "works_with");
    }

    #[test]
    fn test_parse_extraction_cap_drops_dangling_relationships() {
        let llm = Arc::new(LLMProviderManager::disabled(&LLMConfig::default()));
        let config = ExtractionConfig {
            max_entities: 1,
            ..Default::default()
        };
        let extractor = EntityExtractor::new(config, llm);

        let response = r#"{"entities": [
            {"name": "A", "type": "person"},
            {"name": "B", "type": "person"},
            {"name": "C", "type": "person"}
        ], "relationships": [
            {"from": "A", "to": "B", "type": "knows"},
            {"from": "A", "to": "C", "type": "knows"}
        ]}"#;

        let extraction = extractor.parse_extraction(response).unwrap();
        // B and C were capped, so neither comes back through a relationship
        assert_eq!(names(&extraction), vec!["A"]);
        assert!(extraction.relationships.is_empty());
    }

    #[test]
    fn test_parse_extraction_endpoints_fill_up_to_cap() {
        let llm = Arc::new(LLMProviderManager::disabled(&LLMConfig::default()));
        let config = ExtractionConfig {
            max_entities: 2,
            ..Default::default()
        };
        let extractor = EntityExtractor::new(config, llm);

        let response = r#"{"entities": [{"name": "Sarah"}], "relationships": [
            {"from": "Sarah", "to": "Bob", "type": "works_with"},
            {"from": "Sarah", "to": "Dana", "type": "works_with"}
        ]}"#;

        let extraction = extractor.parse_extraction(response).unwrap();
        assert_eq!(names(&extraction), vec!["Sarah", "Bob"]);
        assert_eq!(extraction.relationships.len(), 1);
        assert_eq!(extraction.relationships[0].to, "Bob");
    }

    #[test]
    fn test_parse_extraction_rejects_bad_shapes() {
        let extractor = fallback_only();

        assert!(extractor.parse_extraction("I could not find anything").is_err());
        // Missing the required "entities" key
        assert!(extractor
            .parse_extraction(r#"{"relationships": []}"#)
            .is_err());
        // Entity without a name
        assert!(extractor
            .parse_extraction(r#"{"entities": [{"type": "person"}]}"#)
            .is_err());
    }

    #[test]
    fn test_pattern_extractor() {
        let extraction = PatternExtractor::new(25).extract("Sarah leads the Q4 Campaign");
        assert_eq!(names(&extraction), vec!["Sarah", "Q4 Campaign"]);
        assert!(extraction.relationships.is_empty());
        assert!(extraction
            .entities
            .iter()
            .all(|e| e.entity_type == GENERIC_ENTITY_TYPE));
    }

    #[test]
    fn test_pattern_extractor_cues_and_stop_words() {
        let text = "Hi team, The budget meeting with Acme Corp moved. Thanks, Dana";
        let extraction = PatternExtractor::new(25).extract(text);
        let found = names(&extraction);

        assert!(found.contains(&"Acme Corp"));
        assert!(found.contains(&"Dana"));
        assert!(found.contains(&"budget"));
        assert!(found.contains(&"meeting"));
        assert!(found.contains(&"team"));
        assert!(!found.iter().any(|n| n.eq_ignore_ascii_case("hi")));
        assert!(!found.iter().any(|n| n.eq_ignore_ascii_case("the")));
    }

    #[test]
    fn test_pattern_extractor_is_bounded() {
        let text = "Alpha Beta. ".repeat(1_000) + &"Name".repeat(10);
        let extraction = PatternExtractor::new(3).extract(&text);
        assert!(extraction.entities.len() <= 3);

        let unique: String = (0..100).map(|i| format!("Person{} met. ", i)).collect();
        assert_eq!(PatternExtractor::new(10).extract(&unique).entities.len(), 10);
    }

    #[tokio::test]
    async fn test_extract_without_llm_uses_fallback() {
        let extractor = fallback_only();
        let outcome = extractor
            .extract("Bob works with Sarah", "doc1", "message", "ws1")
            .await;

        let fallback = outcome.unwrap_err();
        assert_eq!(names(&fallback.value), vec!["Bob", "Sarah"]);

        let empty = extractor.extract("   ", "doc2", "message", "ws1").await;
        assert_eq!(empty, Ok(Extraction::default()));
    }
}
