//! User preferences learned across interactions, ranked by confidence and
//! injected into every prompt the orchestrator composes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bus::{BusEvent, EventBus};
use crate::error::Result;
use crate::oracle::parse::lenient_from_str;
use crate::store::DataStore;

/// Totally ordered: an upsert only replaces when the incoming confidence is
/// at least the stored one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Assumed,
    Inferred,
    Explicit,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assumed => write!(f, "assumed"),
            Self::Inferred => write!(f, "inferred"),
            Self::Explicit => write!(f, "explicit"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPreference {
    pub id: String,
    pub agent_id: String,
    pub category: String,
    /// Unique per agent.
    pub key: String,
    pub value: String,
    pub source: String,
    pub confidence: Confidence,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub used_count: u32,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Shape the oracle is asked to produce when extracting preferences.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExtractionReply {
    #[serde(default)]
    pub preferences: Vec<ExtractedPreference>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExtractedPreference {
    pub category: String,
    pub key: String,
    pub value: String,
    pub confidence: Confidence,
}

/// Inputs to the extraction prompt.
#[derive(Debug, Default)]
pub struct ExtractionInput<'a> {
    pub user_message: &'a str,
    pub agent_message: &'a str,
    pub context: &'a str,
}

pub struct PreferenceManager {
    store: Arc<DataStore>,
    bus: Arc<EventBus>,
    prefs: RwLock<HashMap<String, HashMap<String, AgentPreference>>>,
    loaded: RwLock<HashSet<String>>,
}

impl PreferenceManager {
    pub fn new(store: Arc<DataStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            prefs: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashSet::new()),
        }
    }

    async fn ensure_loaded(&self, agent_id: &str) {
        if self.loaded.read().contains(agent_id) {
            return;
        }
        match self.store.load_preferences(agent_id).await {
            Ok(prefs) => {
                let map = prefs.into_iter().map(|p| (p.key.clone(), p)).collect();
                self.prefs.write().insert(agent_id.to_string(), map);
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Failed to load preferences");
                self.prefs.write().entry(agent_id.to_string()).or_default();
            }
        }
        self.loaded.write().insert(agent_id.to_string());
    }

    /// Upsert with confidence ordering: an existing entry is replaced only
    /// when the incoming confidence is greater or equal. Returns whether
    /// the preference was stored.
    pub async fn add_preference(
        &self,
        agent_id: &str,
        category: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
        source: impl Into<String>,
        confidence: Confidence,
    ) -> Result<bool> {
        self.ensure_loaded(agent_id).await;
        let key = key.into();
        let stored = {
            let mut prefs = self.prefs.write();
            let agent_prefs = prefs.entry(agent_id.to_string()).or_default();
            match agent_prefs.get(&key) {
                Some(existing) if confidence < existing.confidence => false,
                _ => {
                    agent_prefs.insert(
                        key.clone(),
                        AgentPreference {
                            id: uuid::Uuid::new_v4().to_string(),
                            agent_id: agent_id.to_string(),
                            category: category.into(),
                            key: key.clone(),
                            value: value.into(),
                            source: source.into(),
                            confidence,
                            created_at: Utc::now(),
                            used_count: 0,
                            last_used_at: None,
                        },
                    );
                    true
                }
            }
        };
        if stored {
            self.bus.publish(BusEvent::PreferenceStored {
                agent_id: agent_id.to_string(),
                key,
                confidence: confidence.to_string(),
            });
            self.persist(agent_id).await;
        }
        Ok(stored)
    }

    pub async fn list(&self, agent_id: &str) -> Vec<AgentPreference> {
        self.ensure_loaded(agent_id).await;
        let mut prefs: Vec<AgentPreference> = self
            .prefs
            .read()
            .get(agent_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        prefs.sort_by(|a, b| a.key.cmp(&b.key));
        prefs
    }

    pub async fn get(&self, agent_id: &str, key: &str) -> Option<AgentPreference> {
        self.ensure_loaded(agent_id).await;
        self.prefs
            .read()
            .get(agent_id)
            .and_then(|m| m.get(key))
            .cloned()
    }

    pub async fn remove_preference(&self, agent_id: &str, key: &str) -> bool {
        self.ensure_loaded(agent_id).await;
        let removed = self
            .prefs
            .write()
            .get_mut(agent_id)
            .and_then(|m| m.remove(key))
            .is_some();
        if removed {
            self.persist(agent_id).await;
        }
        removed
    }

    pub async fn clear_agent(&self, agent_id: &str) {
        self.prefs.write().remove(agent_id);
        self.loaded.write().remove(agent_id);
        if let Err(e) = self.store.delete_preferences(agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to delete preference file");
        }
    }

    /// Compact newline list for prompt injection; empty string when the
    /// agent has no preferences.
    pub async fn build_preference_context(&self, agent_id: &str) -> String {
        let prefs = self.list(agent_id).await;
        if prefs.is_empty() {
            return String::new();
        }
        let lines: Vec<String> = prefs
            .iter()
            .map(|p| {
                format!(
                    "- [{}] {}: {} ({})",
                    p.category, p.key, p.value, p.confidence
                )
            })
            .collect();
        format!(
            "Known user preferences (mention [Used preference: KEY] when one shapes your work):\n{}",
            lines.join("\n")
        )
    }

    pub async fn build_extraction_prompt(
        &self,
        agent_id: &str,
        input: ExtractionInput<'_>,
    ) -> String {
        let existing = self.build_preference_context(agent_id).await;
        let contract = crate::oracle::response_contract::<ExtractionReply>();
        format!(
            r#"Extract durable user preferences from this exchange.

Context: {context}

Agent asked:
{agent_message}

User replied:
{user_message}

Existing preferences:
{existing}

Only extract choices the user would want remembered across tasks (tooling,
style, infrastructure, communication). Confidence: "explicit" when stated
outright, "inferred" when strongly implied, "assumed" otherwise. Return ONLY
JSON matching this schema:
{contract}"#,
            context = input.context,
            agent_message = input.agent_message,
            user_message = input.user_message,
            existing = if existing.is_empty() {
                "(none)"
            } else {
                existing.as_str()
            },
            contract = contract,
        )
    }

    /// Parse an extraction reply (tolerating prose and fences) and upsert
    /// each preference. Returns how many were stored.
    pub async fn parse_and_store_extraction(
        &self,
        agent_id: &str,
        reply: &str,
        source: &str,
    ) -> usize {
        let Some(extraction) = lenient_from_str::<ExtractionReply>(reply) else {
            warn!(agent_id = %agent_id, "Preference extraction reply had no usable JSON");
            return 0;
        };
        let mut stored = 0;
        for pref in extraction.preferences {
            match self
                .add_preference(
                    agent_id,
                    pref.category,
                    pref.key,
                    pref.value,
                    source,
                    pref.confidence,
                )
                .await
            {
                Ok(true) => stored += 1,
                Ok(false) => {}
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Failed to store preference"),
            }
        }
        stored
    }

    pub async fn increment_usage(&self, agent_id: &str, key: &str) {
        self.ensure_loaded(agent_id).await;
        let bumped = {
            let mut prefs = self.prefs.write();
            match prefs.get_mut(agent_id).and_then(|m| m.get_mut(key)) {
                Some(pref) => {
                    pref.used_count += 1;
                    pref.last_used_at = Some(Utc::now());
                    true
                }
                None => false,
            }
        };
        if bumped {
            self.persist(agent_id).await;
        }
    }

    async fn persist(&self, agent_id: &str) {
        let prefs: Vec<AgentPreference> = self
            .prefs
            .read()
            .get(agent_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        if let Err(e) = self.store.save_preferences(agent_id, &prefs).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to persist preferences");
        }
    }
}

/// All `[Used preference: KEY]` markers in a worker's output.
pub fn scan_usage_markers(text: &str) -> Vec<String> {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    let regex = MARKER
        .get_or_init(|| Regex::new(r"\[Used preference: ([^\]]+)\]").expect("valid marker regex"));
    regex
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .collect()
}
