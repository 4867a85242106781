//! Scripted oracle for testing the orchestration loop without LLM calls.
//! Responses are keyed by a substring of the prompt; sequential scenarios
//! cycle through their entries.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use workfarm::oracle::{Oracle, OracleReply};

#[derive(Debug, Clone)]
pub enum Scenario {
    Static(String),
    Sequential(Vec<String>),
    Failure(String),
}

#[derive(Default)]
pub struct FakeOracle {
    responses: RwLock<Vec<(String, Scenario)>>,
    counts: RwLock<HashMap<String, usize>>,
}

impl FakeOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, key: &str, scenario: Scenario) {
        self.responses.write().push((key.to_string(), scenario));
        self.counts.write().insert(key.to_string(), 0);
    }

    pub fn on_static(&self, key: &str, response: impl Into<String>) {
        self.on(key, Scenario::Static(response.into()));
    }

    pub fn on_sequence(&self, key: &str, responses: Vec<&str>) {
        self.on(
            key,
            Scenario::Sequential(responses.into_iter().map(String::from).collect()),
        );
    }

    pub fn call_count(&self, key: &str) -> usize {
        self.counts.read().get(key).copied().unwrap_or(0)
    }

    pub fn assert_called(&self, key: &str, times: usize) {
        let count = self.call_count(key);
        assert_eq!(
            count, times,
            "expected '{}' to be called {} times, was {}",
            key, times, count
        );
    }
}

#[async_trait]
impl Oracle for FakeOracle {
    async fn complete(&self, _system_prompt: Option<&str>, prompt: &str) -> OracleReply {
        let matched: Option<(String, Scenario)> = {
            let responses = self.responses.read();
            responses
                .iter()
                .find(|(key, _)| prompt.contains(key.as_str()))
                .cloned()
        };

        let Some((key, scenario)) = matched else {
            return OracleReply::ok("OK");
        };

        let count = {
            let mut counts = self.counts.write();
            let entry = counts.entry(key).or_insert(0);
            let current = *entry;
            *entry += 1;
            current
        };

        match scenario {
            Scenario::Static(response) => OracleReply::ok(response),
            Scenario::Sequential(responses) => {
                let idx = count % responses.len();
                OracleReply::ok(responses[idx].clone())
            }
            Scenario::Failure(error) => OracleReply::failed(error),
        }
    }
}
