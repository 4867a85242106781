//! Request/response interface to a no-tool LLM.
//!
//! The oracle never invokes tools; it plans, evaluates, and answers. Calls
//! are fallible by value: a failed completion comes back as an `OracleReply`
//! with an error set, never as a panic.

mod client;
pub mod parse;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

pub use client::{CliOracle, OracleConfig};

use crate::error::{FarmError, Result};

/// Outcome of a completion. `error` is set when the subprocess failed or
/// produced nothing; `content` may still carry partial text.
#[derive(Debug, Clone, Default)]
pub struct OracleReply {
    pub content: String,
    pub error: Option<String>,
}

impl OracleReply {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

#[async_trait]
pub trait Oracle: Send + Sync {
    /// One prompt in, one completion out.
    async fn complete(&self, system_prompt: Option<&str>, prompt: &str) -> OracleReply;
}

/// Complete and parse the reply into `T` through the lenient extractor.
pub async fn complete_structured<T>(
    oracle: &dyn Oracle,
    system_prompt: Option<&str>,
    prompt: &str,
) -> Result<T>
where
    T: DeserializeOwned,
{
    let reply = oracle.complete(system_prompt, prompt).await;
    if let Some(error) = reply.error {
        return Err(FarmError::Oracle(error));
    }
    parse::lenient_from_str(&reply.content)
        .ok_or_else(|| FarmError::Parse(format!("no usable JSON in oracle reply: {}", crate::utils::clip(&reply.content, 200))))
}

/// Render the JSON contract for `T`, for embedding into prompts so the
/// oracle knows the exact shape to produce.
pub fn response_contract<T: JsonSchema>() -> String {
    let schema = schemars::gen::SchemaGenerator::default().into_root_schema_for::<T>();
    serde_json::to_string(&schema).unwrap_or_default()
}
