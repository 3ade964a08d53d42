//! Language-model transport interface: a live model backend is an
//! external collaborator out of this core's scope — only the trait
//! boundary belongs here. [`StubLlmClient`] is the reference
//! implementation shipped for tests and for driving the CLI without a
//! live API key, the same pairing of trait and in-memory double used
//! elsewhere in this codebase (e.g. the session store's test helpers).

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::model::ConversationMessage;
use crate::tool::ToolSpec;

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub system_prompt: String,
    pub messages: Vec<ConversationMessage>,
    pub tools: Vec<ToolSpec>,
    pub model_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolUseRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, Default)]
pub struct TurnResponse {
    pub text: Option<String>,
    pub tool_uses: Vec<ToolUseRequest>,
}

/// One LLM request/response round. Real transports (Anthropic,
/// OpenAI-compatible, local model servers) implement this outside the
/// core; the engine only depends on the trait.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: TurnRequest) -> Result<TurnResponse>;
}

/// Deterministic stand-in used by tests and non-interactive CLI runs:
/// auto-selects the sole transition tool when exactly one is offered,
/// otherwise returns plain text and no tool uses (ending the turn
/// loop).
#[derive(Debug, Default)]
pub struct StubLlmClient;

#[async_trait]
impl LlmClient for StubLlmClient {
    async fn complete(&self, request: TurnRequest) -> Result<TurnResponse> {
        let transition_tools: Vec<&ToolSpec> = request
            .tools
            .iter()
            .filter(|t| t.name.starts_with("transition_to_"))
            .collect();

        if request.tools.len() == 1 {
            let tool = &request.tools[0];
            return Ok(TurnResponse {
                text: None,
                tool_uses: vec![ToolUseRequest {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: tool.name.clone(),
                    args: Value::Object(Default::default()),
                }],
            });
        }

        if let Some(tool) = transition_tools.first() {
            return Ok(TurnResponse {
                text: Some("stub transcript: no live model configured".to_string()),
                tool_uses: vec![ToolUseRequest {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: tool.name.clone(),
                    args: Value::Object(Default::default()),
                }],
            });
        }

        Ok(TurnResponse {
            text: Some("stub transcript: no live model configured".to_string()),
            tool_uses: Vec::new(),
        })
    }
}

pub fn transport_error(node: &str, error: impl std::fmt::Display) -> EngineError {
    EngineError::AgentTransport {
        node: node.to_string(),
        error: error.to_string(),
    }
}
