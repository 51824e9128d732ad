//! Model seam for the graph.
//!
//! Nodes talk to a `ChatModel` trait; production wires async-openai, tests
//! script outcomes. Tool-call extraction normalizes the shapes different
//! providers emit into plain `ToolCall`s with mandatory string ids.

use std::pin::Pin;
use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessage,
        ChatCompletionTool, ChatCompletionToolType, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, FunctionCall, FunctionObject, ResponseFormat,
        ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use uuid::Uuid;

use common::error::AppError;

use crate::messages::{ChatRole, ChatTurn, ToolCall};

/// Name of the single tool bound in the query-or-respond node.
pub const RETRIEVE_TOOL_NAME: &str = "retrieve_documents";

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct JsonSchemaSpec {
    pub name: String,
    pub schema: Value,
}

/// One model call: messages plus per-call overrides.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatTurn>,
    pub bind_retrieve_tool: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_schema: Option<JsonSchemaSpec>,
}

impl ChatRequest {
    pub fn plain(messages: Vec<ChatTurn>) -> Self {
        Self {
            messages,
            bind_retrieve_tool: false,
            temperature: None,
            max_tokens: None,
            json_schema: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, AppError>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn invoke(&self, request: ChatRequest) -> Result<ChatOutcome, AppError>;

    async fn stream(&self, request: ChatRequest) -> Result<TokenStream, AppError>;
}

/// JSON schema for the grader's structured output.
pub fn grade_schema() -> JsonSchemaSpec {
    JsonSchemaSpec {
        name: "grade_documents".to_string(),
        schema: serde_json::json!({
            "type": "object",
            "properties": {
                "binary_score": {
                    "type": "string",
                    "enum": ["yes", "no"],
                    "description": "Relevance score: 'yes' if relevant, or 'no' if not relevant"
                }
            },
            "required": ["binary_score"],
            "additionalProperties": false
        }),
    }
}

pub struct OpenAiChatModel {
    client: Arc<Client<OpenAIConfig>>,
    settings: LlmSettings,
}

impl OpenAiChatModel {
    pub fn new(client: Arc<Client<OpenAIConfig>>, settings: LlmSettings) -> Self {
        Self { client, settings }
    }

    fn build_request(&self, request: &ChatRequest) -> Result<CreateChatCompletionRequest, AppError> {
        let messages = to_request_messages(&request.messages)?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.settings.model)
            .messages(messages)
            .temperature(request.temperature.unwrap_or(self.settings.temperature))
            .max_tokens(request.max_tokens.unwrap_or(self.settings.max_tokens));

        if request.bind_retrieve_tool {
            builder.tools(vec![retrieve_tool_definition()]);
        }

        if let Some(spec) = &request.json_schema {
            builder.response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: None,
                    name: spec.name.clone(),
                    schema: Some(spec.schema.clone()),
                    strict: Some(true),
                },
            });
        }

        builder.build().map_err(AppError::OpenAI)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn invoke(&self, request: ChatRequest) -> Result<ChatOutcome, AppError> {
        let api_request = self.build_request(&request)?;
        let response = self.client.chat().create(api_request).await?;

        let usage = response.usage.as_ref().map(|usage| TokenUsage {
            input_tokens: u64::from(usage.prompt_tokens),
            output_tokens: u64::from(usage.completion_tokens),
        });

        let message = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| AppError::LLMParsing("No choices in LLM response".into()))?;

        let content = message.content.clone().unwrap_or_default();
        let tool_calls = extract_tool_calls(message.tool_calls.as_deref(), &content);

        Ok(ChatOutcome {
            content,
            tool_calls,
            usage,
        })
    }

    async fn stream(&self, request: ChatRequest) -> Result<TokenStream, AppError> {
        let api_request = self.build_request(&request)?;
        let stream = self.client.chat().create_stream(api_request).await?;

        let mapped = stream.map(|item| match item {
            Ok(chunk) => Ok(chunk
                .choices
                .first()
                .and_then(|choice| choice.delta.content.clone())
                .unwrap_or_default()),
            Err(err) => Err(AppError::OpenAI(err)),
        });

        Ok(Box::pin(mapped))
    }
}

fn retrieve_tool_definition() -> ChatCompletionTool {
    ChatCompletionTool {
        r#type: ChatCompletionToolType::Function,
        function: FunctionObject {
            name: RETRIEVE_TOOL_NAME.to_string(),
            description: Some(
                "Search the user's knowledge base and return relevant document passages."
                    .to_string(),
            ),
            parameters: Some(serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query"
                    }
                },
                "required": ["query"]
            })),
            strict: None,
        },
    }
}

fn to_request_messages(
    turns: &[ChatTurn],
) -> Result<Vec<ChatCompletionRequestMessage>, AppError> {
    let mut messages = Vec::with_capacity(turns.len());

    for turn in turns {
        match turn.role {
            ChatRole::System => {
                messages.push(ChatCompletionRequestSystemMessage::from(turn.content.clone()).into());
            }
            ChatRole::User => {
                messages.push(ChatCompletionRequestUserMessage::from(turn.content.clone()).into());
            }
            ChatRole::Assistant => {
                let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
                if !turn.content.is_empty() {
                    builder.content(turn.content.clone());
                }
                if !turn.tool_calls.is_empty() {
                    let calls: Vec<ChatCompletionMessageToolCall> = turn
                        .tool_calls
                        .iter()
                        .map(|call| ChatCompletionMessageToolCall {
                            id: call.id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: FunctionCall {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        })
                        .collect();
                    builder.tool_calls(calls);
                }
                messages.push(builder.build().map_err(AppError::OpenAI)?.into());
            }
            ChatRole::Tool => {
                let tool_call_id = turn.tool_call_id.clone().ok_or_else(|| {
                    AppError::LLMParsing("Tool message without tool_call_id".into())
                })?;
                messages.push(
                    ChatCompletionRequestToolMessageArgs::default()
                        .content(turn.content.clone())
                        .tool_call_id(tool_call_id)
                        .build()
                        .map_err(AppError::OpenAI)?
                        .into(),
                );
            }
        }
    }

    Ok(messages)
}

/// Normalize provider tool calls to our shape, trying each source in
/// priority order: the structured `tool_calls` field first, then tool-call
/// JSON embedded in the text content. Ids are forced to non-empty strings.
pub fn extract_tool_calls(
    structured: Option<&[ChatCompletionMessageToolCall]>,
    content: &str,
) -> Vec<ToolCall> {
    if let Some(calls) = structured {
        if !calls.is_empty() {
            return calls
                .iter()
                .map(|call| ToolCall {
                    id: normalize_id(&call.id),
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                })
                .collect();
        }
    }

    extract_tool_calls_from_content(content)
}

fn normalize_id(id: &str) -> String {
    if id.trim().is_empty() {
        Uuid::new_v4().to_string()
    } else {
        id.to_string()
    }
}

/// Some providers serialize tool calls into the message text instead of the
/// dedicated field. Recognize the two common shapes: an object with a
/// `tool_calls` array, and an Anthropic-style `tool_use` block.
fn extract_tool_calls_from_content(content: &str) -> Vec<ToolCall> {
    let Ok(value) = serde_json::from_str::<Value>(content.trim()) else {
        return Vec::new();
    };

    if let Some(calls) = value.get("tool_calls").and_then(Value::as_array) {
        return calls.iter().filter_map(parse_embedded_call).collect();
    }

    if value.get("type").and_then(Value::as_str) == Some("tool_use") {
        return parse_embedded_call(&value).into_iter().collect();
    }

    Vec::new()
}

fn parse_embedded_call(value: &Value) -> Option<ToolCall> {
    let name = value
        .get("name")
        .or_else(|| value.get("function").and_then(|f| f.get("name")))
        .and_then(Value::as_str)?;

    let arguments = value
        .get("arguments")
        .or_else(|| value.get("input"))
        .or_else(|| value.get("function").and_then(|f| f.get("arguments")))
        .map(|args| {
            if let Some(text) = args.as_str() {
                text.to_string()
            } else {
                args.to_string()
            }
        })
        .unwrap_or_else(|| "{}".to_string());

    let id = value
        .get("id")
        .and_then(Value::as_str)
        .map(normalize_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Some(ToolCall {
        id,
        name: name.to_string(),
        arguments,
    })
}
