//! Request adapter: Anthropic Messages bodies into OpenAI Responses API or
//! Chat Completions requests.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::format::anthropic::{ContentBlock, ImageSource, ToolResultContent};
use crate::format::openai::{
    ChatFunctionCall, ChatFunctionDef, ChatMessage, ChatRequest, ChatToolCall, ChatToolDef,
    InputContent, InputItem, ReasoningConfig, ResponsesRequest, ResponsesTool, StreamOptions,
};
use crate::router;
use serde_json::Value;
use tracing::debug;

/// Service identity sent as `prompt_cache_key` so the downstream KV cache can
/// group this proxy's traffic.
const SERVICE_NAME: &str = "amux";

/// OpenAI rejects output budgets under 16 tokens.
const MIN_OUTPUT_TOKENS: u64 = 16;

// ---------------------------------------------------------------------------
// Responses API (`openai` adapter)
// ---------------------------------------------------------------------------

/// Build an OpenAI Responses API request from a filtered, patched Anthropic
/// body.
///
/// Prior-turn thinking blocks that carry an extracted reasoning id or
/// encrypted payload are re-emitted as reasoning input items (encrypted
/// content preferred over the id); thinking blocks without either degrade to
/// visible `<think>` text. The provider's built-in web_search tool is always
/// appended to the outbound tool list.
pub fn build_responses_request(
    config: &Config,
    body: &Value,
    model: &str,
) -> Result<ResponsesRequest> {
    let mut input: Vec<InputItem> = Vec::new();

    for message in body_messages(body) {
        let role = message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("user")
            .to_ascii_lowercase();
        let Some(content) = message.get("content") else {
            continue;
        };

        let mut parts: Vec<InputContent> = Vec::new();

        match content {
            Value::String(text) => {
                parts.push(text_part(&role, text.clone()));
            }
            Value::Array(blocks) => {
                for block in blocks {
                    match parse_block(block)? {
                        ParsedBlock::Text(text) => parts.push(text_part(&role, text)),
                        ParsedBlock::Image(url) => {
                            parts.push(InputContent::InputImage { image_url: url });
                        }
                        ParsedBlock::ToolUse { id, name, input: args } => {
                            flush_message(&role, &mut parts, &mut input);
                            input.push(InputItem::FunctionCall {
                                call_id: id,
                                name,
                                arguments: serde_json::to_string(&args)?,
                            });
                        }
                        ParsedBlock::ToolResult { tool_use_id, output } => {
                            flush_message(&role, &mut parts, &mut input);
                            input.push(InputItem::FunctionCallOutput {
                                call_id: tool_use_id,
                                output,
                            });
                        }
                        ParsedBlock::Thinking {
                            thinking,
                            rs_id,
                            encrypted_content,
                        } => {
                            if encrypted_content.is_some() {
                                flush_message(&role, &mut parts, &mut input);
                                input.push(InputItem::Reasoning {
                                    id: None,
                                    encrypted_content,
                                });
                            } else if rs_id.is_some() {
                                flush_message(&role, &mut parts, &mut input);
                                input.push(InputItem::Reasoning {
                                    id: rs_id,
                                    encrypted_content: None,
                                });
                            } else if !thinking.is_empty() {
                                parts.push(text_part(
                                    &role,
                                    format!("<think>\n{}\n</think>", thinking),
                                ));
                            }
                        }
                    }
                }
            }
            other => {
                parts.push(text_part(&role, other.to_string()));
            }
        }

        flush_message(&role, &mut parts, &mut input);
    }

    let mut tools: Vec<ResponsesTool> = Vec::new();
    if let Some(body_tools) = body.get("tools").and_then(Value::as_array) {
        for tool in body_tools {
            tools.push(ResponsesTool {
                kind: "function".to_string(),
                name: Some(required_tool_name(tool)?),
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .map(String::from),
                parameters: tool.get("input_schema").cloned(),
            });
        }
    }
    // First-party search stays available even after policy stripping.
    tools.push(ResponsesTool::web_search());

    let effort = body
        .get("reasoning")
        .and_then(|r| r.get("effort"))
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| router::reasoning_effort(config, body));
    let summary = (effort != "minimal").then(|| "auto".to_string());

    Ok(ResponsesRequest {
        model: model.to_string(),
        input,
        stream: is_streaming(body),
        instructions: system_instructions(body),
        tools,
        temperature: body.get("temperature").and_then(Value::as_f64),
        top_p: body.get("top_p").and_then(Value::as_f64),
        max_output_tokens: body
            .get("max_tokens")
            .and_then(Value::as_u64)
            .map(|t| t.max(MIN_OUTPUT_TOKENS)),
        reasoning: Some(ReasoningConfig { effort, summary }),
        include: vec!["reasoning.encrypted_content".to_string()],
        store: false,
        prompt_cache_key: Some(SERVICE_NAME.to_string()),
    })
}

// ---------------------------------------------------------------------------
// Chat Completions (`openai-compatible` adapter)
// ---------------------------------------------------------------------------

/// Build a Chat Completions request. Content blocks flatten into plain
/// `{role, content}` messages; reasoning references are not emitted on this
/// path — only thinking from turns after the last real user message is
/// carried forward as visible `<think>` text.
pub fn build_chat_request(_config: &Config, body: &Value, model: &str) -> Result<ChatRequest> {
    let messages_in = body_messages(body);
    let last_user = last_real_user_index(messages_in);

    let mut messages: Vec<ChatMessage> = Vec::new();

    if let Some(instructions) = system_instructions(body) {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: Some(instructions),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for (i, message) in messages_in.iter().enumerate() {
        let role = message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("user")
            .to_ascii_lowercase();
        let Some(content) = message.get("content") else {
            continue;
        };

        let mut text_parts: Vec<String> = Vec::new();
        let mut tool_calls: Vec<ChatToolCall> = Vec::new();

        match content {
            Value::String(text) => text_parts.push(text.clone()),
            Value::Array(blocks) => {
                for block in blocks {
                    match parse_block(block)? {
                        ParsedBlock::Text(text) => text_parts.push(text),
                        ParsedBlock::Image(_) => {
                            debug!("dropping image block on chat-completions path");
                        }
                        ParsedBlock::ToolUse { id, name, input: args } => {
                            if role == "assistant" {
                                tool_calls.push(ChatToolCall {
                                    id,
                                    call_type: "function".to_string(),
                                    function: ChatFunctionCall {
                                        name,
                                        arguments: serde_json::to_string(&args)?,
                                    },
                                });
                            }
                        }
                        ParsedBlock::ToolResult { tool_use_id, output } => {
                            messages.push(ChatMessage {
                                role: "tool".to_string(),
                                content: Some(output),
                                tool_calls: None,
                                tool_call_id: Some(tool_use_id),
                            });
                        }
                        ParsedBlock::Thinking { thinking, .. } => {
                            let past_last_user = last_user.is_none_or(|idx| i > idx);
                            if !thinking.is_empty() && past_last_user {
                                text_parts
                                    .push(format!("\n<think>\n{}\n</think>\n", thinking));
                            }
                        }
                    }
                }
            }
            other => text_parts.push(other.to_string()),
        }

        let content = if text_parts.is_empty() {
            None
        } else {
            Some(text_parts.concat())
        };

        if content.is_some() || !tool_calls.is_empty() {
            messages.push(ChatMessage {
                role,
                content,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
            });
        }
    }

    let tools = body.get("tools").and_then(Value::as_array).map(|body_tools| {
        body_tools
            .iter()
            .map(|tool| {
                Ok(ChatToolDef {
                    kind: "function".to_string(),
                    function: ChatFunctionDef {
                        name: required_tool_name(tool)?,
                        description: tool
                            .get("description")
                            .and_then(Value::as_str)
                            .map(String::from),
                        parameters: tool
                            .get("input_schema")
                            .cloned()
                            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
                    },
                })
            })
            .collect::<Result<Vec<_>>>()
    });
    let tools = match tools {
        Some(result) => Some(result?),
        None => None,
    };

    let stream = is_streaming(body);

    Ok(ChatRequest {
        model: model.to_string(),
        messages,
        stream,
        temperature: body.get("temperature").and_then(Value::as_f64),
        top_p: body.get("top_p").and_then(Value::as_f64),
        max_tokens: body
            .get("max_tokens")
            .and_then(Value::as_u64)
            .map(|t| t.max(MIN_OUTPUT_TOKENS)),
        stop: body.get("stop_sequences").and_then(Value::as_array).map(|seqs| {
            seqs.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        }),
        tools,
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
    })
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

enum ParsedBlock {
    Text(String),
    Image(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        output: String,
    },
    Thinking {
        thinking: String,
        rs_id: Option<String>,
        encrypted_content: Option<String>,
    },
}

fn parse_block(block: &Value) -> Result<ParsedBlock> {
    if let Value::String(text) = block {
        return Ok(ParsedBlock::Text(text.clone()));
    }

    let typed: ContentBlock = serde_json::from_value(block.clone()).map_err(|e| {
        let kind = block
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("<missing>");
        Error::InvalidRequest(format!("unsupported content block '{}': {}", kind, e))
    })?;

    Ok(match typed {
        ContentBlock::Text { text } => ParsedBlock::Text(text),
        ContentBlock::Image { source } => ParsedBlock::Image(image_url(&source)),
        ContentBlock::ToolUse { id, name, input } => ParsedBlock::ToolUse { id, name, input },
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } => ParsedBlock::ToolResult {
            tool_use_id,
            output: tool_result_output(&content),
        },
        ContentBlock::Thinking {
            thinking,
            extracted_openai_rs_id,
            extracted_openai_rs_encrypted_content,
            ..
        } => ParsedBlock::Thinking {
            thinking,
            rs_id: extracted_openai_rs_id,
            encrypted_content: extracted_openai_rs_encrypted_content,
        },
    })
}

fn body_messages(body: &Value) -> &[Value] {
    body.get("messages")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn is_streaming(body: &Value) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

fn text_part(role: &str, text: String) -> InputContent {
    if role == "assistant" {
        InputContent::OutputText { text }
    } else {
        InputContent::InputText { text }
    }
}

fn flush_message(role: &str, parts: &mut Vec<InputContent>, input: &mut Vec<InputItem>) {
    if parts.is_empty() {
        return;
    }
    input.push(InputItem::Message {
        role: role.to_string(),
        content: std::mem::take(parts),
    });
}

fn required_tool_name(tool: &Value) -> Result<String> {
    tool.get("name")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| Error::InvalidRequest("tool definition missing 'name'".to_string()))
}

/// Join the top-level system prompt into one instruction string.
fn system_instructions(body: &Value) -> Option<String> {
    match body.get("system")? {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => {
            let parts: Vec<String> = blocks
                .iter()
                .map(|block| match block {
                    Value::String(s) => s.clone(),
                    Value::Object(obj) => obj
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    other => other.to_string(),
                })
                .collect();
            Some(parts.join("\n"))
        }
        other => Some(other.to_string()),
    }
}

fn image_url(source: &ImageSource) -> String {
    if source.source_type == "url" {
        return source.url.clone().unwrap_or_default();
    }
    let media_type = source.media_type.as_deref().unwrap_or("image/jpeg");
    match &source.data {
        Some(data) if !data.is_empty() => format!("data:{};base64,{}", media_type, data),
        _ => String::new(),
    }
}

fn tool_result_output(content: &ToolResultContent) -> String {
    match content {
        ToolResultContent::Text(text) => text.clone(),
        ToolResultContent::Blocks(blocks) => {
            serde_json::to_string(blocks).unwrap_or_default()
        }
        ToolResultContent::Other(value) => value.to_string(),
    }
}

/// Index of the last user message that is not merely a tool-result carrier.
fn last_real_user_index(messages: &[Value]) -> Option<usize> {
    messages.iter().enumerate().rev().find_map(|(i, message)| {
        if message.get("role").and_then(Value::as_str) != Some("user") {
            return None;
        }
        let content = message.get("content")?;
        let only_tool_results = content
            .as_array()
            .is_some_and(|blocks| {
                !blocks.is_empty()
                    && blocks.iter().all(|b| {
                        b.get("type").and_then(Value::as_str) == Some("tool_result")
                    })
            });
        if only_tool_results { None } else { Some(i) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    fn config() -> Config {
        Config::parse("{}", Path::new("test.yaml")).unwrap()
    }

    #[test]
    fn test_simple_message_expansion() {
        let body = json!({
            "model": "claude-3",
            "system": "Be terse.",
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": [{"type": "text", "text": "hi"}]}
            ],
            "max_tokens": 4096
        });
        let request = build_responses_request(&config(), &body, "gpt-5").unwrap();

        assert_eq!(request.model, "gpt-5");
        assert_eq!(request.instructions.as_deref(), Some("Be terse."));
        assert_eq!(request.max_output_tokens, Some(4096));
        assert!(!request.stream);
        assert_eq!(request.include, vec!["reasoning.encrypted_content"]);
        assert!(!request.store);

        assert_eq!(
            request.input,
            vec![
                InputItem::Message {
                    role: "user".into(),
                    content: vec![InputContent::InputText {
                        text: "hello".into()
                    }],
                },
                InputItem::Message {
                    role: "assistant".into(),
                    content: vec![InputContent::OutputText { text: "hi".into() }],
                },
            ]
        );
    }

    #[test]
    fn test_tool_use_and_result_items() {
        let body = json!({
            "model": "claude-3",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "call_1", "name": "get_weather",
                     "input": {"city": "Oslo"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "call_1", "content": "rainy"}
                ]}
            ]
        });
        let request = build_responses_request(&config(), &body, "gpt-5").unwrap();

        assert_eq!(
            request.input[1],
            InputItem::Message {
                role: "assistant".into(),
                content: vec![InputContent::OutputText {
                    text: "checking".into()
                }],
            }
        );
        assert_eq!(
            request.input[2],
            InputItem::FunctionCall {
                call_id: "call_1".into(),
                name: "get_weather".into(),
                arguments: r#"{"city":"Oslo"}"#.into(),
            }
        );
        assert_eq!(
            request.input[3],
            InputItem::FunctionCallOutput {
                call_id: "call_1".into(),
                output: "rainy".into(),
            }
        );
    }

    #[test]
    fn test_reasoning_reference_prefers_encrypted_content() {
        let body = json!({
            "model": "claude-3",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "",
                     "extracted_openai_rs_id": "rs_OLD",
                     "extracted_openai_rs_encrypted_content": "ENC_NEW"},
                    {"type": "tool_use", "id": "call_1", "name": "doit", "input": {"x": 1}}
                ]}
            ]
        });
        let request = build_responses_request(&config(), &body, "o4-mini").unwrap();

        assert_eq!(
            request.input[1],
            InputItem::Reasoning {
                id: None,
                encrypted_content: Some("ENC_NEW".into()),
            }
        );
    }

    #[test]
    fn test_reasoning_reference_id_only() {
        let body = json!({
            "model": "claude-3",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "chain",
                     "extracted_openai_rs_id": "rs_abc"}
                ]}
            ]
        });
        let request = build_responses_request(&config(), &body, "o4-mini").unwrap();
        assert_eq!(
            request.input[1],
            InputItem::Reasoning {
                id: Some("rs_abc".into()),
                encrypted_content: None,
            }
        );
    }

    #[test]
    fn test_plain_thinking_degrades_to_think_text() {
        let body = json!({
            "model": "claude-3",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "hidden chain"},
                    {"type": "text", "text": "answer"}
                ]}
            ]
        });
        let request = build_responses_request(&config(), &body, "gpt-5").unwrap();
        assert_eq!(
            request.input[0],
            InputItem::Message {
                role: "assistant".into(),
                content: vec![
                    InputContent::OutputText {
                        text: "<think>\nhidden chain\n</think>".into()
                    },
                    InputContent::OutputText {
                        text: "answer".into()
                    },
                ],
            }
        );
    }

    #[test]
    fn test_web_search_always_appended() {
        let body = json!({
            "model": "claude-3",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "Bash", "input_schema": {"type": "object"}}]
        });
        let request = build_responses_request(&config(), &body, "gpt-5").unwrap();
        assert_eq!(request.tools.len(), 2);
        assert_eq!(request.tools[0].name.as_deref(), Some("Bash"));
        assert_eq!(request.tools[1], ResponsesTool::web_search());

        // Appended even with no inbound tools at all.
        let body = json!({"model": "claude-3", "messages": []});
        let request = build_responses_request(&config(), &body, "gpt-5").unwrap();
        assert_eq!(request.tools, vec![ResponsesTool::web_search()]);
    }

    #[test]
    fn test_effort_mapping_from_budget() {
        let body = json!({
            "model": "claude-3",
            "messages": [],
            "thinking": {"type": "enabled", "budget_tokens": 9000}
        });
        let request = build_responses_request(&config(), &body, "gpt-5").unwrap();
        let reasoning = request.reasoning.unwrap();
        assert_eq!(reasoning.effort, "medium");
        assert_eq!(reasoning.summary.as_deref(), Some("auto"));
    }

    #[test]
    fn test_patched_effort_wins_over_budget() {
        let body = json!({
            "model": "claude-3",
            "messages": [],
            "thinking": {"type": "enabled", "budget_tokens": 50000},
            "reasoning": {"effort": "low"}
        });
        let request = build_responses_request(&config(), &body, "gpt-5").unwrap();
        assert_eq!(request.reasoning.unwrap().effort, "low");
    }

    #[test]
    fn test_minimal_effort_has_no_summary() {
        let body = json!({"model": "claude-3", "messages": []});
        let request = build_responses_request(&config(), &body, "gpt-5").unwrap();
        let reasoning = request.reasoning.unwrap();
        assert_eq!(reasoning.effort, "minimal");
        assert!(reasoning.summary.is_none());
    }

    #[test]
    fn test_max_tokens_floor() {
        let body = json!({"model": "claude-3", "messages": [], "max_tokens": 1});
        let request = build_responses_request(&config(), &body, "gpt-5").unwrap();
        assert_eq!(request.max_output_tokens, Some(16));
    }

    #[test]
    fn test_unknown_block_type_is_invalid_request() {
        let body = json!({
            "model": "claude-3",
            "messages": [
                {"role": "user", "content": [{"type": "hologram", "data": "x"}]}
            ]
        });
        let err = build_responses_request(&config(), &body, "gpt-5").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_malformed_tool_use_is_invalid_request() {
        let body = json!({
            "model": "claude-3",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "call_1", "name": "doit"}
                ]}
            ]
        });
        let err = build_responses_request(&config(), &body, "gpt-5").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_chat_request_flattening() {
        let body = json!({
            "model": "claude-3",
            "system": [{"type": "text", "text": "Be nice."}],
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": "hi"}]},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "call_1", "name": "doit", "input": {"x": 1}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "call_1", "content": "ok"}
                ]}
            ],
            "stop_sequences": ["END"],
            "max_tokens": 2048
        });
        let request = build_chat_request(&config(), &body, "qwen-3").unwrap();

        assert_eq!(request.model, "qwen-3");
        assert_eq!(request.messages.len(), 4);
        assert_eq!(request.messages[0].role, "system");
        assert_eq!(request.messages[0].content.as_deref(), Some("Be nice."));
        assert_eq!(request.messages[1].role, "user");
        assert_eq!(request.messages[1].content.as_deref(), Some("hi"));

        let assistant = &request.messages[2];
        assert_eq!(assistant.role, "assistant");
        assert!(assistant.content.is_none());
        let calls = assistant.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "doit");

        let tool = &request.messages[3];
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool.content.as_deref(), Some("ok"));

        assert_eq!(request.stop, Some(vec!["END".to_string()]));
        assert_eq!(request.max_tokens, Some(2048));
    }

    #[test]
    fn test_chat_request_carries_only_final_turn_thinking() {
        let body = json!({
            "model": "claude-3",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "old reasoning"},
                    {"type": "text", "text": "one"}
                ]},
                {"role": "user", "content": "second"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "fresh reasoning"},
                    {"type": "text", "text": "two"}
                ]}
            ]
        });
        let request = build_chat_request(&config(), &body, "qwen-3").unwrap();

        let first_assistant = &request.messages[1];
        assert_eq!(first_assistant.content.as_deref(), Some("one"));

        let last_assistant = &request.messages[3];
        let content = last_assistant.content.as_deref().unwrap();
        assert!(content.contains("<think>\nfresh reasoning\n</think>"));
        assert!(content.contains("two"));
    }

    #[test]
    fn test_chat_request_no_reasoning_references() {
        let body = json!({
            "model": "claude-3",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "", "extracted_openai_rs_id": "rs_x"}
                ]}
            ]
        });
        let request = build_chat_request(&config(), &body, "qwen-3").unwrap();
        // Empty thinking with only an rs id produces nothing on this path.
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn test_chat_streaming_requests_usage() {
        let body = json!({"model": "claude-3", "messages": [], "stream": true});
        let request = build_chat_request(&config(), &body, "qwen-3").unwrap();
        assert!(request.stream);
        assert!(request.stream_options.is_some());
    }

    #[test]
    fn test_image_block_becomes_input_image() {
        let body = json!({
            "model": "claude-3",
            "messages": [
                {"role": "user", "content": [
                    {"type": "image", "source": {
                        "type": "base64", "media_type": "image/png", "data": "QUJD"
                    }}
                ]}
            ]
        });
        let request = build_responses_request(&config(), &body, "gpt-5").unwrap();
        assert_eq!(
            request.input[0],
            InputItem::Message {
                role: "user".into(),
                content: vec![InputContent::InputImage {
                    image_url: "data:image/png;base64,QUJD".into()
                }],
            }
        );
    }
}
