//! Response adapter: non-streaming OpenAI replies into Anthropic messages.

use crate::format::anthropic::{
    ContentBlock, MessagesResponse, StopReason, Usage, generate_message_id, map_finish_reason,
};
use crate::format::openai::{
    ChatResponse, OutputItem, ResponsesApiResponse, extract_custom_fields,
};
use serde_json::Value;
use tracing::debug;

/// Convert a Responses API reply into an Anthropic message.
///
/// Reasoning items become thinking blocks carrying the reasoning id and, when
/// present, the encrypted payload — never the plain `id`/`signature` fields,
/// which stay reserved for Anthropic's own opaques.
pub fn convert_responses_response(
    response: &ResponsesApiResponse,
    model: &str,
) -> MessagesResponse {
    let mut content: Vec<ContentBlock> = Vec::new();
    let mut saw_tool_use = false;

    for raw_item in &response.output {
        let Some(item) = OutputItem::from_value(raw_item) else {
            debug!(item = %raw_item, "skipping unmodeled output item");
            continue;
        };
        match item {
            OutputItem::Reasoning {
                id,
                encrypted_content,
                summary,
            } => {
                let thinking: String =
                    summary.iter().map(|part| part.text.as_str()).collect();
                if thinking.is_empty() && id.is_none() && encrypted_content.is_none() {
                    continue;
                }
                content.push(ContentBlock::Thinking {
                    thinking,
                    signature: None,
                    extracted_openai_rs_id: id,
                    extracted_openai_rs_encrypted_content: encrypted_content,
                });
            }
            OutputItem::Message { content: parts, .. } => {
                for part in parts {
                    if part.kind == "output_text" && !part.text.is_empty() {
                        content.push(ContentBlock::text(part.text));
                    }
                }
            }
            OutputItem::FunctionCall {
                id,
                call_id,
                name,
                arguments,
            } => {
                saw_tool_use = true;
                content.push(ContentBlock::ToolUse {
                    id: call_id.or(id).unwrap_or_default(),
                    name,
                    input: parse_arguments(&arguments),
                });
            }
            OutputItem::WebSearchCall { .. } => {
                content.push(ContentBlock::thinking("web_search has been performed."));
            }
        }
    }

    let stop_reason = if saw_tool_use {
        StopReason::ToolUse
    } else if response.status.as_deref() == Some("incomplete")
        && response
            .incomplete_details
            .as_ref()
            .and_then(|d| d.reason.as_deref())
            == Some("max_output_tokens")
    {
        StopReason::MaxTokens
    } else {
        StopReason::EndTurn
    };

    let usage = response
        .usage
        .as_ref()
        .map(|u| Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        })
        .unwrap_or_default();

    MessagesResponse {
        id: generate_message_id(),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: response.model.clone().unwrap_or_else(|| model.to_string()),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage,
    }
}

/// Convert a Chat Completions reply into an Anthropic message. Non-standard
/// message fields are scanned against the custom-field mapping and surfaced
/// as their mapped block type.
pub fn convert_chat_response(response: &ChatResponse, model: &str) -> MessagesResponse {
    let mut content: Vec<ContentBlock> = Vec::new();
    let mut finish_reason: Option<String> = None;
    let mut saw_tool_use = false;

    if let Some(choice) = response.choices.first() {
        finish_reason = choice.finish_reason.clone();

        for (block_type, text) in extract_custom_fields(&choice.message.extra) {
            match block_type {
                "thinking" => content.push(ContentBlock::thinking(text)),
                _ => content.push(ContentBlock::text(text)),
            }
        }

        if let Some(text) = &choice.message.content
            && !text.is_empty()
        {
            content.push(ContentBlock::text(text.clone()));
        }

        if let Some(tool_calls) = &choice.message.tool_calls {
            for call in tool_calls {
                saw_tool_use = true;
                content.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    input: parse_arguments(&call.function.arguments),
                });
            }
        }
    }

    let stop_reason = if saw_tool_use && finish_reason.is_none() {
        StopReason::ToolUse
    } else {
        map_finish_reason(finish_reason.as_deref())
    };

    let usage = response
        .usage
        .as_ref()
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    MessagesResponse {
        id: generate_message_id(),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: response.model.clone().unwrap_or_else(|| model.to_string()),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage,
    }
}

/// Tool arguments arrive as a JSON string; unparseable payloads are kept
/// verbatim under `raw_arguments` instead of being dropped.
fn parse_arguments(arguments: &str) -> Value {
    if arguments.is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(arguments)
        .unwrap_or_else(|_| serde_json::json!({"raw_arguments": arguments}))
}
