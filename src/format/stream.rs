//! Streaming translation: downstream OpenAI event streams into Anthropic SSE
//! event sequences.
//!
//! `StreamState` is the per-stream correlator. All block lifecycle events go
//! through its transition methods, which is what keeps the output grammar
//! balanced: every `content_block_delta` references the currently open index,
//! at most one block is open at a time, and indices increase from 0. The
//! encrypted reasoning payload rides only on `content_block_start` — SSE
//! aggregators are known to drop unknown keys from deltas.

use crate::error::Error;
use crate::format::anthropic::{
    ContentBlock, ContentDelta, ErrorData, MessageDeltaData, MessageDeltaUsage, MessageStart,
    StopReason, StreamEvent, Usage, generate_message_id,
};
use crate::format::openai::{
    ChatChunk, OutputItem, ResponsesStreamFrame, extract_custom_fields,
};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
enum OpenBlock {
    None,
    Text,
    Thinking,
    ToolUse { call_id: String },
}

/// Per-stream correlator state.
pub struct StreamState {
    model: String,
    message_id: String,
    message_started: bool,
    next_index: u32,
    open_index: u32,
    open: OpenBlock,
    input_tokens: u64,
    output_tokens: u64,
    stop_reason: Option<StopReason>,
    finished: bool,
}

impl StreamState {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            message_id: generate_message_id(),
            message_started: false,
            next_index: 0,
            open_index: 0,
            open: OpenBlock::None,
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: None,
            finished: false,
        }
    }

    fn ensure_message_start(&mut self, events: &mut Vec<StreamEvent>) {
        if self.message_started {
            return;
        }
        self.message_started = true;
        events.push(StreamEvent::MessageStart {
            message: Box::new(MessageStart {
                id: self.message_id.clone(),
                message_type: "message".to_string(),
                role: "assistant".to_string(),
                content: vec![],
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage {
                    input_tokens: self.input_tokens,
                    output_tokens: 0,
                },
            }),
        });
    }

    fn close_open(&mut self, events: &mut Vec<StreamEvent>) {
        if self.open == OpenBlock::None {
            return;
        }
        events.push(StreamEvent::ContentBlockStop {
            index: self.open_index,
        });
        self.open = OpenBlock::None;
    }

    fn open_block(&mut self, block: ContentBlock, open: OpenBlock, events: &mut Vec<StreamEvent>) {
        self.ensure_message_start(events);
        self.close_open(events);
        self.open_index = self.next_index;
        self.next_index += 1;
        self.open = open;
        events.push(StreamEvent::ContentBlockStart {
            index: self.open_index,
            content_block: block,
        });
    }

    fn ensure_text(&mut self, events: &mut Vec<StreamEvent>) {
        if self.open != OpenBlock::Text {
            self.open_block(
                ContentBlock::text(String::new()),
                OpenBlock::Text,
                events,
            );
        }
    }

    fn ensure_thinking(
        &mut self,
        rs_id: Option<String>,
        encrypted_content: Option<String>,
        events: &mut Vec<StreamEvent>,
    ) {
        if self.open != OpenBlock::Thinking {
            self.open_block(
                ContentBlock::Thinking {
                    thinking: String::new(),
                    signature: None,
                    extracted_openai_rs_id: rs_id,
                    extracted_openai_rs_encrypted_content: encrypted_content,
                },
                OpenBlock::Thinking,
                events,
            );
        }
    }

    fn open_tool_use(&mut self, call_id: String, name: String, events: &mut Vec<StreamEvent>) {
        self.stop_reason = Some(StopReason::ToolUse);
        self.open_block(
            ContentBlock::ToolUse {
                id: call_id.clone(),
                name,
                input: Value::Object(serde_json::Map::new()),
            },
            OpenBlock::ToolUse { call_id },
            events,
        );
    }

    fn text_delta(&mut self, text: String, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        self.ensure_text(events);
        events.push(StreamEvent::ContentBlockDelta {
            index: self.open_index,
            delta: ContentDelta::Text { text },
        });
    }

    fn thinking_delta(&mut self, thinking: String, events: &mut Vec<StreamEvent>) {
        if thinking.is_empty() {
            return;
        }
        self.ensure_thinking(None, None, events);
        events.push(StreamEvent::ContentBlockDelta {
            index: self.open_index,
            delta: ContentDelta::Thinking { thinking },
        });
    }

    fn tool_arguments_delta(&mut self, partial_json: String, events: &mut Vec<StreamEvent>) {
        if partial_json.is_empty() {
            return;
        }
        if !matches!(self.open, OpenBlock::ToolUse { .. }) {
            warn!("dropping tool argument delta with no open tool_use block");
            return;
        }
        events.push(StreamEvent::ContentBlockDelta {
            index: self.open_index,
            delta: ContentDelta::InputJson { partial_json },
        });
    }

    /// Close the stream normally: any open block, then `message_delta` with
    /// the final stop reason and cumulative usage, then `message_stop`.
    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return vec![];
        }
        self.finished = true;

        let mut events = Vec::new();
        self.ensure_message_start(&mut events);
        self.close_open(&mut events);
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaData {
                stop_reason: Some(self.stop_reason.unwrap_or(StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: MessageDeltaUsage {
                output_tokens: self.output_tokens,
            },
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    /// Close the stream after a mid-stream failure: close the open block,
    /// terminate the envelope with `end_turn`, then surface the error and
    /// `message_stop` so clients land in a consistent state.
    fn fail(&mut self, error: &Error) -> Vec<StreamEvent> {
        if self.finished {
            return vec![];
        }
        self.finished = true;

        let mut events = Vec::new();
        self.ensure_message_start(&mut events);
        self.close_open(&mut events);
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaData {
                stop_reason: Some(StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: MessageDeltaUsage {
                output_tokens: self.output_tokens,
            },
        });
        events.push(StreamEvent::Error {
            error: ErrorData {
                error_type: error.kind().to_string(),
                message: error.to_string(),
            },
        });
        events.push(StreamEvent::MessageStop);
        events
    }
}

/// Incremental SSE framing: buffers raw bytes and yields complete `data:`
/// payloads (handling CRLF and LF event boundaries).
struct SseBuffer {
    buffer: String,
}

impl SseBuffer {
    fn new() -> Self {
        Self {
            buffer: String::with_capacity(4096),
        }
    }

    fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut payloads = Vec::new();
        loop {
            let boundary = self
                .buffer
                .find("\r\n\r\n")
                .map(|p| (p, 4))
                .or_else(|| self.buffer.find("\n\n").map(|p| (p, 2)));

            let Some((pos, skip)) = boundary else {
                break;
            };
            let event = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + skip);

            // An event may span several lines; only data lines matter here.
            let mut data = String::new();
            for line in event.lines() {
                let payload = line
                    .strip_prefix("data: ")
                    .or_else(|| line.strip_prefix("data:"));
                if let Some(payload) = payload {
                    data.push_str(payload.trim());
                }
            }
            if !data.is_empty() {
                payloads.push(data);
            }
        }
        payloads
    }
}

// ---------------------------------------------------------------------------
// Responses API feeder
// ---------------------------------------------------------------------------

/// Translates an OpenAI Responses API SSE stream into Anthropic events.
pub struct ResponsesStreamTranslator {
    buffer: SseBuffer,
    state: StreamState,
}

impl ResponsesStreamTranslator {
    pub fn new(model: &str) -> Self {
        Self {
            buffer: SseBuffer::new(),
            state: StreamState::new(model),
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for payload in self.buffer.feed(chunk) {
            if payload == "[DONE]" {
                events.extend(self.state.finish());
                continue;
            }
            let frame: ResponsesStreamFrame = match serde_json::from_str(&payload) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "skipping unparseable stream frame");
                    continue;
                }
            };
            self.handle_frame(&frame, &mut events);
        }
        events
    }

    fn handle_frame(&mut self, frame: &ResponsesStreamFrame, events: &mut Vec<StreamEvent>) {
        if self.state.finished {
            return;
        }
        self.state.ensure_message_start(events);

        match frame.kind.as_str() {
            "response.output_item.added" => {
                let Some(item) = frame.item.as_ref().and_then(|v| OutputItem::from_value(v))
                else {
                    return;
                };
                match item {
                    OutputItem::Reasoning {
                        id,
                        encrypted_content,
                        summary,
                    } => {
                        self.state.close_open(events);
                        self.state.ensure_thinking(id, encrypted_content, events);
                        for part in summary {
                            self.state.thinking_delta(part.text, events);
                        }
                    }
                    OutputItem::FunctionCall {
                        id,
                        call_id,
                        name,
                        arguments,
                    } => {
                        let call_id = call_id.or(id).unwrap_or_default();
                        self.state.open_tool_use(call_id, name, events);
                        self.state.tool_arguments_delta(arguments, events);
                    }
                    OutputItem::WebSearchCall { .. } => {
                        self.state.close_open(events);
                        self.state.ensure_thinking(None, None, events);
                        self.state
                            .thinking_delta("invoking web_search".to_string(), events);
                    }
                    OutputItem::Message { .. } => {}
                }
            }
            "response.reasoning_summary_text.delta" => {
                if let Some(text) = frame.delta.as_ref().and_then(Value::as_str) {
                    self.state.thinking_delta(text.to_string(), events);
                }
            }
            "response.output_text.delta" => {
                if let Some(text) = frame.delta.as_ref().and_then(Value::as_str) {
                    self.state.text_delta(text.to_string(), events);
                }
            }
            "response.function_call_arguments.delta" => {
                if let Some(args) = frame.delta.as_ref().and_then(Value::as_str) {
                    self.state.tool_arguments_delta(args.to_string(), events);
                }
            }
            "response.output_item.done" => {
                let item_kind = frame
                    .item
                    .as_ref()
                    .and_then(|i| i.get("type"))
                    .and_then(Value::as_str);
                let matches_open = matches!(
                    (item_kind, &self.state.open),
                    (Some("message"), OpenBlock::Text)
                        | (Some("reasoning"), OpenBlock::Thinking)
                        | (Some("web_search_call"), OpenBlock::Thinking)
                        | (Some("function_call"), OpenBlock::ToolUse { .. })
                );
                if item_kind == Some("web_search_call") {
                    self.state
                        .thinking_delta("\nweb_search completed".to_string(), events);
                }
                if matches_open {
                    self.state.close_open(events);
                }
            }
            "response.completed" => {
                if let Some(response) = &frame.response {
                    if let Some(usage) = &response.usage {
                        self.state.input_tokens = usage.input_tokens;
                        self.state.output_tokens = usage.output_tokens;
                    }
                    if self.state.stop_reason.is_none()
                        && response.status.as_deref() == Some("incomplete")
                        && response
                            .incomplete_details
                            .as_ref()
                            .and_then(|d| d.reason.as_deref())
                            == Some("max_output_tokens")
                    {
                        self.state.stop_reason = Some(StopReason::MaxTokens);
                    }
                }
                events.extend(self.state.finish());
            }
            "response.failed" | "error" => {
                let message = frame
                    .message
                    .clone()
                    .unwrap_or_else(|| "downstream stream failed".to_string());
                events.extend(self.state.fail(&Error::Api {
                    status: 502,
                    message,
                }));
            }
            _ => {}
        }
    }

    /// End of downstream bytes. A stream that never saw `response.completed`
    /// is closed out normally here.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        self.state.finish()
    }

    /// Mid-stream failure epilogue.
    pub fn fail(&mut self, error: &Error) -> Vec<StreamEvent> {
        self.state.fail(error)
    }
}

// ---------------------------------------------------------------------------
// Chat Completions feeder
// ---------------------------------------------------------------------------

/// Translates a Chat Completions chunk stream into Anthropic events,
/// including custom-field deltas (`reasoning_content` etc.) surfaced as
/// thinking blocks.
pub struct ChatStreamTranslator {
    buffer: SseBuffer,
    state: StreamState,
    /// chunk tool index -> downstream call id
    tool_calls: HashMap<u32, String>,
}

impl ChatStreamTranslator {
    pub fn new(model: &str) -> Self {
        Self {
            buffer: SseBuffer::new(),
            state: StreamState::new(model),
            tool_calls: HashMap::new(),
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for payload in self.buffer.feed(chunk) {
            if payload == "[DONE]" {
                events.extend(self.state.finish());
                continue;
            }
            let parsed: ChatChunk = match serde_json::from_str(&payload) {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(error = %e, "skipping unparseable chat chunk");
                    continue;
                }
            };
            self.handle_chunk(&parsed, &mut events);
        }
        events
    }

    fn handle_chunk(&mut self, chunk: &ChatChunk, events: &mut Vec<StreamEvent>) {
        if self.state.finished {
            return;
        }
        self.state.ensure_message_start(events);

        if let Some(usage) = &chunk.usage {
            self.state.input_tokens = usage.prompt_tokens;
            self.state.output_tokens = usage.completion_tokens;
        }

        let Some(choice) = chunk.choices.first() else {
            return;
        };

        for (block_type, text) in extract_custom_fields(&choice.delta.extra) {
            match block_type {
                "thinking" => self.state.thinking_delta(text, events),
                _ => self.state.text_delta(text, events),
            }
        }

        if let Some(text) = &choice.delta.content
            && !text.is_empty()
        {
            self.state.text_delta(text.clone(), events);
        }

        if let Some(tool_chunks) = &choice.delta.tool_calls {
            for tool_chunk in tool_chunks {
                let chunk_index = tool_chunk.index.unwrap_or(0);
                let name = tool_chunk
                    .function
                    .as_ref()
                    .and_then(|f| f.name.clone());

                let already_open = matches!(
                    &self.state.open,
                    OpenBlock::ToolUse { call_id } if Some(call_id) == tool_chunk.id.as_ref()
                );
                if let Some(id) = &tool_chunk.id
                    && let Some(name) = name
                    && !already_open
                {
                    // First chunk of a call carries id + name.
                    self.tool_calls.insert(chunk_index, id.clone());
                    self.state.open_tool_use(id.clone(), name, events);
                } else if !self.tool_calls.contains_key(&chunk_index) {
                    warn!(chunk_index, "tool call chunk missing id/name metadata");
                    continue;
                }

                if let Some(arguments) = tool_chunk
                    .function
                    .as_ref()
                    .and_then(|f| f.arguments.clone())
                {
                    self.state.tool_arguments_delta(arguments, events);
                }
            }
        }

        if let Some(finish_reason) = &choice.finish_reason
            && self.state.stop_reason.is_none()
        {
            self.state.stop_reason =
                Some(crate::format::anthropic::map_finish_reason(Some(finish_reason)));
        }
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        self.state.finish()
    }

    pub fn fail(&mut self, error: &Error) -> Vec<StreamEvent> {
        self.state.fail(error)
    }
}

/// Render one event in Anthropic SSE framing.
pub fn format_sse_event(event: &StreamEvent) -> String {
    let event_type = match event {
        StreamEvent::MessageStart { .. } => "message_start",
        StreamEvent::ContentBlockStart { .. } => "content_block_start",
        StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
        StreamEvent::ContentBlockStop { .. } => "content_block_stop",
        StreamEvent::MessageDelta { .. } => "message_delta",
        StreamEvent::MessageStop => "message_stop",
        StreamEvent::Ping => "ping",
        StreamEvent::Error { .. } => "error",
    };
    let data = serde_json::to_string(event).unwrap_or_default();
    format!("event: {}\ndata: {}\n\n", event_type, data)
}
