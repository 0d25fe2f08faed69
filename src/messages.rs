/// Conversation message model.
///
/// A message is either plain text or an ordered sequence of content blocks.
/// Tool pairing invariant: every `tool_result` block must reference a
/// `tool_use` id that appears earlier in the conversation. Compaction can
/// orphan results (the matching `tool_use` gets summarised away), so
/// serialization always runs the orphan filter first — providers that
/// require strict pairing reject conversations that violate it.
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ── Roles and blocks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        media_type: String,
        data: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: MessageContent::Text(text.into()) }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Text(text.into()) }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Blocks(blocks) }
    }

    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self { role: Role::Tool, content: MessageContent::Blocks(blocks) }
    }

    /// Concatenated textual content — text blocks and tool result bodies.
    /// Tool inputs and images are skipped.
    pub fn text_content(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => {
                let mut out = String::new();
                for b in blocks {
                    match b {
                        ContentBlock::Text { text } => out.push_str(text),
                        ContentBlock::ToolResult { content, .. } => out.push_str(content),
                        _ => {}
                    }
                }
                out
            }
        }
    }

    /// Apply `f` to every textual segment in place.
    pub fn map_text(&mut self, f: &dyn Fn(&str) -> String) {
        match &mut self.content {
            MessageContent::Text(t) => *t = f(t),
            MessageContent::Blocks(blocks) => {
                for b in blocks.iter_mut() {
                    match b {
                        ContentBlock::Text { text } => *text = f(text),
                        ContentBlock::ToolResult { content, .. } => *content = f(content),
                        _ => {}
                    }
                }
            }
        }
    }
}

// ── Tool pairing ──────────────────────────────────────────────────────────────

/// Drop every `tool_result` block whose `tool_use_id` has no matching
/// `tool_use` earlier in the sequence. Messages left with no blocks are
/// removed entirely.
pub fn filter_orphaned_tool_results(messages: &[Message]) -> Vec<Message> {
    let mut seen_ids: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());

    for msg in messages {
        match &msg.content {
            MessageContent::Text(_) => out.push(msg.clone()),
            MessageContent::Blocks(blocks) => {
                let mut kept: Vec<ContentBlock> = Vec::with_capacity(blocks.len());
                for b in blocks {
                    match b {
                        ContentBlock::ToolUse { id, .. } => {
                            seen_ids.insert(id.as_str());
                            kept.push(b.clone());
                        }
                        ContentBlock::ToolResult { tool_use_id, .. } => {
                            if seen_ids.contains(tool_use_id.as_str()) {
                                kept.push(b.clone());
                            }
                        }
                        _ => kept.push(b.clone()),
                    }
                }
                if !kept.is_empty() {
                    out.push(Message { role: msg.role, content: MessageContent::Blocks(kept) });
                }
            }
        }
    }
    out
}

// ── Provider serialization (OpenAI-compatible wire shape) ─────────────────────

/// Build the messages array for an OpenAI-compatible chat endpoint.
/// Assistant `tool_use` blocks become the `tool_calls` array; `tool_result`
/// blocks flatten to individual role="tool" messages. The orphan filter
/// runs first so a freshly-compacted history is always serializable.
pub fn serialize_for_provider(system: &str, messages: &[Message]) -> Vec<Value> {
    let messages = filter_orphaned_tool_results(messages);
    let mut out = Vec::new();

    if !system.is_empty() {
        out.push(json!({ "role": "system", "content": system }));
    }

    for msg in &messages {
        match &msg.content {
            MessageContent::Text(text) => {
                out.push(json!({ "role": msg.role.as_str(), "content": text }));
            }
            MessageContent::Blocks(blocks) => {
                let mut text = String::new();
                let mut tool_calls: Vec<Value> = Vec::new();
                let mut image_parts: Vec<Value> = Vec::new();

                for b in blocks {
                    match b {
                        ContentBlock::Text { text: t } => text.push_str(t),
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_calls.push(json!({
                                "id": id,
                                "type": "function",
                                "function": {
                                    "name": name,
                                    "arguments": input.to_string(),
                                }
                            }));
                        }
                        ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                            let content = if *is_error {
                                format!("[error] {content}")
                            } else {
                                content.clone()
                            };
                            out.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content,
                            }));
                        }
                        ContentBlock::Image { media_type, data } => {
                            image_parts.push(json!({
                                "type": "image_url",
                                "image_url": { "url": format!("data:{media_type};base64,{data}") }
                            }));
                        }
                    }
                }

                if !image_parts.is_empty() {
                    let mut parts = vec![json!({ "type": "text", "text": text })];
                    parts.extend(image_parts);
                    out.push(json!({ "role": msg.role.as_str(), "content": parts }));
                } else if !tool_calls.is_empty() {
                    out.push(json!({
                        "role": msg.role.as_str(),
                        "content": text,
                        "tool_calls": tool_calls,
                    }));
                } else if !text.is_empty() {
                    out.push(json!({ "role": msg.role.as_str(), "content": text }));
                }
            }
        }
    }

    out
}
