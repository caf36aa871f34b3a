use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

// ---------------------------------------------------------------------------
// ContentBlock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One entry of a conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Provider hint that this message is worth caching.
    #[serde(default)]
    pub cache_mark: bool,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// Assistant message carrying exactly one tool-use block.
    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                args,
            }]),
            tool_call_id: None,
            cache_mark: false,
        }
    }

    /// User message answering the tool-use block with the same id.
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        let tool_use_id = tool_use_id.into();
        Self {
            role: Role::User,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: content.into(),
                is_error,
            }]),
            tool_call_id: Some(tool_use_id),
            cache_mark: false,
        }
    }

    fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            tool_call_id: None,
            cache_mark: false,
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => &[],
        }
    }

    /// Concatenated text of the message, ignoring tool blocks.
    pub fn text_content(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Mark the last `window` messages cache-eligible and clear the rest.
pub fn apply_cache_window(messages: &mut [Message], window: usize) {
    let first_marked = messages.len().saturating_sub(window);
    for (i, msg) in messages.iter_mut().enumerate() {
        msg.cache_mark = i >= first_marked;
    }
}

// ---------------------------------------------------------------------------
// ToolSpec
// ---------------------------------------------------------------------------

/// Schema-described tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cache_window_marks_only_tail() {
        let mut msgs: Vec<Message> = (0..5).map(|i| Message::user(format!("m{i}"))).collect();
        msgs[0].cache_mark = true;
        apply_cache_window(&mut msgs, 3);
        let marks: Vec<bool> = msgs.iter().map(|m| m.cache_mark).collect();
        assert_eq!(marks, vec![false, false, true, true, true]);
    }

    #[test]
    fn cache_window_larger_than_transcript() {
        let mut msgs = vec![Message::user("only")];
        apply_cache_window(&mut msgs, 3);
        assert!(msgs[0].cache_mark);
    }

    #[test]
    fn tool_result_carries_id() {
        let m = Message::tool_result("toolu_1", "ok", false);
        assert_eq!(m.role, Role::User);
        assert_eq!(m.tool_call_id.as_deref(), Some("toolu_1"));
        assert!(matches!(
            &m.blocks()[0],
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "toolu_1"
        ));
    }

    #[test]
    fn text_content_skips_tool_blocks() {
        let m = Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![
                ContentBlock::Text { text: "a".into() },
                ContentBlock::ToolUse {
                    id: "1".into(),
                    name: "x".into(),
                    args: json!({}),
                },
                ContentBlock::Text { text: "b".into() },
            ]),
            tool_call_id: None,
            cache_mark: false,
        };
        assert_eq!(m.text_content(), "ab");
    }

    #[test]
    fn content_block_serde_tag() {
        let b = ContentBlock::ToolUse {
            id: "t".into(),
            name: "ls".into(),
            args: json!({"path": "."}),
        };
        let v = serde_json::to_value(&b).unwrap();
        assert_eq!(v["type"], "tool_use");
    }
}
