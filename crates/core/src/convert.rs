//! Convert stored messages into the frontend's ChatItem shape.
//!
//! The store keeps raw conversation turns (tool_use/tool_result blocks);
//! the UI wants a flat list of chat items where tool results are folded
//! into the assistant message that requested them.

use serde_json::{json, Value};

use gp_domain::tool::{ContentBlock, Message, MessageContent, Role};

/// Convert a stored message log into a ChatItem list.
pub fn messages_to_chat_items(messages: &[Message]) -> Vec<Value> {
    let mut items: Vec<Value> = Vec::new();
    let mut current_agent: Option<Value> = None;
    let mut counter = 0u64;

    let mut next_id = move || {
        counter += 1;
        format!("m{counter}")
    };

    for msg in messages {
        match (&msg.role, &msg.content) {
            (Role::User, MessageContent::Text(text)) => {
                if let Some(agent) = current_agent.take() {
                    items.push(json!({ "kind": "message", "data": agent }));
                }
                items.push(json!({
                    "kind": "message",
                    "data": {
                        "id": next_id(),
                        "role": "user",
                        "content": text,
                        "toolCalls": [],
                        "blocks": [{ "kind": "text", "text": text }],
                    }
                }));
            }
            (Role::User, MessageContent::Blocks(blocks)) => {
                // Tool-result carrier — attach results to the pending agent item.
                if let Some(agent) = current_agent.as_mut() {
                    attach_tool_results(agent, blocks);
                }
            }
            (Role::Assistant, content) => {
                if let Some(agent) = current_agent.take() {
                    items.push(json!({ "kind": "message", "data": agent }));
                }
                current_agent = Some(make_agent_message(content, &mut next_id));
            }
        }
    }

    if let Some(agent) = current_agent {
        items.push(json!({ "kind": "message", "data": agent }));
    }

    items
}

fn make_agent_message(content: &MessageContent, next_id: &mut impl FnMut() -> String) -> Value {
    let mut blocks: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut text_parts: Vec<&str> = Vec::new();

    match content {
        MessageContent::Text(text) => {
            blocks.push(json!({ "kind": "text", "text": text }));
            text_parts.push(text);
        }
        MessageContent::Blocks(content_blocks) => {
            for block in content_blocks {
                match block {
                    ContentBlock::Text { text } => {
                        blocks.push(json!({ "kind": "text", "text": text }));
                        text_parts.push(text);
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        let display = input
                            .get("action")
                            .and_then(|v| v.as_str())
                            .unwrap_or(name.as_str());
                        let tc = json!({
                            "id": id,
                            "name": display,
                            "status": "completed",
                        });
                        tool_calls.push(tc.clone());
                        blocks.push(json!({ "kind": "tool", "tool": tc }));
                    }
                    ContentBlock::ToolResult { .. } => {}
                }
            }
        }
    }

    json!({
        "id": next_id(),
        "role": "agent",
        "content": text_parts.join("\n"),
        "toolCalls": tool_calls,
        "blocks": blocks,
    })
}

fn attach_tool_results(agent: &mut Value, blocks: &[ContentBlock]) {
    for block in blocks {
        let ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } = block
        else {
            continue;
        };
        let preview: String = content.chars().take(500).collect();

        for list_key in ["toolCalls", "blocks"] {
            let Some(entries) = agent.get_mut(list_key).and_then(|v| v.as_array_mut()) else {
                continue;
            };
            for entry in entries {
                let tc = if list_key == "blocks" {
                    let Some(tool) = entry.get_mut("tool") else {
                        continue;
                    };
                    tool
                } else {
                    entry
                };
                if tc.get("id").and_then(|v| v.as_str()) != Some(tool_use_id.as_str()) {
                    continue;
                }
                tc["result"] = Value::String(preview.clone());
                if *is_error {
                    tc["status"] = Value::String("failed".into());
                    tc["error"] = Value::String(preview.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn simple_exchange_converts() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        let items = messages_to_chat_items(&messages);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["data"]["role"], "user");
        assert_eq!(items[1]["data"]["role"], "agent");
        assert_eq!(items[1]["data"]["content"], "hello");
    }

    #[test]
    fn tool_results_fold_into_agent_item() {
        let messages = vec![
            Message::user("list models"),
            Message {
                role: Role::Assistant,
                content: MessageContent::Blocks(vec![
                    ContentBlock::Text {
                        text: "checking".into(),
                    },
                    ContentBlock::ToolUse {
                        id: "t1".into(),
                        name: "graph_monitor".into(),
                        input: json!({"action": "list_models"}),
                    },
                ]),
            },
            Message::tool_results(vec![ContentBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: "sdxl.safetensors".into(),
                is_error: false,
            }]),
            Message::assistant("You have sdxl."),
        ];

        let items = messages_to_chat_items(&messages);
        assert_eq!(items.len(), 3);

        let agent = &items[1]["data"];
        // Display name comes from the action field.
        assert_eq!(agent["toolCalls"][0]["name"], "list_models");
        assert_eq!(agent["toolCalls"][0]["result"], "sdxl.safetensors");
        assert_eq!(agent["toolCalls"][0]["status"], "completed");
        // Mirrored on the block view.
        assert_eq!(agent["blocks"][1]["tool"]["result"], "sdxl.safetensors");
    }

    #[test]
    fn failed_results_mark_status() {
        let messages = vec![
            Message {
                role: Role::Assistant,
                content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "web_search".into(),
                    input: json!({"query": "x"}),
                }]),
            },
            Message::tool_results(vec![ContentBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: "Search failed: offline".into(),
                is_error: true,
            }]),
        ];
        let items = messages_to_chat_items(&messages);
        let tc = &items[0]["data"]["toolCalls"][0];
        assert_eq!(tc["status"], "failed");
        assert_eq!(tc["error"], "Search failed: offline");
    }

    #[test]
    fn orphan_carrier_is_skipped() {
        let messages = vec![Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: "x".into(),
            is_error: false,
        }])];
        assert!(messages_to_chat_items(&messages).is_empty());
    }
}
