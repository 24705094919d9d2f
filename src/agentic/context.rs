//! Context-window accounting for tool conversations.

use crate::provider::{ContentBlock, Message, ProviderRequest};

/// Messages older than the recent window and larger than this are summarized.
pub const COMPRESS_MIN_BYTES: usize = 256;

const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;
const GPT4_CONTEXT_WINDOW: u64 = 128_000;

/// Rough token count of a request: bytes/4 over prompt, system prompt,
/// messages and tool definitions, never below 10.
pub fn estimate_request_tokens(req: &ProviderRequest) -> u64 {
    let mut bytes = req.prompt.len() / 4 + req.system_prompt.len() / 4;
    for msg in &req.messages {
        bytes += msg.content_len() / 4;
    }
    for tool in &req.tools {
        let schema = tool.input_schema.to_string();
        bytes += (tool.name.len() + tool.description.len() + schema.len()) / 4;
    }
    (bytes as u64).max(10)
}

pub fn context_window_for_model(model: &str) -> u64 {
    let lower = model.to_lowercase();
    if lower.contains("gpt-4o") || lower.contains("gpt-4-turbo") {
        GPT4_CONTEXT_WINDOW
    } else {
        DEFAULT_CONTEXT_WINDOW
    }
}

/// Replace large messages outside the last `keep_recent` exchange pairs with
/// a one-line placeholder. Roles and message count are preserved.
///
/// Returns the number of messages compressed.
pub fn compress_messages(messages: &mut [Message], keep_recent: usize) -> usize {
    let keep = keep_recent * 2;
    if messages.len() <= keep {
        return 0;
    }
    let cutoff = messages.len() - keep;
    let mut compressed = 0;
    for msg in &mut messages[..cutoff] {
        let size = msg.content_len();
        if size <= COMPRESS_MIN_BYTES {
            continue;
        }
        msg.content = vec![ContentBlock::Text {
            text: format!("[prior tool exchange, {} bytes compressed]", size),
        }];
        compressed += 1;
    }
    compressed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Role, ToolDefinition};
    use serde_json::json;

    #[test]
    fn test_token_estimate() {
        let req = ProviderRequest::default();
        assert_eq!(estimate_request_tokens(&req), 10);

        let req = ProviderRequest {
            prompt: "p".repeat(400),
            system_prompt: "s".repeat(40),
            tools: vec![ToolDefinition {
                name: "read".to_string(),
                description: "d".repeat(96),
                input_schema: json!({}),
            }],
            ..Default::default()
        };
        // 100 + 10 + (4 + 96 + 2) / 4
        assert_eq!(estimate_request_tokens(&req), 135);

        let mut with_messages = req.clone();
        with_messages.messages.push(Message::user_text("x".repeat(1000)));
        assert!(estimate_request_tokens(&with_messages) > 135 + 250);
    }

    #[test]
    fn test_context_window() {
        assert_eq!(context_window_for_model("sonnet"), 200_000);
        assert_eq!(context_window_for_model("gpt-4o-mini"), 128_000);
        assert_eq!(context_window_for_model("GPT-4-Turbo"), 128_000);
    }

    #[test]
    fn test_compress_keeps_recent_pairs() {
        let big = "x".repeat(1000);
        let mut messages: Vec<Message> = (0..10)
            .map(|i| Message {
                role: if i % 2 == 0 { Role::Assistant } else { Role::User },
                content: vec![ContentBlock::Text { text: big.clone() }],
            })
            .collect();
        messages[1].content = vec![ContentBlock::Text { text: "small".to_string() }];

        let compressed = compress_messages(&mut messages, 3);
        assert_eq!(compressed, 3);
        assert_eq!(messages.len(), 10);
        assert_eq!(messages[0].role, Role::Assistant);
        match &messages[0].content[0] {
            ContentBlock::Text { text } => {
                assert!(text.starts_with("[prior tool exchange, "));
                assert!(text.ends_with(" bytes compressed]"));
            }
            other => panic!("unexpected block {:?}", other),
        }
        assert_eq!(messages[1].content, vec![ContentBlock::Text { text: "small".to_string() }]);
        for msg in &messages[4..] {
            assert_eq!(msg.content, vec![ContentBlock::Text { text: big.clone() }]);
        }

        let mut short = messages[..4].to_vec();
        assert_eq!(compress_messages(&mut short, 3), 0);
    }
}
