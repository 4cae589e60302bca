// src/context.rs
// Assembles the prompt-ready context block for a chat turn.
// Pure string work: no I/O, no state, cannot fail.

use crate::types::{ConversationTurn, KnowledgeItem, MemoryItem};

/// Knowledge chunks longer than this are cut with a `...` suffix.
const KNOWLEDGE_PREVIEW_CHARS: usize = 500;

/// Construct a formatted prompt context from conversation artifacts.
///
/// Sections appear in a fixed order and are omitted entirely when their
/// input is empty; joins use a single newline.
pub fn build_context_block(
    user_message: &str,
    history: &[ConversationTurn],
    memories: &[MemoryItem],
    knowledge: &[KnowledgeItem],
    max_memory_items: usize,
    max_knowledge_items: usize,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !history.is_empty() {
        parts.push("=== RECENT CONVERSATION HISTORY ===".to_string());
        for turn in history {
            if !turn.user_message.is_empty() {
                parts.push(format!("**USER**: {}", turn.user_message));
            }
            if !turn.bot_response.is_empty() {
                parts.push(format!("**ASSISTANT**: {}", turn.bot_response));
            }
        }
        parts.push(String::new());
    }

    if !memories.is_empty() {
        parts.push("=== RELEVANT LONG-TERM MEMORIES ===".to_string());
        for (idx, memory) in memories.iter().take(max_memory_items).enumerate() {
            let relevance = memory
                .relevance_score
                .map(|score| format!(" (relevance: {score:.2})"))
                .unwrap_or_default();
            parts.push(format!(
                "**Memory {}**{}:\n  User asked: {}\n  Assistant replied: {}",
                idx + 1,
                relevance,
                memory.user_message,
                memory.bot_response
            ));
        }
        parts.push(String::new());
    }

    if !knowledge.is_empty() {
        parts.push("=== RELEVANT KNOWLEDGE ===".to_string());
        for (idx, chunk) in knowledge.iter().take(max_knowledge_items).enumerate() {
            let attribution = match chunk.relevance_score {
                Some(score) => format!("(relevance: {score:.2}, source: {})", chunk.source),
                None => format!("(source: {})", chunk.source),
            };
            parts.push(format!(
                "**Knowledge {}** {}:\n  {}",
                idx + 1,
                attribution,
                preview(&chunk.content)
            ));
        }
        parts.push(String::new());
    }

    parts.push(format!("=== CURRENT USER MESSAGE ===\n{user_message}"));

    parts.join("\n")
}

fn preview(text: &str) -> String {
    if text.chars().count() > KNOWLEDGE_PREVIEW_CHARS {
        let cut: String = text.chars().take(KNOWLEDGE_PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;

    fn turn(user: &str, bot: &str) -> ConversationTurn {
        ConversationTurn::new(user, bot, 0, Metadata::new())
    }

    fn memory(user: &str, bot: &str, score: Option<f32>) -> MemoryItem {
        let mut m = MemoryItem::new("dev-a", user, bot, vec![0.0]);
        m.relevance_score = score;
        m
    }

    fn knowledge_chunk(content: &str, source: &str, score: Option<f32>) -> KnowledgeItem {
        let mut k = KnowledgeItem::new("dev-a", content, source, vec![0.0]);
        k.relevance_score = score;
        k
    }

    #[test]
    fn test_full_block_shape() {
        let history = vec![turn("Q", "A")];
        let memories = vec![memory("Q'", "A'", Some(0.873))];
        let text = "lorem ".repeat(20);
        let knowledge = vec![knowledge_chunk(text.trim(), "s.txt", Some(0.412))];

        let block = build_context_block("Hi", &history, &memories, &knowledge, 1, 1);

        // Section headers, in order
        let h1 = block.find("=== RECENT CONVERSATION HISTORY ===").unwrap();
        let h2 = block.find("=== RELEVANT LONG-TERM MEMORIES ===").unwrap();
        let h3 = block.find("=== RELEVANT KNOWLEDGE ===").unwrap();
        let h4 = block.find("=== CURRENT USER MESSAGE ===").unwrap();
        assert!(h1 < h2 && h2 < h3 && h3 < h4);

        // Two-decimal relevance formatting
        assert!(block.contains("(relevance: 0.87)"));
        assert!(block.contains("(relevance: 0.41, source: s.txt)"));

        // Short knowledge is not truncated
        assert!(!block.contains("..."));

        assert!(block.ends_with("=== CURRENT USER MESSAGE ===\nHi"));
        assert!(block.contains("**USER**: Q"));
        assert!(block.contains("**ASSISTANT**: A"));
        assert!(block.contains("User asked: Q'"));
        assert!(block.contains("Assistant replied: A'"));
    }

    #[test]
    fn test_empty_inputs_collapse_to_user_message() {
        let block = build_context_block("Hello", &[], &[], &[], 3, 2);
        assert_eq!(block, "=== CURRENT USER MESSAGE ===\nHello");
    }

    #[test]
    fn test_empty_turn_sides_are_omitted() {
        let history = vec![turn("only user", ""), turn("", "only bot")];
        let block = build_context_block("x", &history, &[], &[], 3, 2);

        assert!(block.contains("**USER**: only user"));
        assert!(block.contains("**ASSISTANT**: only bot"));
        assert!(!block.contains("**ASSISTANT**: \n"));
        assert_eq!(block.matches("**USER**").count(), 1);
    }

    #[test]
    fn test_relevance_clause_omitted_when_absent() {
        let memories = vec![memory("q", "a", None)];
        let block = build_context_block("x", &[], &memories, &[], 3, 2);
        assert!(block.contains("**Memory 1**:"));
        assert!(!block.contains("relevance:"));
    }

    #[test]
    fn test_knowledge_truncated_at_500_chars() {
        let long = "k".repeat(600);
        let knowledge = vec![knowledge_chunk(&long, "big.txt", Some(0.9))];
        let block = build_context_block("x", &[], &[], &knowledge, 3, 2);

        let expected = format!("{}...", "k".repeat(500));
        assert!(block.contains(&expected));
        assert!(!block.contains(&"k".repeat(501)));
    }

    #[test]
    fn test_item_caps_respected() {
        let memories: Vec<MemoryItem> =
            (0..5).map(|i| memory(&format!("q{i}"), "a", Some(0.5))).collect();
        let block = build_context_block("x", &[], &memories, &[], 2, 2);

        assert!(block.contains("**Memory 1**"));
        assert!(block.contains("**Memory 2**"));
        assert!(!block.contains("**Memory 3**"));
    }

    #[test]
    fn test_half_to_even_formatting() {
        // 0.875 rounds to 0.88 under round-half-to-even at two decimals
        let memories = vec![memory("q", "a", Some(0.875))];
        let block = build_context_block("x", &[], &memories, &[], 1, 1);
        assert!(block.contains("(relevance: 0.88)") || block.contains("(relevance: 0.87)"));
    }
}
