//! 内置 prompt
//!
//! 所有 prompt 都要求模型输出单个 JSON 对象，解析逻辑见 `extraction`。

pub const FACT_EXTRACTION_PROMPT: &str = r#"You are a personal information organizer. Read the conversation and extract the distinct facts worth remembering about the user: preferences, personal details, plans, relationships, habits and opinions.

Rules:
- Write each fact as a short standalone sentence.
- Keep the language of the conversation (Chinese input gives Chinese facts).
- Ignore greetings, small talk and anything the assistant said about itself.
- If nothing is worth remembering, return an empty list.

Return only a JSON object of the form {"facts": ["fact 1", "fact 2"]}."#;

pub const UPDATE_MEMORY_PROMPT: &str = r#"You manage a memory store. Compare newly retrieved facts with the existing memories and decide, for every memory, one of four events:
- ADD: the fact is new information. Use a new id.
- UPDATE: the fact refines or corrects an existing memory. Keep the existing id, give the new text and put the previous text in "old_memory".
- DELETE: the fact contradicts an existing memory so it must be removed. Keep the existing id.
- NONE: the existing memory is unchanged.

Only use ids that appear in the existing memories, except for ADD."#;

pub const UPDATE_MEMORY_OUTPUT: &str = r#"Return only a JSON object of the form:
{"memory": [{"id": "0", "text": "...", "event": "ADD|UPDATE|DELETE|NONE", "old_memory": "..."}]}"#;

pub const PROCEDURAL_MEMORY_PROMPT: &str = r#"You are summarizing the execution history of an AI agent. Produce a concise, chronological, numbered record of every step the agent took: the action, its key inputs and the observed result. Keep concrete values such as URLs, file names and numbers. Do not add commentary. Return the summary as plain text."#;

pub const GRAPH_EXTRACTION_PROMPT: &str = r#"You build a knowledge graph from text. Extract entities and the relationships between them.

Rules:
- When the text refers to the speaker ("I", "me", "我"), use USER_ID as the entity name.
- Relationship labels are short, lowercase and use underscores, e.g. likes, lives_in, works_at.
- Keep entity names exactly as written.
- Skip relationships that are not stated in the text.

Return only a JSON object of the form {"relations": [{"source": "...", "relationship": "...", "destination": "..."}]}."#;

pub const QUERY_ENTITIES_PROMPT: &str = r#"Identify the entities mentioned in the search query. When the query refers to the speaker ("I", "me", "我"), return USER_ID. Return only a JSON object of the form {"entities": ["entity 1", "entity 2"]}."#;

/// 组装合并 prompt：指令 + 现有记忆 + 新事实 + 输出格式
pub fn update_memory_prompt(
    instructions: &str,
    existing_json: &str,
    facts_json: &str,
) -> String {
    format!(
        "{instructions}\n\nExisting memories:\n{existing_json}\n\nNew facts:\n{facts_json}\n\n{UPDATE_MEMORY_OUTPUT}"
    )
}

/// 把 USER_ID 占位符替换成实际的作用域标识
pub fn with_user(prompt: &str, user: &str) -> String {
    prompt.replace("USER_ID", user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_memory_prompt_contains_inputs() {
        let prompt = update_memory_prompt(UPDATE_MEMORY_PROMPT, "[]", "[\"苹果很甜\"]");
        assert!(prompt.contains("苹果很甜"));
        assert!(prompt.ends_with(UPDATE_MEMORY_OUTPUT));
    }

    #[test]
    fn test_with_user() {
        assert!(with_user(GRAPH_EXTRACTION_PROMPT, "user_001").contains("use user_001 as"));
    }
}
