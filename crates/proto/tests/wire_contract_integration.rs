use proto::{
    Block, ChatEvent, Completion, Emotion, MemoryRecord, MemoryTier, Message, Role, Screenplay,
    StopReason, ToolResultBlock, ToolUseBlock,
};
use serde_json::json;

#[test]
fn memory_records_persist_with_type_key() {
    let record = MemoryRecord::new(MemoryTier::Mid, "User is planning a trip.");
    let value = serde_json::to_value(&record).expect("serialize record");
    assert_eq!(value["type"], "mid");
    assert_eq!(value["summary"], "User is planning a trip.");
    assert!(value["timestamp"].is_string());

    let stored = json!([
        {"type": "short", "summary": "likes tea", "timestamp": "2026-01-02T03:04:05Z"},
        {"type": "long", "summary": "lives in Oslo", "timestamp": "2025-12-30T00:00:00Z"}
    ]);
    let records: Vec<MemoryRecord> = serde_json::from_value(stored).expect("parse records");
    assert_eq!(records[0].tier, MemoryTier::Short);
    assert_eq!(records[1].summary, "lives in Oslo");
}

#[test]
fn transcript_messages_accept_missing_timestamp() {
    let message: Message =
        serde_json::from_value(json!({"role": "assistant", "content": "hi"})).expect("parse");
    assert_eq!(message.role, Role::Assistant);
    assert_eq!(message.timestamp, None);

    let value = serde_json::to_value(Message::user("hello")).expect("serialize");
    assert_eq!(value["role"], "user");
    assert_eq!(value["content"], "hello");
}

#[test]
fn completion_blocks_are_type_tagged() {
    let completion = Completion::new(vec![
        Block::Text {
            text: "One moment.".to_string(),
        },
        Block::ToolUse(ToolUseBlock {
            id: "call_1".to_string(),
            name: "weather".to_string(),
            input: json!({"city": "Oslo"}),
        }),
    ]);
    assert_eq!(completion.stop_reason, StopReason::ToolUse);

    let value = serde_json::to_value(&completion).expect("serialize completion");
    assert_eq!(value["blocks"][0]["type"], "text");
    assert_eq!(value["blocks"][1]["type"], "tool_use");
    assert_eq!(value["blocks"][1]["name"], "weather");
    assert_eq!(value["stop_reason"], "tool_use");

    let result = Block::ToolResult(ToolResultBlock {
        tool_use_id: "call_1".to_string(),
        content: "sunny".to_string(),
    });
    let value = serde_json::to_value(&result).expect("serialize result");
    assert_eq!(value["type"], "tool_result");
    assert_eq!(value["tool_use_id"], "call_1");
}

#[test]
fn finalized_event_carries_screenplay() {
    let event = ChatEvent::MessageFinalized {
        message: Message::assistant("[happy] Hi!"),
        screenplay: Screenplay {
            emotion: Emotion::Happy,
            text: "Hi!".to_string(),
        },
    };
    let value = serde_json::to_value(&event).expect("serialize event");
    assert_eq!(value["kind"], "message_finalized");
    assert_eq!(value["screenplay"]["emotion"], "happy");
    assert_eq!(value["message"]["content"], "[happy] Hi!");

    let parsed: ChatEvent = serde_json::from_value(value).expect("parse event");
    assert_eq!(parsed, event);
}
