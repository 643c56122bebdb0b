use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};

/// One message on the conversation channel: a `type`, the owning
/// conversation, and a camelCase `payload`.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub payload: Value,
}

impl ProtocolMessage {
    pub fn new(message_type: &str, conversation_id: &str, payload: Value) -> Self {
        Self {
            message_type: message_type.to_string(),
            conversation_id: conversation_id.to_string(),
            payload,
        }
    }

    pub fn chat_input(conversation_id: &str, enabled: bool) -> Self {
        Self::new("control.flow.chatInput", conversation_id, json!({"enabled": enabled}))
    }

    pub fn content_chunk(conversation_id: &str, message_id: &str, content: &str, final_chunk: bool) -> Self {
        Self::new(
            "data.content.chunk",
            conversation_id,
            json!({"content": content, "messageId": message_id, "final": final_chunk}),
        )
    }

    pub fn content_complete(conversation_id: &str, message_id: &str, full_content: &str) -> Self {
        Self::new(
            "data.content.complete",
            conversation_id,
            json!({"messageId": message_id, "role": "assistant", "fullContent": full_content}),
        )
    }

    pub fn tool_call(conversation_id: &str, call_id: &str, tool_name: &str, arguments: &Value) -> Self {
        Self::new(
            "data.tool.call",
            conversation_id,
            json!({"callId": call_id, "toolName": tool_name, "arguments": arguments}),
        )
    }

    pub fn tool_result(
        conversation_id: &str,
        call_id: &str,
        tool_name: &str,
        success: bool,
        result: &Value,
        execution_time_ms: u64,
    ) -> Self {
        Self::new(
            "data.tool.result",
            conversation_id,
            json!({
                "callId": call_id,
                "toolName": tool_name,
                "success": success,
                "result": result,
                "executionTimeMs": execution_time_ms,
            }),
        )
    }

    pub fn message_ack(conversation_id: &str, status: &str) -> Self {
        Self::new("data.message.ack", conversation_id, json!({"status": status}))
    }

    pub fn response_ack(conversation_id: &str, widget_id: &str, status: &str) -> Self {
        Self::new(
            "data.response.ack",
            conversation_id,
            json!({"status": status, "widgetId": widget_id}),
        )
    }

    pub fn error(conversation_id: &str, category: &str, code: &str, message: &str, retryable: bool) -> Self {
        Self::new(
            "system.error",
            conversation_id,
            json!({
                "category": category,
                "code": code,
                "message": message,
                "isRetryable": retryable,
            }),
        )
    }
}

/// Transport boundary: the WebSocket framing lives outside this crate.
///
/// A slow peer blocks the sending context's task; there is no per-connection
/// queue.
#[async_trait]
pub trait WireSink: Send + Sync {
    async fn send(&self, connection_id: &str, message: ProtocolMessage) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_keys_are_camel_case() {
        let message = ProtocolMessage::content_complete("c1", "m1", "hello");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "data.content.complete");
        assert_eq!(value["conversationId"], "c1");
        assert_eq!(value["payload"]["fullContent"], "hello");
        assert_eq!(value["payload"]["messageId"], "m1");
    }

    #[test]
    fn error_payload_carries_retryability() {
        let message = ProtocolMessage::error("c1", "agent", "AGENT_ERROR", "boom", false);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["payload"]["isRetryable"], false);
        assert_eq!(value["payload"]["code"], "AGENT_ERROR");
    }
}
