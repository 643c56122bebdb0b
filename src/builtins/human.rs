use crate::builtins::{BuiltinTool, BuiltinToolResult, UserContext, optional_str, required_str};
use async_trait::async_trait;
use serde_json::{Map, Value, json};

/// Human-in-the-loop marker tool.
///
/// Does not block. The marker result instructs the calling host to pause
/// the agent run and surface the question to the user.
pub struct AskHumanTool;

#[async_trait]
impl BuiltinTool for AskHumanTool {
    fn name(&self) -> &str {
        "ask_human"
    }

    fn description(&self) -> &str {
        "Ask the human user a question. The agent run pauses until the user answers."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {"type": "string", "description": "The question to present to the user"},
                "context": {"type": "string", "description": "Optional context shown with the question"}
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, _user: &UserContext) -> BuiltinToolResult {
        let question = match required_str(arguments, "question") {
            Ok(q) => q,
            Err(e) => return BuiltinToolResult::err(e),
        };
        let mut metadata = Map::new();
        metadata.insert("pause_agent".into(), json!(true));
        BuiltinToolResult::ok_with_metadata(
            json!({
                "action": "ask_human",
                "question": question,
                "context": optional_str(arguments, "context"),
            }),
            metadata,
        )
    }
}
