//! 工具调用的数据结构与 JSON Schema 生成
//!
//! 模型在回复中以 `<tool_use>{"name": "...", "arguments": {...}}</tool_use>` 嵌入调用；
//! tool_call_schema_json 生成该结构的 Schema 拼入 system prompt，减少格式错误。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 一次工具调用（id 由解析器按出现顺序分配：call_0, call_1, ...）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    /// arguments 非对象时视为空参数
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn arguments_value(&self) -> Value {
        Value::Object(self.arguments.clone())
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

/// 执行前需要人工确认的说明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub action: String,
    pub reason: String,
    pub destructive: bool,
    pub preview: Option<String>,
}

/// 工具执行结果；approval 非空表示「尚未执行，等待审批」
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub success: bool,
    pub output: String,
    pub approval: Option<ApprovalRequest>,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: true,
            output: output.into(),
            approval: None,
        }
    }

    pub fn needs_approval(tool_call_id: impl Into<String>, request: ApprovalRequest) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: false,
            output: String::new(),
            approval: Some(request),
        }
    }

    pub fn requires_approval(&self) -> bool {
        self.approval.is_some()
    }
}

/// 发给模型的工具定义
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// `<tool_use>` 块内的 JSON 结构（仅用于 Schema 生成与解析）
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ToolUseDirective {
    /// 工具名，如 read_file、list_dir、write_file
    pub name: String,
    /// 工具参数，依工具不同而不同（path、content 等）
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolUseDirective);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_non_object_arguments_become_empty() {
        let call = ToolCall::new("call_0", "echo", json!("text"));
        assert!(call.arguments.is_empty());
        let call = ToolCall::new("call_1", "echo", json!({"text": "hi"}));
        assert_eq!(call.str_arg("text"), Some("hi"));
    }

    #[test]
    fn test_schema_mentions_fields() {
        let schema = tool_call_schema_json();
        assert!(schema.contains("\"name\""));
        assert!(schema.contains("\"arguments\""));
    }
}
