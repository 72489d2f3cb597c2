//! 工具箱：echo、沙箱文件读写与执行器

pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use filesystem::{DeleteFileTool, ListDirTool, ReadFileTool, SafeFs, WriteFileTool};
pub use registry::{Tool, ToolRegistry};
pub use schema::{
    tool_call_schema_json, ApprovalRequest, ToolCall, ToolDefinition, ToolResult, ToolUseDirective,
};
