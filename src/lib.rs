//! Anvil - Rust 编码智能体核心
//!
//! 模块划分：
//! - **agent**: 编排器（Understand → Plan → Act → Verify）与 AgentResponse
//! - **changes**: 文件变更集、存储能力、按序应用与逆序回滚
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、生命周期、审批、状态投影、会话监管、命令循环
//! - **llm**: LLM 客户端抽象、错误分类、重试与实现（OpenAI 兼容 / Mock / Scripted）
//! - **memory**: 对话消息、有界上下文、会话持久化
//! - **react**: Planner、请求/工具调用子循环、过程事件
//! - **tools**: 工具箱（echo、read_file、list_dir、write_file、delete_file）与执行器

pub mod agent;
pub mod changes;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::{Agent, AgentResponse};
