//! 认知层：Planner（请求拼装与回复解析）、子循环、过程事件、教学模式

pub mod events;
pub mod loop_;
pub mod planner;
pub mod teaching;

pub use events::AgentEvent;
pub use loop_::{run_turn, ReactSession, TurnOutcome, DEFAULT_MAX_ITERATIONS};
pub use planner::{detect_action, detect_plan, extract_plan_steps, extract_tool_calls, Planner};
pub use teaching::{ExplanationRequest, TeachingConfig, TeachingMode};
