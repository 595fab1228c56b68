//! Data models shared across the proxy engine.

pub mod rule;
pub mod session;
pub mod websocket;

pub use rule::{
    AppliedRuleTrace, RuleAction, RuleActionKind, RuleDefinition, RuleExecutionTrace,
    RuleMatchContext, RuleMatchField, RuleMatchMode, RuleMatcher, RuleTarget,
};
pub use session::{
    CapturedRequest, CapturedResponse, CapturedSession, HeaderEntry, ParsedRequest,
    UpstreamResponse,
};
pub use websocket::{MessageDirection, WebSocketMessage, WebSocketOpcode};
