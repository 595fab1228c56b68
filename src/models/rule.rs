//! Mutation rule models
//!
//! A rule pairs a matcher (evaluated against the request's match context)
//! with an ordered list of header/body mutation actions.

use serde::{Deserialize, Serialize};

/// How a single matcher field is compared against its context value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleMatchMode {
    /// Always matches, regardless of the field value.
    Any,
    /// Equality; case-insensitive except for the path field.
    Exact,
    /// Glob-style pattern where `*` matches any run and `?` a single char.
    Wildcard,
    /// Raw regular expression. An invalid pattern never matches.
    Regex,
}

/// One field of a [`RuleMatcher`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatchField {
    pub mode: RuleMatchMode,
    pub value: String,
}

impl RuleMatchField {
    pub fn any() -> Self {
        Self {
            mode: RuleMatchMode::Any,
            value: String::new(),
        }
    }

    pub fn exact(value: impl Into<String>) -> Self {
        Self {
            mode: RuleMatchMode::Exact,
            value: value.into(),
        }
    }

    pub fn wildcard(value: impl Into<String>) -> Self {
        Self {
            mode: RuleMatchMode::Wildcard,
            value: value.into(),
        }
    }

    pub fn regex(value: impl Into<String>) -> Self {
        Self {
            mode: RuleMatchMode::Regex,
            value: value.into(),
        }
    }
}

/// Matcher over the `(scheme, host, path, port)` tuple. A rule matches only
/// when all four fields match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatcher {
    pub scheme: RuleMatchField,
    pub host: RuleMatchField,
    pub path: RuleMatchField,
    pub port: RuleMatchField,
}

impl Default for RuleMatcher {
    fn default() -> Self {
        Self {
            scheme: RuleMatchField::any(),
            host: RuleMatchField::any(),
            path: RuleMatchField::any(),
            port: RuleMatchField::any(),
        }
    }
}

/// Which leg of the exchange an action applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleTarget {
    Request,
    Response,
}

/// The mutation an action performs. Matched exhaustively so a new kind is a
/// compile error everywhere it must be handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleActionKind {
    /// Replace all headers with this name by a single entry, or add one.
    /// A blank name is a no-op.
    SetHeader { name: String, value: String },
    /// Remove all headers with this name. A blank name is a no-op.
    RemoveHeader { name: String },
    /// Replace the body with the UTF-8 encoding of `body` (empty clears the
    /// body), recompute `Content-Length` and drop any transfer/content
    /// encoding headers. Optionally override `Content-Type`.
    ReplaceBody {
        body: String,
        content_type: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAction {
    pub id: String,
    pub target: RuleTarget,
    pub kind: RuleActionKind,
}

impl RuleAction {
    pub fn new(target: RuleTarget, kind: RuleActionKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target,
            kind,
        }
    }
}

/// A stored rule. The engine only ever reads a snapshot list per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub matcher: RuleMatcher,
    pub actions: Vec<RuleAction>,
}

impl RuleDefinition {
    /// New enabled rule at priority 0 that matches everything and does
    /// nothing until actions are added.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            enabled: true,
            priority: 0,
            matcher: RuleMatcher::default(),
            actions: Vec::new(),
        }
    }
}

/// Context a matcher is evaluated against. Derived once from the original
/// request; response-phase matching reuses the request's context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatchContext {
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub port: u16,
}

/// Record of a single rule firing during one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleExecutionTrace {
    pub rule_id: String,
    pub rule_name: String,
    pub target: RuleTarget,
    pub mutations: Vec<String>,
}

/// Request and response phase traces merged per rule id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRuleTrace {
    pub rule_id: String,
    pub rule_name: String,
    pub applied_to_request: bool,
    pub applied_to_response: bool,
    pub mutations: Vec<String>,
}
