//! Rule matching and mutation engine
//!
//! Evaluates the enabled rules in a deterministic order against a request's
//! match context and applies header/body mutations to either leg of the
//! exchange, recording a trace of everything that fired.

use crate::models::{
    AppliedRuleTrace, HeaderEntry, ParsedRequest, RuleAction, RuleActionKind, RuleDefinition,
    RuleExecutionTrace, RuleMatchContext, RuleMatchField, RuleMatchMode, RuleTarget,
    UpstreamResponse,
};
use regex::RegexBuilder;

/// Apply request-phase rules. Returns the (possibly) mutated request and one
/// trace per rule that actually mutated something.
pub fn apply_request_rules(
    rules: &[RuleDefinition],
    context: &RuleMatchContext,
    request: &ParsedRequest,
) -> (ParsedRequest, Vec<RuleExecutionTrace>) {
    let mut state = MutationState {
        headers: request.headers.clone(),
        body: request.body.clone(),
    };
    let traces = run_phase(rules, context, RuleTarget::Request, &mut state);

    let mutated = ParsedRequest {
        method: request.method.clone(),
        target: request.target.clone(),
        version: request.version.clone(),
        headers: state.headers,
        body: state.body,
    };
    (mutated, traces)
}

/// Apply response-phase rules. Matching always uses the original request's
/// context, never anything derived from the response.
pub fn apply_response_rules(
    rules: &[RuleDefinition],
    context: &RuleMatchContext,
    response: &UpstreamResponse,
) -> (UpstreamResponse, Vec<RuleExecutionTrace>) {
    let mut state = MutationState {
        headers: response.headers.clone(),
        body: response.body.clone(),
    };
    let traces = run_phase(rules, context, RuleTarget::Response, &mut state);

    let mutated = UpstreamResponse {
        status_code: response.status_code,
        reason: response.reason.clone(),
        headers: state.headers,
        body: state.body,
    };
    (mutated, traces)
}

/// Merge request and response phase traces into one entry per rule id,
/// preserving the order of first appearance.
pub fn merge_traces(
    request_traces: &[RuleExecutionTrace],
    response_traces: &[RuleExecutionTrace],
) -> Vec<AppliedRuleTrace> {
    let mut merged: Vec<AppliedRuleTrace> = Vec::new();
    for trace in request_traces.iter().chain(response_traces.iter()) {
        if let Some(existing) = merged.iter_mut().find(|m| m.rule_id == trace.rule_id) {
            existing.applied_to_request |= trace.target == RuleTarget::Request;
            existing.applied_to_response |= trace.target == RuleTarget::Response;
            existing.mutations.extend(trace.mutations.iter().cloned());
        } else {
            merged.push(AppliedRuleTrace {
                rule_id: trace.rule_id.clone(),
                rule_name: trace.rule_name.clone(),
                applied_to_request: trace.target == RuleTarget::Request,
                applied_to_response: trace.target == RuleTarget::Response,
                mutations: trace.mutations.clone(),
            });
        }
    }
    merged
}

/// Accumulator threaded through the ordered action list of every matching
/// rule within one phase.
struct MutationState {
    headers: Vec<HeaderEntry>,
    body: Vec<u8>,
}

fn run_phase(
    rules: &[RuleDefinition],
    context: &RuleMatchContext,
    target: RuleTarget,
    state: &mut MutationState,
) -> Vec<RuleExecutionTrace> {
    let mut traces = Vec::new();
    for rule in ordered_active_rules(rules) {
        if !matches_context(&rule.matcher.scheme, &context.scheme, Field::Scheme)
            || !matches_context(&rule.matcher.host, &context.host, Field::Host)
            || !matches_context(&rule.matcher.path, &context.path, Field::Path)
            || !matches_context(&rule.matcher.port, &context.port.to_string(), Field::Port)
        {
            continue;
        }

        let mut mutations = Vec::new();
        for action in rule.actions.iter().filter(|a| a.target == target) {
            if let Some(description) = apply_action(action, state) {
                mutations.push(description);
            }
        }
        if !mutations.is_empty() {
            traces.push(RuleExecutionTrace {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                target,
                mutations,
            });
        }
    }
    traces
}

/// Enabled rules in the total order `(priority, lowercase name, id)`, making
/// application deterministic regardless of input ordering.
fn ordered_active_rules(rules: &[RuleDefinition]) -> Vec<&RuleDefinition> {
    let mut active: Vec<&RuleDefinition> = rules.iter().filter(|r| r.enabled).collect();
    active.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.id.cmp(&b.id))
    });
    active
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Scheme,
    Host,
    Path,
    Port,
}

impl Field {
    /// Path and port compare case-sensitively; scheme and host do not.
    fn case_insensitive(self) -> bool {
        matches!(self, Field::Scheme | Field::Host)
    }
}

fn matches_context(field: &RuleMatchField, value: &str, kind: Field) -> bool {
    match field.mode {
        RuleMatchMode::Any => true,
        RuleMatchMode::Exact => {
            if kind.case_insensitive() {
                field.value.eq_ignore_ascii_case(value)
            } else {
                field.value == value
            }
        }
        RuleMatchMode::Wildcard => regex_matches(&wildcard_to_regex(&field.value), value, kind),
        RuleMatchMode::Regex => regex_matches(&field.value, value, kind),
    }
}

/// An invalid pattern means the field never matches; the rule is skipped
/// silently rather than surfacing an error to the caller.
fn regex_matches(pattern: &str, value: &str, kind: Field) -> bool {
    match RegexBuilder::new(pattern)
        .case_insensitive(kind.case_insensitive())
        .build()
    {
        Ok(regex) => regex.is_match(value),
        Err(_) => false,
    }
}

/// Compile a glob pattern to an anchored regex: `*` → `.*`, `?` → `.`,
/// everything else escaped.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// Apply one action to the running state. Returns a human-readable mutation
/// description, or `None` when the action was a no-op.
fn apply_action(action: &RuleAction, state: &mut MutationState) -> Option<String> {
    match &action.kind {
        RuleActionKind::SetHeader { name, value } => {
            if name.trim().is_empty() {
                return None;
            }
            let existed = state.headers.iter().any(|h| h.matches_name(name));
            state.headers.retain(|h| !h.matches_name(name));
            state.headers.push(HeaderEntry::new(name.clone(), value.clone()));
            Some(if existed {
                format!("Updated header {}: {}", name, value)
            } else {
                format!("Set header {}: {}", name, value)
            })
        }
        RuleActionKind::RemoveHeader { name } => {
            if name.trim().is_empty() {
                return None;
            }
            let before = state.headers.len();
            state.headers.retain(|h| !h.matches_name(name));
            if state.headers.len() < before {
                Some(format!("Removed header {}", name))
            } else {
                None
            }
        }
        RuleActionKind::ReplaceBody { body, content_type } => {
            // Runs even for an empty replacement: explicit-clear semantics.
            state.body = body.as_bytes().to_vec();
            state
                .headers
                .retain(|h| {
                    !h.matches_name("content-length")
                        && !h.matches_name("transfer-encoding")
                        && !h.matches_name("content-encoding")
                });
            state
                .headers
                .push(HeaderEntry::new("Content-Length", state.body.len().to_string()));
            if let Some(content_type) = content_type {
                if !content_type.trim().is_empty() {
                    state.headers.retain(|h| !h.matches_name("content-type"));
                    state
                        .headers
                        .push(HeaderEntry::new("Content-Type", content_type.clone()));
                }
            }
            Some(format!("Replaced body ({} bytes)", state.body.len()))
        }
    }
}
