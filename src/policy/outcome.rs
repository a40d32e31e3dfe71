//! Assertion predicates and result extraction
//!
//! A Rego rule can bind a key term of any shape. Following the conftest
//! convention, the term is modelled as a small set of recognized shapes
//! (boolean, string, list of strings, mapping with `msg` and optional
//! `result`) and one conversion routine to [`CheckResult`]. Anything else
//! is reported verbatim as a YAML dump.

use serde_json::Value;

use crate::report::{CheckResult, Severity};

struct RuleInfo {
    name: &'static str,
    prefix: &'static str,
    severity: Severity,
}

// A rule participates in a check when its name matches one of these,
// exactly or by prefix.
const RULES: [RuleInfo; 4] = [
    RuleInfo {
        name: "error",
        prefix: "error_",
        severity: Severity::Error,
    },
    RuleInfo {
        name: "fatal",
        prefix: "fatal_",
        severity: Severity::Fatal,
    },
    RuleInfo {
        name: "skip",
        prefix: "skip_",
        severity: Severity::Skip,
    },
    // The severity of a `check` rule is normally decided by the `result`
    // key of its value; Error is the fallback when the value carries none.
    RuleInfo {
        name: "check",
        prefix: "check_",
        severity: Severity::Error,
    },
];

fn match_rule(name: &str) -> Option<&'static RuleInfo> {
    RULES
        .iter()
        .find(|r| name == r.name || name.starts_with(r.prefix))
}

/// The severity channel selected by a rule name, or `None` severity for
/// names that are not assertion predicates.
pub fn severity_for_rule(name: &str) -> Severity {
    match_rule(name).map(|r| r.severity).unwrap_or(Severity::None)
}

/// Scan module source for top-level rule heads.
///
/// Rule heads start in column zero with an identifier, optionally behind
/// a `default` keyword. This is a textual scan, not a parse, but module
/// sources have already been validated by the engine by the time rules
/// are enumerated.
fn rule_heads(source: &str) -> Vec<String> {
    let mut found = Vec::new();

    for line in source.lines() {
        // Rule heads are never indented.
        if line.starts_with(char::is_whitespace) {
            continue;
        }

        let line = line.strip_prefix("default ").unwrap_or(line);

        let ident: String = line
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();

        if ident.is_empty() || !ident.starts_with(|c: char| c.is_alphabetic() || c == '_') {
            continue;
        }

        if ident == "package" || ident == "import" {
            continue;
        }

        // The identifier must be followed by rule-head punctuation (or the
        // `if`/`contains` keywords) to count as a rule.
        let rest = line[ident.len()..].trim_start();
        let is_head = rest.starts_with('[')
            || rest.starts_with('{')
            || rest.starts_with('(')
            || rest.starts_with('=')
            || rest.starts_with(":=")
            || rest.starts_with("if ")
            || rest.starts_with("if{")
            || rest.starts_with("contains ");

        if is_head && !found.contains(&ident) {
            found.push(ident);
        }
    }

    found
}

/// True if the source defines any rules at all.
pub fn has_rules(source: &str) -> bool {
    !rule_heads(source).is_empty()
}

/// Names of the assertion rules the source defines. The same rule name can
/// appear several times in a module; each name is returned once.
pub fn assertion_rules(source: &str) -> Vec<String> {
    rule_heads(source)
        .into_iter()
        .filter(|name| severity_for_rule(name) != Severity::None)
        .collect()
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_string_list(value: &Value) -> Option<Vec<&str>> {
    let items = value.as_array()?;
    if items.is_empty() {
        return None;
    }

    items.iter().map(Value::as_str).collect()
}

fn extract_one(severity: Severity, value: &Value) -> CheckResult {
    if let Some(lines) = as_string_list(value) {
        return CheckResult::new(severity, lines.join("\n"));
    }

    match value {
        // A boolean comes from a rule with no key term, like
        // `error { ... }`. Rego only reports boolean rules that fired,
        // so there is no message to carry.
        Value::Bool(_) => CheckResult::new(severity, ""),

        Value::String(message) => CheckResult::new(severity, message.clone()),

        // A mapping can carry both the message and an explicit severity:
        // `error[{"msg": msg, "result": "Fatal"}] { ... }`.
        Value::Object(fields) => {
            let message = fields
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or_default();

            let severity = fields
                .get("result")
                .and_then(Value::as_str)
                .and_then(Severity::parse)
                .unwrap_or(severity);

            CheckResult::new(severity, message)
        }

        other => {
            let dump = serde_yaml::to_string(other)
                .unwrap_or_else(|e| format!("failed to format value: {e}"));
            CheckResult::new(
                severity,
                format!(
                    "unhandled result value type '{}'\n{}",
                    value_type_name(other),
                    dump.trim_end()
                ),
            )
        }
    }
}

/// Convert the evaluated value of an assertion rule into results.
///
/// A set-valued rule contributes one result per member; anything else is a
/// single result. Every message is prefixed with the predicate that raised
/// it so multi-rule modules stay readable.
pub fn extract_results(rule: &str, value: &Value) -> Vec<CheckResult> {
    let severity = severity_for_rule(rule);

    let mut results = match value {
        Value::Array(items) => items.iter().map(|v| extract_one(severity, v)).collect(),
        other => vec![extract_one(severity, other)],
    };

    for result in &mut results {
        let prefix = format!("raised predicate {rule:?}");
        result.message = if result.message.is_empty() {
            prefix
        } else {
            format!("{prefix}\n{}", result.message)
        };
    }

    results
}
