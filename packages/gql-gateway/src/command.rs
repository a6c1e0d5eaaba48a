//! Local command grammar and interpreter
//!
//! Statements starting with `:` never reach the engine. The vocabulary:
//!
//! ```text
//! :param <name> => <value>    bind a parameter (JSON literal or 'quoted')
//! :param <name> =>            unbind it
//! :params [<name>]            show all bindings, or one
//! :sleep <seconds>            pause the batch; produces no outcome
//! ```
//!
//! Keywords are case-insensitive; surrounding whitespace and one trailing
//! `;` are ignored. Anything else is forwarded to the engine.

use std::sync::OnceLock;
use std::time::Duration;

use regex_lite::Regex;
use thiserror::Error;

use crate::value::{GenericValue, ParameterMap};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("unknown local command: {0}")]
    UnknownCommand(String),

    #[error("malformed local command: {0}")]
    Syntax(String),

    #[error("invalid value for parameter '{name}': {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("parameter '{0}' is not defined")]
    UnknownParameter(String),

    #[error("invalid sleep duration: {0}")]
    InvalidDuration(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocalCommand {
    SetParam { name: String, value: GenericValue },
    RemoveParam { name: String },
    ShowParams { name: Option<String> },
    Sleep(Duration),
}

/// How a statement is to be executed.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Remote,
    Local(Result<LocalCommand, CommandError>),
}

/// What running a local command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEffect {
    /// Parameter bindings to echo back to the caller.
    Snapshot(ParameterMap),
    /// Suspend the batch; nothing is reported.
    Pause(Duration),
}

fn param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)^:param\s+([A-Za-z_][A-Za-z0-9_]*)\s*=>\s*(.*)$").expect("valid :param regex")
    })
}

fn params_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^:params(?:\s+([A-Za-z_][A-Za-z0-9_]*))?$").expect("valid :params regex")
    })
}

fn sleep_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^:sleep\s+(\S+)$").expect("valid :sleep regex"))
}

fn keyword(text: &str) -> String {
    text.split_whitespace().next().unwrap_or(text).to_lowercase()
}

/// Classify one statement.
pub fn classify(statement: &str) -> StatementKind {
    let mut text = statement.trim();
    if !text.starts_with(':') {
        return StatementKind::Remote;
    }
    if let Some(stripped) = text.strip_suffix(';') {
        text = stripped.trim_end();
    }
    StatementKind::Local(parse(text))
}

fn parse(text: &str) -> Result<LocalCommand, CommandError> {
    if let Some(caps) = param_re().captures(text) {
        let name = caps[1].to_string();
        let raw = caps[2].trim();
        if raw.is_empty() {
            return Ok(LocalCommand::RemoveParam { name });
        }
        let value = parse_value(raw).map_err(|reason| CommandError::InvalidValue {
            name: name.clone(),
            reason,
        })?;
        return Ok(LocalCommand::SetParam { name, value });
    }
    if let Some(caps) = params_re().captures(text) {
        return Ok(LocalCommand::ShowParams {
            name: caps.get(1).map(|m| m.as_str().to_string()),
        });
    }
    if let Some(caps) = sleep_re().captures(text) {
        return parse_duration(&caps[1]).map(LocalCommand::Sleep);
    }

    match keyword(text).as_str() {
        ":param" | ":params" | ":sleep" => Err(CommandError::Syntax(text.to_string())),
        _ => Err(CommandError::UnknownCommand(text.to_string())),
    }
}

fn parse_value(raw: &str) -> Result<GenericValue, String> {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        let inner = &raw[1..raw.len() - 1];
        return Ok(GenericValue::String(inner.replace("\\'", "'")));
    }
    serde_json::from_str::<serde_json::Value>(raw)
        .map(GenericValue::from)
        .map_err(|e| e.to_string())
}

fn parse_duration(raw: &str) -> Result<Duration, CommandError> {
    let secs: f64 = raw
        .parse()
        .map_err(|_| CommandError::InvalidDuration(raw.to_string()))?;
    Duration::try_from_secs_f64(secs).map_err(|_| CommandError::InvalidDuration(raw.to_string()))
}

/// Run a local command against a client's parameter map.
pub fn execute(command: LocalCommand, params: &mut ParameterMap) -> Result<CommandEffect, CommandError> {
    match command {
        LocalCommand::SetParam { name, value } => {
            params.insert(name, value);
            Ok(CommandEffect::Snapshot(params.clone()))
        }
        LocalCommand::RemoveParam { name } => {
            params.remove(&name);
            Ok(CommandEffect::Snapshot(params.clone()))
        }
        LocalCommand::ShowParams { name: None } => Ok(CommandEffect::Snapshot(params.clone())),
        LocalCommand::ShowParams { name: Some(name) } => match params.get(&name) {
            Some(value) => Ok(CommandEffect::Snapshot(ParameterMap::from([(name, value.clone())]))),
            None => Err(CommandError::UnknownParameter(name)),
        },
        LocalCommand::Sleep(duration) => Ok(CommandEffect::Pause(duration)),
    }
}

/// Escape a namespace name for embedding between backquotes.
///
/// Only `\` and `` ` `` are escaped. This keeps the name from closing the
/// identifier quote; it is not a general injection filter.
pub fn escape_namespace(name: &str) -> String {
    name.replace('\\', "\\\\").replace('`', "\\`")
}

/// `USE` prefix prepended to every remote statement of a batch.
pub fn namespace_prefix(space: Option<&str>) -> Option<String> {
    space
        .filter(|s| !s.is_empty())
        .map(|s| format!("USE `{}` ", escape_namespace(s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn local(statement: &str) -> Result<LocalCommand, CommandError> {
        match classify(statement) {
            StatementKind::Local(parsed) => parsed,
            StatementKind::Remote => panic!("expected local command: {}", statement),
        }
    }

    // ============================================================================
    // Classification
    // ============================================================================

    #[test]
    fn test_remote_statements() {
        assert_eq!(classify("MATCH (n) RETURN n"), StatementKind::Remote);
        assert_eq!(classify("  RETURN ':param'"), StatementKind::Remote);
        assert_eq!(classify(""), StatementKind::Remote);
    }

    #[test]
    fn test_param_set() {
        assert_eq!(
            local(":param age => 42"),
            Ok(LocalCommand::SetParam { name: "age".into(), value: GenericValue::Int(42) })
        );
        assert_eq!(
            local("  :PARAM name=>'Tim Duncan';  "),
            Ok(LocalCommand::SetParam { name: "name".into(), value: GenericValue::from("Tim Duncan") })
        );
        assert_eq!(
            local(r#":param tags => ["a", "b"]"#),
            Ok(LocalCommand::SetParam {
                name: "tags".into(),
                value: GenericValue::List(vec![GenericValue::from("a"), GenericValue::from("b")]),
            })
        );
    }

    #[test]
    fn test_param_remove() {
        assert_eq!(local(":param age =>"), Ok(LocalCommand::RemoveParam { name: "age".into() }));
    }

    #[test]
    fn test_param_invalid_value() {
        assert!(matches!(local(":param x => {oops"), Err(CommandError::InvalidValue { .. })));
    }

    #[test]
    fn test_params_show() {
        assert_eq!(local(":params"), Ok(LocalCommand::ShowParams { name: None }));
        assert_eq!(local(":params age"), Ok(LocalCommand::ShowParams { name: Some("age".into()) }));
    }

    #[test]
    fn test_sleep() {
        assert_eq!(local(":sleep 2"), Ok(LocalCommand::Sleep(Duration::from_secs(2))));
        assert_eq!(local(":sleep 0.5"), Ok(LocalCommand::Sleep(Duration::from_millis(500))));
        assert!(matches!(local(":sleep -1"), Err(CommandError::InvalidDuration(_))));
        assert!(matches!(local(":sleep soon"), Err(CommandError::InvalidDuration(_))));
        assert!(matches!(local(":sleep 1e30"), Err(CommandError::InvalidDuration(_))));
        assert!(matches!(local(":sleep inf"), Err(CommandError::InvalidDuration(_))));
        assert!(matches!(local(":sleep NaN"), Err(CommandError::InvalidDuration(_))));
    }

    #[test]
    fn test_malformed_and_unknown() {
        assert!(matches!(local(":param 1abc => 1"), Err(CommandError::Syntax(_))));
        assert!(matches!(local(":sleep"), Err(CommandError::Syntax(_))));
        assert!(matches!(local(":exit"), Err(CommandError::UnknownCommand(_))));
    }

    // ============================================================================
    // Execution
    // ============================================================================

    #[test]
    fn test_execute_set_show_remove() {
        let mut params = ParameterMap::new();

        let effect = execute(LocalCommand::SetParam { name: "a".into(), value: GenericValue::Int(1) }, &mut params);
        assert_eq!(effect, Ok(CommandEffect::Snapshot(ParameterMap::from([("a".into(), GenericValue::Int(1))]))));

        execute(LocalCommand::SetParam { name: "b".into(), value: GenericValue::Int(2) }, &mut params).unwrap();
        let CommandEffect::Snapshot(one) = execute(LocalCommand::ShowParams { name: Some("b".into()) }, &mut params).unwrap()
        else {
            panic!("expected snapshot");
        };
        assert_eq!(one.len(), 1);

        execute(LocalCommand::RemoveParam { name: "a".into() }, &mut params).unwrap();
        assert!(!params.contains_key("a"));
        assert_eq!(
            execute(LocalCommand::ShowParams { name: Some("a".into()) }, &mut params),
            Err(CommandError::UnknownParameter("a".into()))
        );
    }

    #[test]
    fn test_execute_sleep_is_pause() {
        let mut params = ParameterMap::new();
        let effect = execute(LocalCommand::Sleep(Duration::from_secs(1)), &mut params).unwrap();
        assert_eq!(effect, CommandEffect::Pause(Duration::from_secs(1)));
        assert!(params.is_empty());
    }

    // ============================================================================
    // Namespace escaping
    // ============================================================================

    #[test]
    fn test_namespace_prefix() {
        assert_eq!(namespace_prefix(Some("basketball")), Some("USE `basketball` ".to_string()));
        assert_eq!(namespace_prefix(Some(r"we`ird\name")), Some(r"USE `we\`ird\\name` ".to_string()));
        assert_eq!(namespace_prefix(Some("")), None);
        assert_eq!(namespace_prefix(None), None);
    }

    fn unescape(escaped: &str) -> String {
        let mut out = String::new();
        let mut chars = escaped.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    proptest! {
        #[test]
        fn prop_escape_roundtrips_and_never_leaks_quote(name in ".*") {
            let escaped = escape_namespace(&name);
            prop_assert_eq!(unescape(&escaped), name);

            let mut backslashes = 0usize;
            for c in escaped.chars() {
                if c == '`' {
                    prop_assert!(backslashes % 2 == 1);
                }
                backslashes = if c == '\\' { backslashes + 1 } else { 0 };
            }
        }

        #[test]
        fn prop_plain_statements_are_remote(stmt in "[A-Za-z][A-Za-z0-9 ()]*") {
            prop_assert_eq!(classify(&stmt), StatementKind::Remote);
        }
    }
}
