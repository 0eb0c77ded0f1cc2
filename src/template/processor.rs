use super::rules::{default_rules, Rule, RuleKind};
use regex::Captures;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::trace;

/// Template parameters. Presence of a key is what directives test, the value
/// only matters for substitution.
pub type Params = HashMap<String, Value>;

enum BlockEvent {
    Start { keep: bool },
    End,
}

/// Render a report template with the built-in rules
pub fn render(template: &str, params: &Params) -> String {
    render_with_rules(template, params, default_rules())
}

/// Render a report template in a single pass over its lines.
///
/// Blocks are flat: a block start inside an open block replaces the open
/// block's state, and one block end closes whatever is open. Unknown
/// parameters never fail the render, their tokens stay in the text.
pub fn render_with_rules(template: &str, params: &Params, rules: &[Rule]) -> String {
    let mut result = String::with_capacity(template.len());
    let mut in_block = false;
    let mut block_keep = true;

    for line in template.lines() {
        match block_event(line, params, rules) {
            Some(BlockEvent::Start { keep }) => {
                in_block = true;
                block_keep = keep;
                continue;
            }
            Some(BlockEvent::End) => {
                in_block = false;
                block_keep = true;
                continue;
            }
            None => {}
        }

        if in_block && !block_keep {
            continue;
        }

        let mut line = Cow::Borrowed(line);
        let mut dropped = false;

        for rule in rules {
            match rule.kind {
                RuleKind::LineFilter => {
                    if !dropped && rule.directives(&line).any(|d| !d.keeps(params)) {
                        dropped = true;
                    }
                }
                RuleKind::Replace => {
                    let replaced = match rule.pattern.replace_all(&line, |caps: &Captures| {
                        match params.get(&caps[1]) {
                            Some(value) => value_text(value),
                            None => caps[0].to_string(),
                        }
                    }) {
                        Cow::Owned(text) => Some(text),
                        Cow::Borrowed(_) => None,
                    };
                    if let Some(text) = replaced {
                        line = Cow::Owned(text);
                    }
                }
                RuleKind::BlockStart | RuleKind::BlockEnd => {}
            }
        }

        if dropped {
            trace!("Dropped template line: {}", line);
        } else {
            result.push_str(&line);
            result.push('\n');
        }
    }

    result
}

fn block_event(line: &str, params: &Params, rules: &[Rule]) -> Option<BlockEvent> {
    for rule in rules {
        match rule.kind {
            RuleKind::BlockStart => {
                if let Some(directive) = rule.directive(line) {
                    return Some(BlockEvent::Start {
                        keep: directive.keeps(params),
                    });
                }
            }
            RuleKind::BlockEnd => {
                if rule.is_match(line) {
                    return Some(BlockEvent::End);
                }
            }
            RuleKind::LineFilter | RuleKind::Replace => {}
        }
    }
    None
}

/// Textual form a parameter takes when substituted into query text
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}
