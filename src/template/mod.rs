// Report template DSL: conditional blocks, line filters and parameter substitution
pub mod processor;
pub mod rules;

pub use processor::{render, render_with_rules, value_text, Params};
pub use rules::{default_rules, Directive, Rule, RuleKind};
