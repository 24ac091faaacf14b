//! `{{ .KEY }}` substitution over the job variable map.
//!
//! サポートするのはフィールド参照だけ（`{{ .JOB_ID }}`, `{{ .a.output }}`）。
//! 存在しないキーは `<no value>` になる。

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

pub const NO_VALUE: &str = "<no value>";

static ACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*\.([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\s*\}\}")
        .expect("template action pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("malformed template action near {0:?}")]
    Malformed(String),
}

fn lookup<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(ctx, |v, key| v.get(key))
}

fn display(v: &Value) -> String {
    match v {
        Value::Null => NO_VALUE.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn check_literal(text: &str) -> Result<(), TemplateError> {
    if let Some(i) = text.find("{{").or_else(|| text.find("}}")) {
        let end = (i + 16).min(text.len());
        let snippet = text.get(i..end).unwrap_or(&text[i..]);
        return Err(TemplateError::Malformed(snippet.to_string()));
    }
    Ok(())
}

/// Render `input` against `ctx`.
pub fn render(input: &str, ctx: &Value) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in ACTION.captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        let literal = &input[last..whole.start()];
        check_literal(literal)?;
        out.push_str(literal);

        let path = caps.get(1).map_or("", |m| m.as_str());
        match lookup(ctx, path) {
            Some(v) => out.push_str(&display(v)),
            None => out.push_str(NO_VALUE),
        }
        last = whole.end();
    }
    let tail = &input[last..];
    check_literal(tail)?;
    out.push_str(tail);
    Ok(out)
}
