//! `when` predicates: `key==VALUE`, `key!=VALUE`, bare `key`, or empty.
//!
//! - 空文字と `JOB` は `JOB==START`
//! - それ以外の bare key は `key==DONE`
//! - 値は大文字に正規化、キーは前後の空白を落とす

use std::fmt;

use thiserror::Error;

/// Key of the synthetic job-level event.
pub const JOB_KEY: &str = "JOB";
pub const JOB_START: &str = "START";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expr {
    pub key: String,
    pub operator: Operator,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("predicate {0:?} has an empty key")]
    EmptyKey(String),

    #[error("predicate {0:?} has an empty value")]
    EmptyValue(String),

    #[error("predicate {0:?} has more than one operator")]
    MultipleOperators(String),
}

impl Expr {
    pub fn parse(raw: &str) -> Result<Self, ExprError> {
        let s = raw.trim();
        if s.is_empty() || s == JOB_KEY {
            return Ok(Self::job_start());
        }

        let (key, operator, value) = match (s.find("=="), s.find("!=")) {
            (Some(_), Some(_)) => return Err(ExprError::MultipleOperators(raw.to_string())),
            (Some(i), None) => (&s[..i], Operator::Eq, &s[i + 2..]),
            (None, Some(i)) => (&s[..i], Operator::Ne, &s[i + 2..]),
            (None, None) => (s, Operator::Eq, "DONE"),
        };

        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(ExprError::EmptyKey(raw.to_string()));
        }
        if value.is_empty() {
            return Err(ExprError::EmptyValue(raw.to_string()));
        }
        if value.contains("==") || value.contains("!=") {
            return Err(ExprError::MultipleOperators(raw.to_string()));
        }

        Ok(Self {
            key: key.to_string(),
            operator,
            value: value.to_uppercase(),
        })
    }

    pub fn job_start() -> Self {
        Self {
            key: JOB_KEY.to_string(),
            operator: Operator::Eq,
            value: JOB_START.to_string(),
        }
    }

    /// Evaluate against an event `(key, state)`; `None` if the key differs.
    pub fn eval(&self, key: &str, state: &str) -> Option<bool> {
        if self.key != key {
            return None;
        }
        Some(match self.operator {
            Operator::Eq => self.value == state,
            Operator::Ne => self.value != state,
        })
    }

    pub fn is_job_key(&self) -> bool {
        self.key == JOB_KEY
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.operator {
            Operator::Eq => "==",
            Operator::Ne => "!=",
        };
        write!(f, "{}{}{}", self.key, op, self.value)
    }
}
