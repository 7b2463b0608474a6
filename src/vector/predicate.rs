//! Structured filters over vector table metadata columns.
//!
//! Clients never send filter strings. A [`Predicate`] is rendered to the
//! index's SQL filter dialect here, with identifiers checked and string
//! literals quoted.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use tenant_vault_core::models::to_epoch;

use super::schema::{DISPLAY_DATE, DOC_ID, EXPIRE_DATE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::Str(s.to_string())
    }
}

impl From<String> for Literal {
    fn from(s: String) -> Self {
        Literal::Str(s)
    }
}

impl From<i64> for Literal {
    fn from(n: i64) -> Self {
        Literal::Int(n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Compare {
        column: String,
        op: CompareOp,
        value: Literal,
    },
    In {
        column: String,
        values: Vec<Literal>,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn compare(column: &str, op: CompareOp, value: impl Into<Literal>) -> Self {
        Predicate::Compare {
            column: column.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: &str, value: impl Into<Literal>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn doc_id(doc_id: &str) -> Self {
        Self::eq(DOC_ID, doc_id)
    }

    /// Rows whose validity window contains `at`.
    pub fn valid_at(at: DateTime<Utc>) -> Self {
        let t = to_epoch(at);
        Predicate::And(vec![
            Self::compare(DISPLAY_DATE, CompareOp::Le, t),
            Self::compare(EXPIRE_DATE, CompareOp::Gt, t),
        ])
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Render to the filter dialect, or explain why the predicate is invalid.
    pub fn render(&self) -> Result<String, String> {
        let mut out = String::new();
        self.render_into(&mut out)?;
        Ok(out)
    }

    fn render_into(&self, out: &mut String) -> Result<(), String> {
        match self {
            Predicate::Compare { column, op, value } => {
                write_column(out, column)?;
                let _ = write!(out, " {} ", op.sql());
                write_literal(out, value)
            }
            Predicate::In { column, values } => {
                if values.is_empty() {
                    out.push_str("false");
                    return Ok(());
                }
                write_column(out, column)?;
                out.push_str(" IN (");
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_literal(out, value)?;
                }
                out.push(')');
                Ok(())
            }
            Predicate::And(parts) => join(out, parts, " AND ", "true"),
            Predicate::Or(parts) => join(out, parts, " OR ", "false"),
        }
    }
}

fn join(out: &mut String, parts: &[Predicate], sep: &str, empty: &str) -> Result<(), String> {
    if parts.is_empty() {
        out.push_str(empty);
        return Ok(());
    }
    out.push('(');
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        part.render_into(out)?;
    }
    out.push(')');
    Ok(())
}

fn write_column(out: &mut String, column: &str) -> Result<(), String> {
    let mut chars = column.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(format!("invalid filter column '{}'", column));
    }
    // Backticks keep columns such as `end` from parsing as keywords.
    let _ = write!(out, "`{}`", column);
    Ok(())
}

fn write_literal(out: &mut String, value: &Literal) -> Result<(), String> {
    match value {
        Literal::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Literal::Int(n) => {
            let _ = write!(out, "{}", n);
        }
        Literal::Float(f) => {
            if !f.is_finite() {
                return Err(format!("non-finite filter value {}", f));
            }
            let _ = write!(out, "{:?}", f);
        }
        Literal::Str(s) => {
            out.push('\'');
            out.push_str(&s.replace('\'', "''"));
            out.push('\'');
        }
    }
    Ok(())
}
