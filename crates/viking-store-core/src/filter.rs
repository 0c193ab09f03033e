//! Scalar filter algebra applied to vector-store records.
//!
//! Filters are JSON-serializable and tagged by `op`:
//!
//! ```json
//! {"op": "must", "field": "context_type", "conds": ["memory"]}
//! {"op": "and", "conds": [{"op": "prefix", "field": "uri", "prefix": "viking://resources/"},
//!                         {"op": "range", "field": "active_count", "gt": 3}]}
//! ```
//!
//! | Op | Matches when |
//! |----|--------------|
//! | `must` | field equals one of `conds` (for list fields: contains one) |
//! | `must_not` | negation of `must` |
//! | `range` | field within all given bounds |
//! | `range_out` | field outside the closed bounds |
//! | `prefix` | string field starts with `prefix` |
//! | `contains` | string field contains `substring` |
//! | `regex` | string field matches `pattern` |
//! | `time_range` | date-time field within bounds |
//! | `and` / `or` | boolean composition |
//!
//! Every backend evaluates the same semantics; [`Filter::matches`] is
//! the reference evaluation used by the in-memory backend and for
//! predicates a backend cannot push down.

use std::cmp::Ordering;

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Must {
        field: String,
        conds: Vec<Value>,
    },
    MustNot {
        field: String,
        conds: Vec<Value>,
    },
    Range {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gt: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gte: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lt: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lte: Option<Value>,
    },
    RangeOut {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gte: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lte: Option<Value>,
    },
    Prefix {
        field: String,
        prefix: String,
    },
    Contains {
        field: String,
        substring: String,
    },
    Regex {
        field: String,
        pattern: String,
    },
    TimeRange {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gte: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lte: Option<String>,
    },
    And {
        conds: Vec<Filter>,
    },
    Or {
        conds: Vec<Filter>,
    },
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Must {
            field: field.to_string(),
            conds: vec![value.into()],
        }
    }

    pub fn any_of(field: &str, values: Vec<Value>) -> Self {
        Filter::Must {
            field: field.to_string(),
            conds: values,
        }
    }

    pub fn prefix(field: &str, prefix: impl Into<String>) -> Self {
        Filter::Prefix {
            field: field.to_string(),
            prefix: prefix.into(),
        }
    }

    /// AND of the given filters, flattening the trivial cases.
    pub fn all(mut filters: Vec<Filter>) -> Option<Self> {
        match filters.len() {
            0 => None,
            1 => filters.pop(),
            _ => Some(Filter::And { conds: filters }),
        }
    }

    /// Reject filters that could never be evaluated (bad regex or
    /// unparsable time bounds).
    pub fn validate(&self) -> Result<()> {
        match self {
            Filter::Regex { pattern, .. } => {
                if let Err(e) = regex::Regex::new(pattern) {
                    bail!("invalid regex filter '{}': {}", pattern, e);
                }
            }
            Filter::TimeRange { gte, lte, .. } => {
                for bound in [gte, lte].into_iter().flatten() {
                    if parse_time(bound).is_none() {
                        bail!("invalid time bound '{}'", bound);
                    }
                }
            }
            Filter::And { conds } | Filter::Or { conds } => {
                for c in conds {
                    c.validate()?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Evaluate against a record's scalar fields.
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        match self {
            Filter::Must { field, conds } => match fields.get(field) {
                Some(v) => value_in(v, conds),
                None => false,
            },
            Filter::MustNot { field, conds } => match fields.get(field) {
                Some(v) => !value_in(v, conds),
                None => true,
            },
            Filter::Range {
                field,
                gt,
                gte,
                lt,
                lte,
            } => {
                let Some(v) = fields.get(field) else {
                    return false;
                };
                let check = |bound: &Option<Value>, ok: fn(Ordering) -> bool| match bound {
                    Some(b) => compare(v, b).map(ok).unwrap_or(false),
                    None => true,
                };
                check(gt, |o| o == Ordering::Greater)
                    && check(gte, |o| o != Ordering::Less)
                    && check(lt, |o| o == Ordering::Less)
                    && check(lte, |o| o != Ordering::Greater)
            }
            Filter::RangeOut { field, gte, lte } => {
                let Some(v) = fields.get(field) else {
                    return false;
                };
                let below = gte
                    .as_ref()
                    .and_then(|b| compare(v, b))
                    .map(|o| o == Ordering::Less)
                    .unwrap_or(false);
                let above = lte
                    .as_ref()
                    .and_then(|b| compare(v, b))
                    .map(|o| o == Ordering::Greater)
                    .unwrap_or(false);
                below || above
            }
            Filter::Prefix { field, prefix } => fields
                .get(field)
                .and_then(Value::as_str)
                .map(|s| s.starts_with(prefix.as_str()))
                .unwrap_or(false),
            Filter::Contains { field, substring } => fields
                .get(field)
                .and_then(Value::as_str)
                .map(|s| s.contains(substring.as_str()))
                .unwrap_or(false),
            Filter::Regex { field, pattern } => {
                let Some(s) = fields.get(field).and_then(Value::as_str) else {
                    return false;
                };
                regex::Regex::new(pattern)
                    .map(|re| re.is_match(s))
                    .unwrap_or(false)
            }
            Filter::TimeRange { field, gte, lte } => {
                let Some(t) = fields.get(field).and_then(Value::as_str).and_then(parse_time)
                else {
                    return false;
                };
                let after = match gte.as_deref().map(parse_time) {
                    Some(Some(lo)) => t >= lo,
                    Some(None) => false,
                    None => true,
                };
                let before = match lte.as_deref().map(parse_time) {
                    Some(Some(hi)) => t <= hi,
                    Some(None) => false,
                    None => true,
                };
                after && before
            }
            Filter::And { conds } => conds.iter().all(|c| c.matches(fields)),
            Filter::Or { conds } => conds.iter().any(|c| c.matches(fields)),
        }
    }
}

fn value_in(v: &Value, conds: &[Value]) -> bool {
    match v {
        Value::Array(items) => items.iter().any(|item| conds.iter().any(|c| scalar_eq(item, c))),
        _ => conds.iter().any(|c| scalar_eq(v, c)),
    }
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Order two scalars of the same kind. Mixed kinds do not compare.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (parse_time(x), parse_time(y)) {
                (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Parse RFC 3339 or a naive `YYYY-MM-DDTHH:MM:SS[.f]` (taken as UTC).
pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}
