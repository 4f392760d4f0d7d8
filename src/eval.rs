//! Predicate evaluation over joined rows
//!
//! The reference backend evaluates condition trees directly instead of
//! rendering them into a dialect. Semantics mirror SQL three-valued logic:
//! any comparison touching NULL (or a value that does not coerce to the
//! column's declared kind) is unknown and therefore does not match, while
//! `IsNull`/`NotNull` test nullness explicitly.

use std::cmp::Ordering;

use regex::Regex;

use crate::backend::{cell_key, QueryRow};
use crate::condition::{CompareOp, Condition, Connector, Param};
use crate::error::ExecError;
use crate::metadata::ColumnKind;
use crate::query::QuerySpec;
use crate::registry::Registry;
use crate::value::Value;

/// Callback used to execute sub-query parameters; returns the values of the
/// sub-query's first projected column.
pub(crate) type SubQueryExec<'a> = dyn Fn(&QuerySpec) -> Result<Vec<Value>, ExecError> + 'a;

pub(crate) fn eval_condition(
    condition: &Condition,
    row: &QueryRow,
    registry: &Registry,
    sub_query: &SubQueryExec<'_>,
) -> Result<bool, ExecError> {
    match condition {
        Condition::Group {
            connector,
            children,
        } => match connector {
            Connector::And => {
                for child in children {
                    if !eval_condition(child, row, registry, sub_query)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Connector::Or => {
                for child in children {
                    if eval_condition(child, row, registry, sub_query)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        },
        Condition::Column {
            entity,
            field,
            op,
            param,
        } => {
            let (_, column) = registry
                .resolve_column(entity, field)
                .map_err(|e| ExecError::query(e.to_string()))?;
            let left = row
                .get(&cell_key(entity, field))
                .cloned()
                .unwrap_or(Value::Null);
            eval_leaf(&left, &column.kind, *op, param, row, registry, sub_query)
        }
    }
}

fn eval_leaf(
    left: &Value,
    kind: &ColumnKind,
    op: CompareOp,
    param: &Param,
    row: &QueryRow,
    registry: &Registry,
    sub_query: &SubQueryExec<'_>,
) -> Result<bool, ExecError> {
    match op {
        CompareOp::IsNull => Ok(left.is_null()),
        CompareOp::NotNull => Ok(!left.is_null()),

        CompareOp::Eq | CompareOp::Ne | CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
            let right = scalar_param(param, row, registry, sub_query)?;
            let Some(ordering) = left.compare(&right, kind) else {
                return Ok(false);
            };
            Ok(match op {
                CompareOp::Eq => ordering == Ordering::Equal,
                CompareOp::Ne => ordering != Ordering::Equal,
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Ge => ordering != Ordering::Less,
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
                _ => unreachable!(),
            })
        }

        CompareOp::Like | CompareOp::NotLike => {
            let pattern = scalar_param(param, row, registry, sub_query)?;
            let (Value::Text(text), Value::Text(pattern)) = (left, &pattern) else {
                return Ok(false);
            };
            let matched = like_match(pattern, text)?;
            Ok(if op == CompareOp::Like { matched } else { !matched })
        }

        CompareOp::Between | CompareOp::NotBetween => {
            let Param::Range { low, high } = param else {
                return Err(ExecError::query(format!(
                    "operator {} requires a range parameter",
                    op.name()
                )));
            };
            let (Some(lower), Some(upper)) = (left.compare(low, kind), left.compare(high, kind))
            else {
                return Ok(false);
            };
            let inside = lower != Ordering::Less && upper != Ordering::Greater;
            Ok(if op == CompareOp::Between { inside } else { !inside })
        }

        CompareOp::In | CompareOp::NotIn => {
            if left.is_null() {
                return Ok(false);
            }
            let values = match param {
                Param::Array(values) => values.clone(),
                Param::SubQuery(spec) => sub_query(spec)?,
                _ => {
                    return Err(ExecError::query(format!(
                        "operator {} requires an array or sub-query parameter",
                        op.name()
                    )));
                }
            };
            let contained = values.iter().any(|v| left.equals(v, kind));
            Ok(if op == CompareOp::In { contained } else { !contained })
        }
    }
}

/// Evaluate a parameter to a single scalar in the context of one row.
pub(crate) fn scalar_param(
    param: &Param,
    row: &QueryRow,
    registry: &Registry,
    sub_query: &SubQueryExec<'_>,
) -> Result<Value, ExecError> {
    match param {
        Param::Constant(value) => Ok(value.clone()),
        Param::Column { entity, field } => Ok(row
            .get(&cell_key(entity, field))
            .cloned()
            .unwrap_or(Value::Null)),
        Param::Function { name, args } => scalar_function(name, args, row, registry, sub_query),
        Param::SubQuery(spec) => Ok(sub_query(spec)?.into_iter().next().unwrap_or(Value::Null)),
        Param::Range { .. } | Param::Array(_) => Err(ExecError::query(format!(
            "{} parameter is not scalar",
            param.variant_name()
        ))),
    }
}

/// The scalar functions the reference backend understands.
fn scalar_function(
    name: &str,
    args: &[Param],
    row: &QueryRow,
    registry: &Registry,
    sub_query: &SubQueryExec<'_>,
) -> Result<Value, ExecError> {
    let arg = |index: usize| -> Result<Value, ExecError> {
        let param = args
            .get(index)
            .ok_or_else(|| ExecError::query(format!("function '{name}' is missing argument {index}")))?;
        scalar_param(param, row, registry, sub_query)
    };

    match name.to_ascii_lowercase().as_str() {
        "lower" => Ok(match arg(0)? {
            Value::Text(s) => Value::Text(s.to_lowercase()),
            other => other,
        }),
        "upper" => Ok(match arg(0)? {
            Value::Text(s) => Value::Text(s.to_uppercase()),
            other => other,
        }),
        "trim" => Ok(match arg(0)? {
            Value::Text(s) => Value::Text(s.trim().to_string()),
            other => other,
        }),
        "length" => Ok(match arg(0)? {
            Value::Text(s) => Value::Int(s.chars().count() as i64),
            Value::Bytes(b) => Value::Int(b.len() as i64),
            Value::Null => Value::Null,
            other => {
                return Err(ExecError::query(format!(
                    "length() is not defined for {}",
                    other.variant_name()
                )));
            }
        }),
        "abs" => Ok(match arg(0)? {
            Value::Int(n) => Value::Int(n.abs()),
            Value::Decimal(d) => Value::Decimal(d.abs()),
            Value::Null => Value::Null,
            other => {
                return Err(ExecError::query(format!(
                    "abs() is not defined for {}",
                    other.variant_name()
                )));
            }
        }),
        "coalesce" => {
            for index in 0..args.len() {
                let value = arg(index)?;
                if !value.is_null() {
                    return Ok(value);
                }
            }
            Ok(Value::Null)
        }
        other => Err(ExecError::query(format!("unknown scalar function '{other}'"))),
    }
}

/// SQL LIKE matching: `%` matches any run, `_` matches one character.
pub(crate) fn like_match(pattern: &str, text: &str) -> Result<bool, ExecError> {
    let mut translated = String::with_capacity(pattern.len() + 4);
    translated.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => translated.push_str(".*"),
            '_' => translated.push('.'),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');

    let re = Regex::new(&translated)
        .map_err(|e| ExecError::query(format!("invalid LIKE pattern '{pattern}': {e}")))?;
    Ok(re.is_match(text))
}
