//! Operand coercion, arithmetic, comparison and concatenation.
//!
//! Coercion order for numeric operators: numbers pass through, booleans
//! become 0 or 1, strings must have the strict numeric shape, anything else
//! is an error.

use crate::domain::ast::{ArithOp, CmpOp};
use crate::domain::decimal::Decimal;
use crate::domain::value::{Node, ObjectRef, Value};
use crate::errors::EvalError;
use shared_types::Mci;
use std::cmp::Ordering;

/// Coerces an operand of a numeric operator.
pub fn to_number(v: &Value) -> Result<Decimal, EvalError> {
    match v {
        Value::Number(d) => Ok(*d),
        Value::Bool(b) => Ok(if *b { Decimal::ONE } else { Decimal::ZERO }),
        Value::Str(s) => {
            Decimal::parse_strict(s).ok_or_else(|| EvalError::failed(format!("not a number: {s}")))
        }
        Value::Object(_) => Err(EvalError::failed("object in arithmetic")),
    }
}

/// Coerces to a non-negative integer that fits `u32`.
pub fn to_small_int(v: &Value, what: &str) -> Result<u32, EvalError> {
    let d = to_number(v)?;
    d.to_i64()
        .filter(|_| d.is_integer())
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| EvalError::failed(format!("{what} must be a non-negative integer")))
}

/// Coerces to a main chain index.
pub fn to_mci(v: &Value, what: &str) -> Result<Mci, EvalError> {
    let d = to_number(v)?;
    d.to_i64()
        .filter(|_| d.is_integer())
        .and_then(|i| Mci::try_from(i).ok())
        .ok_or_else(|| EvalError::failed(format!("{what} must be a non-negative integer")))
}

/// Applies a binary arithmetic operator.
pub fn binary(op: ArithOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let a = to_number(lhs)?;
    let b = to_number(rhs)?;
    let r = match op {
        ArithOp::Add => a.checked_add(b)?,
        ArithOp::Sub => a.checked_sub(b)?,
        ArithOp::Mul => a.checked_mul(b)?,
        ArithOp::Div => a.checked_div(b)?,
        ArithOp::Rem => a.checked_rem(b)?,
        ArithOp::Pow => a.checked_pow(b)?,
    };
    Ok(Value::Number(r))
}

/// Evaluates a comparison.
pub fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, EvalError> {
    let equality_only = |what: &str| {
        if matches!(op, CmpOp::Eq | CmpOp::Ne) {
            Ok(())
        } else {
            Err(EvalError::failed(format!("{what} can only be compared for equality")))
        }
    };
    let ordering = match (lhs, rhs) {
        (Value::Object(_), _) | (_, Value::Object(_)) => {
            equality_only("objects")?;
            if lhs.to_json() == rhs.to_json() {
                Ordering::Equal
            } else {
                Ordering::Less
            }
        }
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => {
            equality_only("booleans")?;
            a.cmp(b)
        }
        _ => to_number(lhs)?.cmp(&to_number(rhs)?),
    };
    Ok(op.holds(ordering))
}

/// `||`: strings concatenate; from the second upgrade on, two arrays
/// append and two maps merge with the right side winning.
pub fn concat(lhs: Value, rhs: Value, objects_allowed: bool, max_len: usize) -> Result<Value, EvalError> {
    match (lhs, rhs) {
        (Value::Object(a), Value::Object(b)) => {
            if !objects_allowed {
                return Err(EvalError::failed("object concatenation is not activated"));
            }
            let merged = match (a.into_node(), b.into_node()) {
                (Node::Array(mut x), Node::Array(y)) => {
                    x.extend(y);
                    Node::Array(x)
                }
                (Node::Map(mut x), Node::Map(y)) => {
                    x.extend(y);
                    Node::Map(x)
                }
                _ => return Err(EvalError::failed("cannot concatenate an array and a map")),
            };
            Ok(Value::Object(ObjectRef::new(merged)))
        }
        (Value::Object(_), _) | (_, Value::Object(_)) => {
            Err(EvalError::failed("cannot concatenate an object and a scalar"))
        }
        (a, b) => {
            let s = a.to_text() + &b.to_text();
            check_len(&s, max_len)?;
            Ok(Value::Str(s))
        }
    }
}

/// Rejects strings longer than the engine allows.
pub fn check_len(s: &str, max_len: usize) -> Result<(), EvalError> {
    if s.len() > max_len {
        return Err(EvalError::failed(format!("string longer than {max_len} bytes")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn n(s: &str) -> Value {
        Value::Number(s.parse().unwrap())
    }

    #[test]
    fn test_mci_beyond_u32() {
        assert_eq!(to_mci(&n("5000000000"), "min_mci").unwrap(), 5_000_000_000);
        assert!(to_mci(&n("-1"), "min_mci").is_err());
        assert!(to_mci(&n("1.5"), "min_mci").is_err());
        assert!(to_small_int(&n("5000000000"), "n").is_err());
    }

    #[test]
    fn test_coercion_table() {
        assert_eq!(to_number(&Value::Bool(true)).unwrap(), Decimal::ONE);
        assert_eq!(to_number(&Value::from("2.5")).unwrap(), "2.5".parse().unwrap());
        assert!(to_number(&Value::from("2.5abc")).is_err());
        assert!(to_number(&Value::from(" 1")).is_err());
        assert!(to_number(&Value::from_json(&json!([1])).unwrap()).is_err());
    }

    #[test]
    fn test_binary_ops() {
        assert_eq!(binary(ArithOp::Add, &n("0.1"), &n("0.2")).unwrap(), n("0.3"));
        assert_eq!(binary(ArithOp::Add, &Value::Bool(true), &Value::from("2")).unwrap(), n("3"));
        assert!(binary(ArithOp::Div, &n("1"), &n("0")).is_err());
        assert_eq!(binary(ArithOp::Rem, &n("-7"), &n("3")).unwrap(), n("-1"));
    }

    #[test]
    fn test_compare() {
        assert!(compare(CmpOp::Lt, &Value::from("abc"), &Value::from("abd")).unwrap());
        assert!(compare(CmpOp::Eq, &n("10"), &Value::from("1e1")).unwrap());
        assert!(compare(CmpOp::Gt, &Value::Bool(true), &Value::Bool(false)).is_err());
        let a = Value::from_json(&json!({"x": 1})).unwrap();
        let b = Value::from_json(&json!({"x": 1})).unwrap();
        assert!(compare(CmpOp::Eq, &a, &b).unwrap());
        assert!(compare(CmpOp::Lt, &a, &b).is_err());
    }

    #[test]
    fn test_concat() {
        let s = concat(Value::from("a"), n("1"), true, 10).unwrap();
        assert_eq!(s, Value::from("a1"));
        assert!(concat(Value::from("abcdef"), Value::from("ghijk"), true, 10).is_err());

        let a = Value::from_json(&json!({"x": 1, "y": 1})).unwrap();
        let b = Value::from_json(&json!({"y": 2})).unwrap();
        assert_eq!(concat(a, b, true, 100).unwrap().to_json(), json!({"x": 1, "y": 2}));

        let arr = Value::from_json(&json!([1])).unwrap();
        assert!(concat(arr.clone(), arr, false, 100).is_err());
    }
}
