//! Pure builtin functions.
//!
//! Everything here depends only on its arguments. Builtins that read the
//! ledger (`is_valid_signed_package` when a definition is not inlined) are
//! dispatched by the evaluator itself.

use super::arith::{check_len, to_number};
use crate::domain::ast::Builtin;
use crate::domain::decimal::Decimal;
use crate::domain::value::{Node, ObjectRef, Value};
use crate::errors::EvalError;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};
use shared_types::{chash160, is_valid_address, sha256_hex, MAX_CAP};

/// Calls a builtin on evaluated arguments. Arity was checked by the validator.
pub fn call(func: Builtin, args: &[Value], max_len: usize) -> Result<Value, EvalError> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Bool(false));
    let text = |i: usize| arg(i).to_text();
    let result = match func {
        Builtin::Sha256 => {
            if args.len() > 1 && text(1) != "hex" {
                return Err(EvalError::failed(format!("unsupported sha256 format {}", text(1))));
            }
            Value::Str(sha256_hex(text(0).as_bytes()))
        }
        Builtin::Chash160 => Value::Str(chash160(&arg(0).to_json()).as_str().to_string()),
        Builtin::IsValidSig => Value::Bool(is_valid_sig(&text(0), &text(1), &text(2))),
        Builtin::IsValidMerkleProof => Value::Bool(is_valid_merkle_proof(&text(0), &arg(1))),
        Builtin::IsValidSignedPackage => {
            return Err(EvalError::failed("is_valid_signed_package needs ledger access"))
        }
        Builtin::JsonParse => match serde_json::from_str::<serde_json::Value>(&text(0)) {
            Ok(json) => Value::from_json(&json)?,
            Err(_) => Value::Bool(false),
        },
        Builtin::JsonStringify => Value::Str(arg(0).canonical_json()),
        Builtin::Typeof => Value::from(arg(0).type_name()),
        Builtin::Length => Value::Number(Decimal::from(count(text(0).chars().count()))),
        Builtin::ToUpper => Value::Str(text(0).to_uppercase()),
        Builtin::ToLower => Value::Str(text(0).to_lowercase()),
        Builtin::Substring => substring(&text(0), &arg(1), args.get(2))?,
        Builtin::IndexOf => {
            let (s, sub) = (text(0), text(1));
            let pos = s.find(&sub).map_or(-1, |byte| count(s[..byte].chars().count()));
            Value::Number(Decimal::from(pos))
        }
        Builtin::StartsWith => Value::Bool(text(0).starts_with(&text(1))),
        Builtin::EndsWith => Value::Bool(text(0).ends_with(&text(1))),
        Builtin::Contains => Value::Bool(text(0).contains(&text(1))),
        Builtin::Split => {
            let (s, sep) = (text(0), text(1));
            let mut parts: Vec<Node> = if sep.is_empty() {
                s.chars().map(|c| Node::Str(c.to_string())).collect()
            } else {
                s.split(sep.as_str()).map(|p| Node::Str(p.to_string())).collect()
            };
            if let Some(limit) = args.get(2) {
                parts.truncate(super::arith::to_small_int(limit, "split limit")? as usize);
            }
            object(Node::Array(parts))
        }
        Builtin::Join => {
            let Value::Object(o) = arg(0) else {
                return Err(EvalError::failed("join expects an array"));
            };
            let Node::Array(items) = o.node() else {
                return Err(EvalError::failed("join expects an array"));
            };
            let parts = items
                .iter()
                .map(|item| match item {
                    Node::Array(_) | Node::Map(_) => Err(EvalError::failed("join of nested objects")),
                    scalar => Ok(Value::from_node(scalar.clone()).to_text()),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Value::Str(parts.join(&text(1)))
        }
        Builtin::Replace => Value::Str(text(0).replace(&text(1), &text(2))),
        Builtin::HasOnly => {
            let allowed = text(1);
            Value::Bool(text(0).chars().all(|c| allowed.contains(c)))
        }
        Builtin::ParseDate => parse_date(&text(0)),
        Builtin::TimestampToString => {
            let format = if args.len() > 1 { text(1) } else { "datetime".to_string() };
            timestamp_to_string(&arg(0), &format)?
        }
        Builtin::IsValidAddress => Value::Bool(is_valid_address(&text(0))),
        Builtin::IsInteger => Value::Bool(matches!(arg(0), Value::Number(d) if d.is_integer())),
        Builtin::IsValidAmount => Value::Bool(matches!(
            arg(0),
            Value::Number(d) if d.is_integer() && d.to_i64().is_some_and(|i| i > 0 && i <= MAX_CAP)
        )),
        Builtin::NumberFromSeed => number_from_seed(&text(0), args.get(1), args.get(2))?,
        Builtin::Exists => Value::Bool(arg(0) != Value::Bool(false)),
        Builtin::IsArray => Value::Bool(matches!(arg(0), Value::Object(o) if matches!(o.node(), Node::Array(_)))),
        Builtin::IsAssoc => Value::Bool(matches!(arg(0), Value::Object(o) if matches!(o.node(), Node::Map(_)))),
        Builtin::ArrayLength => match arg(0) {
            Value::Object(o) => match o.node() {
                Node::Array(items) => Value::Number(Decimal::from(count(items.len()))),
                _ => return Err(EvalError::failed("array_length of a map")),
            },
            _ => return Err(EvalError::failed("array_length of a scalar")),
        },
        Builtin::Keys => match arg(0) {
            Value::Object(o) => match o.node() {
                Node::Map(map) => object(Node::Array(map.keys().cloned().map(Node::Str).collect())),
                _ => return Err(EvalError::failed("keys of an array")),
            },
            _ => return Err(EvalError::failed("keys of a scalar")),
        },
        Builtin::Reverse => match arg(0) {
            Value::Object(o) => match o.into_node() {
                Node::Array(mut items) => {
                    items.reverse();
                    object(Node::Array(items))
                }
                _ => return Err(EvalError::failed("reverse of a map")),
            },
            _ => return Err(EvalError::failed("reverse of a scalar")),
        },
    };
    if let Value::Str(s) = &result {
        check_len(s, max_len)?;
    }
    Ok(result)
}

fn object(node: Node) -> Value {
    Value::Object(ObjectRef::new(node))
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn substring(s: &str, start: &Value, length: Option<&Value>) -> Result<Value, EvalError> {
    let chars: Vec<char> = s.chars().collect();
    let len = count(chars.len());
    let start = to_number(start)?
        .to_i64()
        .ok_or_else(|| EvalError::failed("substring start must be an integer"))?;
    let from = if start < 0 { (len + start).max(0) } else { start.min(len) };
    let to = match length {
        Some(l) => {
            let l = to_number(l)?
                .to_i64()
                .ok_or_else(|| EvalError::failed("substring length must be an integer"))?;
            (from + l.max(0)).min(len)
        }
        None => len,
    };
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let slice: String = chars[from as usize..to as usize].iter().collect();
    Ok(Value::Str(slice))
}

/// Verifies an ECDSA secp256k1 signature over `sha256(message)`.
/// Key and signature are hex: compressed SEC1 key, 64-byte compact signature.
#[must_use]
pub fn is_valid_sig(message: &str, pubkey_hex: &str, sig_hex: &str) -> bool {
    let (Ok(key), Ok(sig)) = (hex::decode(pubkey_hex), hex::decode(sig_hex)) else {
        return false;
    };
    let (Ok(key), Ok(sig)) = (VerifyingKey::from_sec1_bytes(&key), Signature::from_slice(&sig)) else {
        return false;
    };
    let digest = Sha256::digest(message.as_bytes());
    key.verify_prehash(&digest, &sig).is_ok()
}

/// Checks a proof `{root, siblings, index}` for `element`.
///
/// The leaf is `sha256(element)`; at each level the running hash is paired
/// with a sibling (left when the index bit is 0) and hashed again.
#[must_use]
pub fn is_valid_merkle_proof(element: &str, proof: &Value) -> bool {
    let json = match proof {
        Value::Object(_) => proof.to_json(),
        Value::Str(s) => match serde_json::from_str(s) {
            Ok(json) => json,
            Err(_) => return false,
        },
        _ => return false,
    };
    let (Some(root), Some(siblings), Some(mut index)) = (
        json.get("root").and_then(|r| r.as_str()),
        json.get("siblings").and_then(|s| s.as_array()),
        json.get("index").and_then(serde_json::Value::as_u64),
    ) else {
        return false;
    };
    let mut hash = sha256_hex(element.as_bytes());
    for sibling in siblings {
        let Some(sibling) = sibling.as_str() else {
            return false;
        };
        hash = if index & 1 == 0 {
            sha256_hex(format!("{hash}{sibling}").as_bytes())
        } else {
            sha256_hex(format!("{sibling}{hash}").as_bytes())
        };
        index >>= 1;
    }
    hash == root
}

fn parse_date(s: &str) -> Value {
    let seconds = DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp())
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").map(|dt| dt.and_utc().timestamp()))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc().timestamp()))
        .or_else(|_| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).map_or(0, |dt| dt.and_utc().timestamp()))
        });
    match seconds {
        Ok(ts) => Value::Number(Decimal::from(ts)),
        Err(_) => Value::Bool(false),
    }
}

fn timestamp_to_string(ts: &Value, format: &str) -> Result<Value, EvalError> {
    let secs = to_number(ts)?
        .to_i64()
        .ok_or_else(|| EvalError::failed("timestamp must be an integer"))?;
    let dt = DateTime::from_timestamp(secs, 0).ok_or_else(|| EvalError::failed("timestamp out of range"))?;
    let pattern = match format {
        "datetime" => "%Y-%m-%dT%H:%M:%SZ",
        "date" => "%Y-%m-%d",
        "time" => "%H:%M:%S",
        other => return Err(EvalError::failed(format!("unknown timestamp format {other}"))),
    };
    Ok(Value::Str(dt.format(pattern).to_string()))
}

/// Deterministic pseudo-random number: the first 8 bytes of `sha256(seed)`
/// as a big-endian integer, mapped into `[0, 1)` or an integer range.
pub fn number_from_seed(seed: &str, a: Option<&Value>, b: Option<&Value>) -> Result<Value, EvalError> {
    let digest = Sha256::digest(seed.as_bytes());
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    let n = u64::from_be_bytes(first);

    let bound = |v: &Value| {
        to_number(v)?
            .to_i64()
            .ok_or_else(|| EvalError::failed("number_from_seed bounds must be integers"))
    };
    let (min, max) = match (a, b) {
        (None, _) => {
            let fraction = format!("0.{:015}", n % 1_000_000_000_000_000);
            return Ok(Value::Number(fraction.parse()?));
        }
        (Some(max), None) => (0, bound(max)?),
        (Some(min), Some(max)) => (bound(min)?, bound(max)?),
    };
    if max < min {
        return Err(EvalError::failed("number_from_seed: max below min"));
    }
    let span = u64::try_from(i128::from(max) - i128::from(min) + 1)
        .map_err(|_| EvalError::failed("number_from_seed range too large"))?;
    let offset = i64::try_from(n % span).map_err(|_| EvalError::failed("number_from_seed range too large"))?;
    Ok(Value::Number(Decimal::from(min + offset)))
}
