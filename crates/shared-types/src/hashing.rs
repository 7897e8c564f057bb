//! # Canonical Hashing
//!
//! Canonical JSON (sorted keys, no whitespace) and the hashes derived from it.
//! Unit hashes, AA addresses and `chash160` values all go through here so that
//! every node computes byte-identical results.

use crate::entities::{Address, Unit, UnitHash};
use crate::errors::LedgerError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Serializes a JSON value with object keys sorted and no whitespace.
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Canonical JSON of any serializable value.
///
/// # Errors
///
/// Returns `LedgerError::Serialization` if `value` cannot be represented as JSON.
pub fn canonical_json_of<T: Serialize>(value: &T) -> Result<String, LedgerError> {
    let json = serde_json::to_value(value).map_err(|e| LedgerError::Serialization(e.to_string()))?;
    Ok(canonical_json(&json))
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Lowercase hex SHA-256.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// 160-bit checksummed hash rendered as a 32-character address.
#[must_use]
pub fn chash160(value: &serde_json::Value) -> Address {
    let digest = Sha256::digest(canonical_json(value).as_bytes());
    let mut s = String::with_capacity(32);
    for byte in &digest[..16] {
        let _ = write!(s, "{byte:02X}");
    }
    Address::new(s)
}

/// Address of an address definition.
#[must_use]
pub fn address_from_definition(definition: &serde_json::Value) -> Address {
    chash160(definition)
}

/// Hash of a unit over its canonical form without the `unit` field.
///
/// # Errors
///
/// Returns `LedgerError::Serialization` if the unit cannot be serialized.
pub fn compute_unit_hash(unit: &Unit) -> Result<UnitHash, LedgerError> {
    let mut json = serde_json::to_value(unit).map_err(|e| LedgerError::Serialization(e.to_string()))?;
    if let serde_json::Value::Object(map) = &mut json {
        map.remove("unit");
    }
    Ok(UnitHash::new(sha256_hex(canonical_json(&json).as_bytes())))
}
