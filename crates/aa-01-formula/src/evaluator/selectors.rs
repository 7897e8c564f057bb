//! Reading, writing and deleting along selector paths inside objects.

use super::arith::to_number;
use crate::domain::value::{Node, Value};
use crate::errors::EvalError;

fn index_of(key: &Value) -> Option<usize> {
    let d = to_number(key).ok()?;
    if !d.is_integer() || d.is_negative() {
        return None;
    }
    d.to_i64().and_then(|i| usize::try_from(i).ok())
}

fn child<'n>(node: &'n Node, key: &Value) -> Option<&'n Node> {
    match node {
        Node::Array(items) => index_of(key).and_then(|i| items.get(i)),
        Node::Map(map) => map.get(&key.to_text()),
        _ => None,
    }
}

/// Follows `keys` from `value`. Any missing step yields `false`.
#[must_use]
pub fn get(value: &Value, keys: &[Value]) -> Value {
    if keys.is_empty() {
        return value.clone();
    }
    let Value::Object(o) = value else {
        return Value::Bool(false);
    };
    let mut node = o.node();
    for key in keys {
        match child(node, key) {
            Some(next) => node = next,
            None => return Value::Bool(false),
        }
    }
    Value::from_node(node.clone())
}

fn vivify(next: Option<&Value>) -> Node {
    match next {
        None | Some(Value::Number(_)) => Node::Array(Vec::new()),
        Some(_) => Node::Map(Default::default()),
    }
}

/// Writes `new` at `path` below `node`. `None` in the path appends to an
/// array. Missing containers are created from the type of the next key;
/// arrays only grow by one slot at a time. On error `node` is unchanged.
pub fn set(node: &mut Node, path: &[Option<Value>], new: Node) -> Result<(), EvalError> {
    let mut draft = node.clone();
    set_in(&mut draft, path, new)?;
    *node = draft;
    Ok(())
}

fn set_in(node: &mut Node, path: &[Option<Value>], new: Node) -> Result<(), EvalError> {
    let Some((first, rest)) = path.split_first() else {
        *node = new;
        return Ok(());
    };
    let fresh = || if rest.is_empty() { new.clone() } else { vivify(rest[0].as_ref()) };
    let slot: &mut Node = match (node, first) {
        (Node::Array(items), None) => {
            items.push(fresh());
            items.last_mut().ok_or_else(|| EvalError::failed("append failed"))?
        }
        (Node::Array(items), Some(key)) => {
            let i = index_of(key).ok_or_else(|| EvalError::failed(format!("bad array index {}", key.to_text())))?;
            match i.cmp(&items.len()) {
                std::cmp::Ordering::Less => &mut items[i],
                std::cmp::Ordering::Equal => {
                    items.push(fresh());
                    &mut items[i]
                }
                std::cmp::Ordering::Greater => {
                    return Err(EvalError::failed(format!("index {i} would leave a gap in the array")))
                }
            }
        }
        (Node::Map(map), Some(key)) => map.entry(key.to_text()).or_insert_with(fresh),
        (Node::Map(_), None) => return Err(EvalError::failed("cannot append to a map")),
        _ => return Err(EvalError::failed("selector applied to a scalar")),
    };
    if rest.is_empty() {
        *slot = new;
        Ok(())
    } else {
        set_in(slot, rest, new)
    }
}

/// Removes `key` from the container at `path`. Missing entries are ignored.
pub fn delete(node: &mut Node, path: &[Value], key: &Value) -> Result<(), EvalError> {
    let mut target = node;
    for step in path {
        target = match target {
            Node::Array(items) => match index_of(step).and_then(|i| items.get_mut(i)) {
                Some(next) => next,
                None => return Ok(()),
            },
            Node::Map(map) => match map.get_mut(&step.to_text()) {
                Some(next) => next,
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
    }
    match target {
        Node::Array(items) => {
            if let Some(i) = index_of(key).filter(|i| *i < items.len()) {
                items.remove(i);
            }
            Ok(())
        }
        Node::Map(map) => {
            map.remove(&key.to_text());
            Ok(())
        }
        _ => Err(EvalError::failed("delete from a scalar")),
    }
}
