//! Declarative condition evaluation against event payloads.
//!
//! A condition tree is a nested JSON object. Leaf keys are dotted paths into
//! the payload; leaf values are either a literal (strict equality) or an
//! operator object (`$gt`, `$in`, `$regex`, ...). `$and` / `$or` combine
//! sibling sub-trees.
//!
//! Evaluation is total and side-effect free: malformed trees, bad regexes
//! and type mismatches all resolve to `false`, never an error.

use serde_json::Value;

/// Evaluate a condition tree against a payload. Never panics or errors.
///
/// An empty condition object matches everything.
pub fn evaluate(conditions: &Value, payload: &Value) -> bool {
    let Some(map) = conditions.as_object() else {
        // Only object trees are meaningful; anything else fails closed.
        return false;
    };

    map.iter().all(|(key, expected)| match key.as_str() {
        "$and" => expected
            .as_array()
            .map(|subs| subs.iter().all(|sub| evaluate(sub, payload)))
            .unwrap_or(false),
        "$or" => expected
            .as_array()
            .map(|subs| subs.iter().any(|sub| evaluate(sub, payload)))
            .unwrap_or(false),
        path => {
            let actual = lookup_path(payload, path);
            match expected.as_object() {
                Some(ops) if ops.keys().any(|k| k.starts_with('$')) => ops
                    .iter()
                    .all(|(op, operand)| apply_operator(op, operand, actual)),
                _ => actual.map(|v| v == expected).unwrap_or(false),
            }
        }
    })
}

/// Resolve a dotted path (`"channel.name"`) against a JSON value.
fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn apply_operator(op: &str, operand: &Value, actual: Option<&Value>) -> bool {
    match op {
        "$eq" => actual.map(|v| v == operand).unwrap_or(false),
        "$ne" => actual.map(|v| v != operand).unwrap_or(true),
        "$gt" => compare(actual, operand).map(|o| o.is_gt()).unwrap_or(false),
        "$gte" => compare(actual, operand).map(|o| o.is_ge()).unwrap_or(false),
        "$lt" => compare(actual, operand).map(|o| o.is_lt()).unwrap_or(false),
        "$lte" => compare(actual, operand).map(|o| o.is_le()).unwrap_or(false),
        "$in" => match (actual, operand.as_array()) {
            (Some(v), Some(candidates)) => candidates.contains(v),
            _ => false,
        },
        "$nin" => match operand.as_array() {
            Some(candidates) => actual.map(|v| !candidates.contains(v)).unwrap_or(true),
            None => false,
        },
        "$contains" => match actual {
            Some(Value::String(s)) => operand.as_str().map(|n| s.contains(n)).unwrap_or(false),
            Some(Value::Array(items)) => items.contains(operand),
            _ => false,
        },
        "$regex" => match (actual.and_then(Value::as_str), operand.as_str()) {
            (Some(s), Some(pattern)) => regex::Regex::new(pattern)
                .map(|re| re.is_match(s))
                .unwrap_or(false),
            _ => false,
        },
        // Unknown operators fail closed.
        _ => false,
    }
}

/// Ordering between a payload value and an operand, where one exists.
fn compare(actual: Option<&Value>, operand: &Value) -> Option<std::cmp::Ordering> {
    let actual = actual?;
    match (actual, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}
