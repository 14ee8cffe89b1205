use serde_json::{Map, Number, Value};

use crate::RewardError;

/// Merges a progress delta into stored quest/challenge progress.
///
/// Objects merge key by key, integers add, floats add, anything else is
/// replaced by the delta value. A non-object target is reset to `{}` first.
///
/// # Errors
/// Returns [`RewardError::Validation`] when the delta is not an object or an
/// integer counter overflows.
pub fn merge_progress(target: &mut Value, delta: &Value) -> Result<(), RewardError> {
    let Value::Object(delta_map) = delta else {
        return Err(RewardError::Validation(
            "progress delta MUST be a JSON object".to_string(),
        ));
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target_map) = target else {
        return Ok(());
    };

    merge_maps(target_map, delta_map, "")
}

fn merge_maps(
    target: &mut Map<String, Value>,
    delta: &Map<String, Value>,
    path: &str,
) -> Result<(), RewardError> {
    for (key, incoming) in delta {
        let key_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };

        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                merge_maps(existing, nested, &key_path)?;
            }
            (Some(Value::Number(existing)), Value::Number(added)) => {
                let sum = add_numbers(existing, added, &key_path)?;
                target.insert(key.clone(), Value::Number(sum));
            }
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
    Ok(())
}

fn add_numbers(lhs: &Number, rhs: &Number, path: &str) -> Result<Number, RewardError> {
    if let (Some(left), Some(right)) = (lhs.as_i64(), rhs.as_i64()) {
        return left
            .checked_add(right)
            .map(Number::from)
            .ok_or_else(|| RewardError::Validation(format!("progress counter {path} overflowed")));
    }

    let (Some(left), Some(right)) = (lhs.as_f64(), rhs.as_f64()) else {
        return Err(RewardError::Validation(format!(
            "progress counter {path} is not numeric"
        )));
    };
    Number::from_f64(left + right)
        .ok_or_else(|| RewardError::Validation(format!("progress counter {path} is not finite")))
}
