//! Label-selector matching: `matchLabels` exact-match conjunction plus
//! `matchExpressions` with `In` / `NotIn` / `Exists` / `DoesNotExist`.
//! `NotIn` and `DoesNotExist` are satisfied by an absent key. An empty
//! selector matches nothing; callers pass a guard when they want catch-all.

use serde_json::{Map, Value};

use crate::convert::{as_list, as_object, as_str, Reason};

pub fn match_labels(
    labels: &Map<String, Value>,
    selector: &Map<String, Value>,
) -> Result<bool, Reason> {
    let match_labels = selector.get("matchLabels").and_then(|v| v.as_object());
    let match_exprs = selector.get("matchExpressions").and_then(|v| v.as_array());

    let empty = match_labels.map_or(true, |m| m.is_empty())
        && match_exprs.map_or(true, |e| e.is_empty());
    if empty {
        return Ok(false);
    }

    if let Some(wanted) = match_labels {
        for (key, want) in wanted {
            let want = as_str(want)?;
            match labels.get(key) {
                Some(have) if as_str(have)? == want => {}
                _ => return Ok(false),
            }
        }
    }

    if let Some(exprs) = match_exprs {
        for expr in exprs {
            let expr = as_object(expr)?;
            let key = as_str(expr.get("key").unwrap_or(&Value::Null))
                .map_err(|_| "selector expression requires a key".to_string())?;
            let op = as_str(expr.get("operator").unwrap_or(&Value::Null))
                .map_err(|_| "selector expression requires an operator".to_string())?;
            let have = match labels.get(key) {
                Some(v) => Some(as_str(v)?),
                None => None,
            };
            let matched = match op {
                "In" => match have {
                    Some(have) => values_of(expr)?.iter().any(|v| v == have),
                    None => false,
                },
                "NotIn" => match have {
                    Some(have) => !values_of(expr)?.iter().any(|v| v == have),
                    None => true,
                },
                "Exists" => have.is_some(),
                "DoesNotExist" => have.is_none(),
                other => return Err(format!("unknown selector operator {other:?}")),
            };
            if !matched {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

fn values_of(expr: &Map<String, Value>) -> Result<Vec<String>, Reason> {
    let values = expr
        .get("values")
        .ok_or_else(|| "selector operator requires values".to_string())?;
    as_list(values)?
        .iter()
        .map(|v| as_str(v).map(str::to_string))
        .collect()
}
