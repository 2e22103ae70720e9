//! Value coercions shared by the operators. Reasons are plain strings;
//! callers wrap them with the failing sub-expression.

use serde_json::{Map, Value};

pub type Reason = String;

pub fn as_bool(v: &Value) -> Result<bool, Reason> {
    v.as_bool().ok_or_else(|| format!("expected a boolean, got {v}"))
}

pub fn as_int(v: &Value) -> Result<i64, Reason> {
    v.as_i64().ok_or_else(|| format!("expected an integer, got {v}"))
}

pub fn as_float(v: &Value) -> Result<f64, Reason> {
    v.as_f64().ok_or_else(|| format!("expected a number, got {v}"))
}

pub fn as_str(v: &Value) -> Result<&str, Reason> {
    v.as_str().ok_or_else(|| format!("expected a string, got {v}"))
}

pub fn as_list(v: &Value) -> Result<&Vec<Value>, Reason> {
    v.as_array().ok_or_else(|| format!("expected a list, got {v}"))
}

pub fn as_object(v: &Value) -> Result<&Map<String, Value>, Reason> {
    v.as_object().ok_or_else(|| format!("expected a map, got {v}"))
}

pub fn as_bool_list(v: &Value) -> Result<Vec<bool>, Reason> {
    as_list(v)?.iter().map(as_bool).collect()
}

pub fn as_string_list(v: &Value) -> Result<Vec<String>, Reason> {
    as_list(v)?
        .iter()
        .map(|v| as_str(v).map(str::to_string))
        .collect()
}

/// A homogeneous numeric list: all-int64 stays integral, otherwise every
/// element is widened to float64.
pub enum Numbers {
    Ints(Vec<i64>),
    Floats(Vec<f64>),
}

pub fn as_number_list(v: &Value) -> Result<Numbers, Reason> {
    let items = as_list(v)?;
    if items.iter().all(|v| v.as_i64().is_some()) {
        return Ok(Numbers::Ints(items.iter().map(|v| v.as_i64().unwrap()).collect()));
    }
    items
        .iter()
        .map(as_float)
        .collect::<Result<Vec<_>, _>>()
        .map(Numbers::Floats)
}

/// An ordered-comparison operand pair, int-preserving when both sides are.
pub enum BinaryNumbers {
    Ints(i64, i64),
    Floats(f64, f64),
}

pub fn as_binary_numbers(v: &Value) -> Result<BinaryNumbers, Reason> {
    match as_number_list(v)? {
        Numbers::Ints(is) if is.len() == 2 => Ok(BinaryNumbers::Ints(is[0], is[1])),
        Numbers::Floats(fs) if fs.len() == 2 => Ok(BinaryNumbers::Floats(fs[0], fs[1])),
        _ => Err("expected 2 arguments".to_string()),
    }
}
