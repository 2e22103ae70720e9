//! Vista expression engine: a JSON-embedded prefix-operator language
//! evaluated over unstructured documents.
//!
//! Expressions round-trip through JSON: scalars parse to terminal nodes
//! (`@bool`, `@int`, `@float`, `@string`), arrays to `@list`, objects to
//! `@dict`, and a single-key object whose key starts with `@` to an
//! operator invocation. Strings beginning with `$` are JSON paths.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

mod convert;
mod error;
mod eval;
pub mod path;
pub mod selector;

pub use error::Error;
pub use eval::EvalCtx;

/// A node of the expression tree: an operator with an optional child, or a
/// terminal carrying a literal.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub op: String,
    pub arg: Option<Box<Expression>>,
    pub literal: Option<Literal>,
}

/// Terminal payloads. Lists and maps hold sub-expressions, not values:
/// their elements are evaluated lazily by the consuming operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Scalar(Value),
    List(Vec<Expression>),
    Map(BTreeMap<String, Expression>),
}

impl Expression {
    pub fn terminal(op: &str, literal: Value) -> Self {
        Self { op: op.to_string(), arg: None, literal: Some(Literal::Scalar(literal)) }
    }

    pub fn op(op: &str, arg: Expression) -> Self {
        Self { op: op.to_string(), arg: Some(Box::new(arg)), literal: None }
    }

    /// Parse an expression from its JSON text.
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        let value: Value =
            serde_json::from_str(raw).map_err(|_| Error::Unmarshal { raw: raw.to_string() })?;
        Self::try_from(&value)
    }

    fn to_value(&self) -> Result<Value, Error> {
        match self.op.as_str() {
            "@bool" | "@int" | "@float" | "@string" => match &self.arg {
                // keep the op for a correct round-trip and the conversion side-effect
                Some(arg) => Ok(single(&self.op, arg.to_value()?)),
                None => match &self.literal {
                    Some(Literal::Scalar(v)) => Ok(v.clone()),
                    _ => Err(Error::Eval {
                        expr: self.op.clone(),
                        reason: "terminal without a scalar literal".to_string(),
                    }),
                },
            },
            "@list" => match &self.arg {
                Some(arg) => arg.to_value(),
                None => match &self.literal {
                    Some(Literal::List(items)) => Ok(Value::Array(
                        items.iter().map(|e| e.to_value()).collect::<Result<_, _>>()?,
                    )),
                    _ => Err(Error::Eval {
                        expr: self.op.clone(),
                        reason: "expected an expression list".to_string(),
                    }),
                },
            },
            "@dict" => match &self.arg {
                Some(arg) => arg.to_value(),
                None => match &self.literal {
                    Some(Literal::Map(entries)) => {
                        let mut out = Map::new();
                        for (k, e) in entries {
                            out.insert(k.clone(), e.to_value()?);
                        }
                        Ok(Value::Object(out))
                    }
                    _ => Err(Error::Eval {
                        expr: self.op.clone(),
                        reason: "expected an expression map".to_string(),
                    }),
                },
            },
            op => {
                if !op.starts_with('@') {
                    return Err(Error::Eval {
                        expr: op.to_string(),
                        reason: "expected an op starting with @".to_string(),
                    });
                }
                let arg = match &self.arg {
                    Some(arg) => arg.to_value()?,
                    None => Value::Null,
                };
                Ok(single(op, arg))
            }
        }
    }
}

fn single(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

impl TryFrom<&Value> for Expression {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self, Error> {
        match value {
            Value::Bool(b) => Ok(Expression::terminal("@bool", Value::Bool(*b))),
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    Ok(Expression::terminal("@int", value.clone()))
                } else {
                    Ok(Expression::terminal("@float", value.clone()))
                }
            }
            Value::String(s) if !s.is_empty() => {
                Ok(Expression::terminal("@string", value.clone()))
            }
            Value::Array(items) => {
                let exprs =
                    items.iter().map(Expression::try_from).collect::<Result<Vec<_>, _>>()?;
                Ok(Expression {
                    op: "@list".to_string(),
                    arg: None,
                    literal: Some(Literal::List(exprs)),
                })
            }
            Value::Object(map) => {
                // an op is a single key that starts with @
                if map.len() == 1 {
                    let (key, inner) = map.iter().next().unwrap();
                    if key.starts_with('@') {
                        return Ok(Expression::op(key, Expression::try_from(inner)?));
                    }
                }
                let mut entries = BTreeMap::new();
                for (k, v) in map {
                    entries.insert(k.clone(), Expression::try_from(v)?);
                }
                Ok(Expression {
                    op: "@dict".to_string(),
                    arg: None,
                    literal: Some(Literal::Map(entries)),
                })
            }
            _ => Err(Error::Unmarshal { raw: value.to_string() }),
        }
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().map_err(S::Error::custom)?.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Expression::try_from(&value).map_err(D::Error::custom)
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_value() {
            Ok(v) => f.write_str(&v.to_string()),
            Err(_) => f.write_str("<invalid>"),
        }
    }
}
