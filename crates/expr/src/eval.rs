//! Expression evaluation.

use serde_json::{Map, Value};
use tracing::trace;

use crate::convert::{
    as_binary_numbers, as_bool, as_bool_list, as_float, as_int, as_list, as_object, as_str,
    as_string_list, as_number_list, BinaryNumbers, Numbers,
};
use crate::{path, selector, Error, Expression, Literal};

/// Evaluation context. `object` is the full top-level document; `subject`
/// is the element bound by the innermost higher-order operator. JSON paths
/// resolve against the subject when one is bound, else against the object.
#[derive(Clone, Copy)]
pub struct EvalCtx<'a> {
    pub object: &'a Value,
    pub subject: Option<&'a Value>,
}

impl<'a> EvalCtx<'a> {
    pub fn new(object: &'a Value) -> Self {
        Self { object, subject: None }
    }

    fn with_subject(&self, subject: &'a Value) -> Self {
        Self { object: self.object, subject: Some(subject) }
    }

    fn root(&self) -> &'a Value {
        self.subject.unwrap_or(self.object)
    }
}

impl Expression {
    /// Evaluate the expression against a context. Errors carry the failing
    /// sub-expression and abort the whole evaluation.
    pub fn evaluate(&self, ctx: EvalCtx) -> Result<Value, Error> {
        let v = self.eval(ctx)?;
        trace!(expression = %self, result = %v, "eval ready");
        Ok(v)
    }

    fn eval(&self, ctx: EvalCtx) -> Result<Value, Error> {
        if self.op.is_empty() {
            return Err(Error::invalid_arguments(self, "empty operator"));
        }

        match self.op.as_str() {
            "@bool" => {
                let lit = self.arg_or_literal(ctx)?;
                let v = as_bool(&lit).map_err(|r| Error::eval(self, r))?;
                return Ok(Value::Bool(v));
            }
            "@int" => {
                let lit = self.arg_or_literal(ctx)?;
                let v = as_int(&lit).map_err(|r| Error::eval(self, r))?;
                return Ok(Value::from(v));
            }
            "@float" => {
                let lit = self.arg_or_literal(ctx)?;
                let v = as_float(&lit).map_err(|r| Error::eval(self, r))?;
                return Ok(Value::from(v));
            }
            "@string" => {
                let lit = self.arg_or_literal(ctx)?;
                let s = as_str(&lit).map_err(|r| Error::eval(self, r))?;
                // a leading $ makes the string a JSON path
                if s.starts_with('$') {
                    let steps = path::parse(s)?;
                    return Ok(path::get(ctx.root(), &steps));
                }
                return Ok(lit.clone());
            }
            "@list" => {
                let items: Vec<Value> = match &self.arg {
                    Some(arg) => match arg.evaluate(ctx)? {
                        Value::Array(vs) => vs,
                        _ => return Err(Error::eval(self, "argument must be a list")),
                    },
                    None => match &self.literal {
                        Some(Literal::List(exprs)) => exprs
                            .iter()
                            .map(|e| e.evaluate(ctx))
                            .collect::<Result<_, _>>()?,
                        _ => {
                            return Err(Error::eval(self, "argument must be an expression list"))
                        }
                    },
                };
                // WARNING: one level of nesting is unpacked; this flattens
                // @map outputs into a single stream but destroys 2-D lists
                return Ok(Value::Array(unpack_list(items)));
            }
            "@dict" => match &self.arg {
                Some(arg) => {
                    let v = arg.evaluate(ctx)?;
                    if !v.is_object() {
                        return Err(Error::eval(self, "argument must be a map"));
                    }
                    return Ok(v);
                }
                None => {
                    let entries = match &self.literal {
                        Some(Literal::Map(entries)) => entries,
                        _ => return Err(Error::eval(self, "argument must be a map literal")),
                    };
                    let mut out = Value::Object(Map::new());
                    for (key, exp) in entries {
                        let res = exp.evaluate(ctx)?;
                        let steps = path::parse_setter(key)?;
                        path::set(&mut out, key, &steps, res).map_err(|e| {
                            Error::eval(self, format!("cannot dereference \"set\" path: {e}"))
                        })?;
                    }
                    return Ok(out);
                }
            },
            _ => {}
        }

        // higher-order ops bind the subject per element and must receive
        // their lambda unevaluated
        match self.op.as_str() {
            "@filter" => {
                let (cond, list) = self.arg_pair()?;
                let raw = list.evaluate(ctx)?;
                let items = as_list(&raw).map_err(|r| Error::eval(self, r))?;
                let mut out = Vec::new();
                for item in items {
                    if self.eval_predicate(cond, ctx.with_subject(item))? {
                        out.push(item.clone());
                    }
                }
                return Ok(Value::Array(out));
            }
            "@map" => {
                let (f, list) = self.arg_pair()?;
                let raw = list.evaluate(ctx)?;
                let items = as_list(&raw).map_err(|r| Error::eval(self, r))?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(f.evaluate(ctx.with_subject(item))?);
                }
                return Ok(Value::Array(out));
            }
            "@any" | "@none" => {
                let (pred, list) = self.arg_pair()?;
                let raw = list.evaluate(ctx)?;
                let items = as_list(&raw).map_err(|r| Error::eval(self, r))?;
                let mut any = false;
                for item in items {
                    if self.eval_predicate(pred, ctx.with_subject(item))? {
                        any = true;
                        break;
                    }
                }
                return Ok(Value::Bool(if self.op == "@any" { any } else { !any }));
            }
            "@all" => {
                let (pred, list) = self.arg_pair()?;
                let raw = list.evaluate(ctx)?;
                let items = as_list(&raw).map_err(|r| Error::eval(self, r))?;
                for item in items {
                    if !self.eval_predicate(pred, ctx.with_subject(item))? {
                        return Ok(Value::Bool(false));
                    }
                }
                return Ok(Value::Bool(true));
            }
            _ => {}
        }

        // remaining operators evaluate their argument up front
        let arg = match &self.arg {
            Some(arg) => arg.evaluate(ctx)?,
            None => return Err(Error::eval(self, "empty argument list")),
        };

        if !self.op.starts_with('@') {
            // literal field: build a single-entry document fragment
            let mut map = Map::new();
            map.insert(self.op.clone(), arg);
            return Ok(Value::Object(map));
        }

        match self.op.as_str() {
            "@isnil" => Ok(Value::Bool(arg.is_null())),
            "@exists" => Ok(Value::Bool(!arg.is_null())),
            "@not" => {
                let v = as_bool(&arg).map_err(|r| Error::eval(self, r))?;
                Ok(Value::Bool(!v))
            }
            "@eq" => {
                let args = as_list(&arg).map_err(|r| Error::eval(self, r))?;
                if args.len() != 2 {
                    return Err(Error::eval(self, "expected 2 arguments"));
                }
                Ok(Value::Bool(args[0] == args[1]))
            }
            "@and" => {
                let args = as_bool_list(&arg).map_err(|r| Error::eval(self, r))?;
                Ok(Value::Bool(args.iter().all(|b| *b)))
            }
            "@or" => {
                let args = as_bool_list(&arg).map_err(|r| Error::eval(self, r))?;
                Ok(Value::Bool(args.iter().any(|b| *b)))
            }
            "@lt" => self.compare(&arg, |a, b| a < b, |a, b| a < b),
            "@lte" => self.compare(&arg, |a, b| a <= b, |a, b| a <= b),
            "@gt" => self.compare(&arg, |a, b| a > b, |a, b| a > b),
            "@gte" => self.compare(&arg, |a, b| a >= b, |a, b| a >= b),
            "@selector" => {
                let args = as_list(&arg).map_err(|r| Error::eval(self, r))?;
                if args.len() != 2 {
                    return Err(Error::eval(self, "expected 2 arguments"));
                }
                if args[0].is_null() || args[1].is_null() {
                    return Ok(Value::Bool(false));
                }
                let sel = as_object(&args[0])
                    .map_err(|r| Error::eval(self, format!("invalid label selector: {r}")))?;
                let labels = as_object(&args[1])
                    .map_err(|r| Error::eval(self, format!("invalid label set: {r}")))?;
                let v = selector::match_labels(labels, sel)
                    .map_err(|r| Error::eval(self, format!("label selector: {r}")))?;
                Ok(Value::Bool(v))
            }
            "@abs" => {
                let f = as_float(&arg).map_err(|r| Error::eval(self, r))?;
                Ok(Value::from(f.abs()))
            }
            "@ceil" => {
                let f = as_float(&arg).map_err(|r| Error::eval(self, r))?;
                Ok(Value::from(f.ceil()))
            }
            "@floor" => {
                let f = as_float(&arg).map_err(|r| Error::eval(self, r))?;
                Ok(Value::from(f.floor()))
            }
            "@sum" => match as_number_list(&arg).map_err(|r| Error::eval(self, r))? {
                Numbers::Ints(is) => Ok(Value::from(is.iter().sum::<i64>())),
                Numbers::Floats(fs) => Ok(Value::from(fs.iter().sum::<f64>())),
            },
            "@len" => {
                let args = as_list(&arg).map_err(|r| Error::eval(self, r))?;
                Ok(Value::from(args.len() as i64))
            }
            "@in" => {
                let args = as_list(&arg).map_err(|r| Error::eval(self, r))?;
                if args.len() != 2 {
                    return Err(Error::eval(self, "expected 2 arguments"));
                }
                let list = as_list(&args[1]).map_err(|r| Error::eval(self, r))?;
                Ok(Value::Bool(list.contains(&args[0])))
            }
            "@concat" => {
                let args = as_string_list(&arg).map_err(|r| Error::eval(self, r))?;
                Ok(Value::String(args.concat()))
            }
            op => Err(Error::UnknownOp { op: op.to_string() }),
        }
    }

    fn compare(
        &self,
        arg: &Value,
        ints: fn(i64, i64) -> bool,
        floats: fn(f64, f64) -> bool,
    ) -> Result<Value, Error> {
        match as_binary_numbers(arg).map_err(|r| Error::eval(self, r))? {
            BinaryNumbers::Ints(a, b) => Ok(Value::Bool(ints(a, b))),
            BinaryNumbers::Floats(a, b) => Ok(Value::Bool(floats(a, b))),
        }
    }

    fn eval_predicate(&self, pred: &Expression, ctx: EvalCtx) -> Result<bool, Error> {
        let res = pred.evaluate(ctx)?;
        as_bool(&res).map_err(|r| {
            Error::eval(self, format!("expected conditional expression to evaluate to boolean: {r}"))
        })
    }

    fn arg_or_literal(&self, ctx: EvalCtx) -> Result<Value, Error> {
        match &self.arg {
            // eval stacked expressions stored in the arg
            Some(arg) => arg.evaluate(ctx),
            None => match &self.literal {
                Some(Literal::Scalar(v)) => Ok(v.clone()),
                None => Ok(Value::Null),
                Some(_) => Err(Error::eval(self, "argument must be a scalar literal")),
            },
        }
    }

    /// Pair-shaped argument of the higher-order ops: `[lambda, list]`.
    fn arg_pair(&self) -> Result<(&Expression, &Expression), Error> {
        if let Some(arg) = &self.arg {
            if arg.op == "@list" {
                if let Some(Literal::List(items)) = &arg.literal {
                    if items.len() == 2 {
                        return Ok((&items[0], &items[1]));
                    }
                }
            }
        }
        Err(Error::invalid_arguments(self, "expected 2 arguments"))
    }
}

/// Unpack the first nesting level: when the first element is itself a
/// list, that inner list replaces the whole result.
fn unpack_list(items: Vec<Value>) -> Vec<Value> {
    match items.first() {
        Some(Value::Array(first)) => first.clone(),
        _ => items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unpack_removes_one_level() {
        assert_eq!(unpack_list(vec![]), Vec::<Value>::new());
        assert_eq!(unpack_list(vec![json!(1), json!(2)]), vec![json!(1), json!(2)]);
        assert_eq!(unpack_list(vec![json!([1, 2])]), vec![json!(1), json!(2)]);
        // first-element rule: 2-D lists collapse to their first row
        assert_eq!(unpack_list(vec![json!([1, 2]), json!([3, 4])]), vec![json!(1), json!(2)]);
    }

    #[test]
    fn comparison_preserves_ints() {
        let obj = json!({});
        let ctx = EvalCtx::new(&obj);
        let e = Expression::from_json(r#"{"@lt": [2, 10]}"#).unwrap();
        assert_eq!(e.evaluate(ctx).unwrap(), json!(true));
        // mixed operands widen to float
        let e = Expression::from_json(r#"{"@lt": [2, 2.5]}"#).unwrap();
        assert_eq!(e.evaluate(ctx).unwrap(), json!(true));
        let e = Expression::from_json(r#"{"@lt": [2, "x"]}"#).unwrap();
        assert!(e.evaluate(ctx).is_err());
    }
}
