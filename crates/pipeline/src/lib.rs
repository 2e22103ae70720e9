//! Vista pipeline: transforms per-source deltas into view deltas.
//!
//! A pipeline is an optional `@join` across the controller's sources
//! followed by an `@aggregate` list of `@select` / `@project` / `@unwind`
//! stages. Evaluation is incremental: the engine applies the incoming
//! delta to its base caches first, recomputes the input object's fan-out
//! against the current caches of the other sources, and diffs the result
//! against what the same input produced before.

#![forbid(unsafe_code)]

use metrics::{counter, histogram};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::debug;

use vista_core::{object, Delta, Kind};
use vista_expr::{path, EvalCtx, Expression};

mod engine;

pub use engine::Engine;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Expression(#[from] vista_expr::Error),
    #[error("invalid object: {0}")]
    Object(#[from] vista_core::Error),
    #[error(transparent)]
    Cache(#[from] vista_cache::Error),
    #[error("join condition must evaluate to a boolean")]
    JoinCondition,
    #[error("aggregation: {0}")]
    Aggregation(String),
    #[error("projected object must carry a non-empty metadata.name")]
    ProjectionIdentity,
}

/// One `@aggregate` sub-stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Keep compositions for which the expression is truthy.
    Select(Expression),
    /// Shape each composition through a document template.
    Project(Expression),
    /// Emit one composition per element of the list at the path.
    Unwind(String),
}

/// An ordered list of transformation stages applied to each input delta.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    pub join: Option<Expression>,
    pub aggregate: Vec<Stage>,
}

impl Pipeline {
    /// Process one input delta from `source` into zero or more view deltas.
    pub fn evaluate(
        &self,
        engine: &mut Engine,
        source: &Kind,
        delta: &Delta,
    ) -> Result<Vec<Delta>, Error> {
        counter!("pipeline_evaluations_total", 1u64);
        let key = object::key(&delta.object)?;

        let outputs = if delta.kind.is_delete() {
            // the origin index already records every composite the object
            // contributed to, so the join need not re-run on last-known state
            engine.base.delete(source, &key);
            Vec::new()
        } else {
            engine.base.upsert(source, delta.object.clone())?;
            let compositions = self.compositions(engine, source, &delta.object)?;
            self.run_aggregate(compositions)?
        };

        let deltas = engine.diff(source, key, outputs, delta.kind)?;
        histogram!("pipeline_fanout", deltas.len() as f64);
        debug!(source = %source, kind = ?delta.kind, out = deltas.len(), "pipeline evaluated");
        Ok(deltas)
    }

    /// The bag of composite documents the input object takes part in. With
    /// a single source and no join this is the bare object; otherwise each
    /// composite maps kind names to one object per source, with the input
    /// object fixed.
    fn compositions(
        &self,
        engine: &Engine,
        source: &Kind,
        obj: &Value,
    ) -> Result<Vec<Value>, Error> {
        let join = match &self.join {
            Some(join) => join,
            None => return Ok(vec![obj.clone()]),
        };
        let mut out = Vec::new();
        let mut acc = Map::new();
        self.compose(engine, source, obj, join, 0, &mut acc, &mut out)?;
        Ok(out)
    }

    fn compose(
        &self,
        engine: &Engine,
        source: &Kind,
        obj: &Value,
        join: &Expression,
        idx: usize,
        acc: &mut Map<String, Value>,
        out: &mut Vec<Value>,
    ) -> Result<(), Error> {
        if idx == engine.sources().len() {
            let composite = Value::Object(acc.clone());
            let keep = join
                .evaluate(EvalCtx::new(&composite))?
                .as_bool()
                .ok_or(Error::JoinCondition)?;
            if keep {
                out.push(composite);
            }
            return Ok(());
        }

        let kind = &engine.sources()[idx];
        if kind == source {
            acc.insert(kind.kind.clone(), obj.clone());
            self.compose(engine, source, obj, join, idx + 1, acc, out)?;
        } else {
            // an empty counterpart cache simply yields no composites
            let counterparts: Vec<Value> = engine.base.list(kind).cloned().collect();
            for counterpart in counterparts {
                acc.insert(kind.kind.clone(), counterpart);
                self.compose(engine, source, obj, join, idx + 1, acc, out)?;
            }
        }
        acc.remove(&kind.kind);
        Ok(())
    }

    fn run_aggregate(&self, compositions: Vec<Value>) -> Result<Vec<Value>, Error> {
        let mut stream = compositions;
        for stage in &self.aggregate {
            stream = match stage {
                Stage::Select(expr) => {
                    let mut kept = Vec::new();
                    for comp in stream {
                        let keep = expr
                            .evaluate(EvalCtx::new(&comp))?
                            .as_bool()
                            .ok_or_else(|| {
                                Error::Aggregation("@select must evaluate to a boolean".into())
                            })?;
                        if keep {
                            kept.push(comp);
                        }
                    }
                    kept
                }
                Stage::Project(template) => {
                    let mut shaped = Vec::with_capacity(stream.len());
                    for comp in stream {
                        let doc = template.evaluate(EvalCtx::new(&comp))?;
                        if !doc.is_object() {
                            return Err(Error::Aggregation(
                                "@project must evaluate to a document".into(),
                            ));
                        }
                        shaped.push(doc);
                    }
                    shaped
                }
                Stage::Unwind(raw_path) => {
                    let steps = path::parse(raw_path)?;
                    let mut expanded = Vec::new();
                    for comp in stream {
                        let list = match path::get(&comp, &steps) {
                            Value::Array(items) => items,
                            other => {
                                return Err(Error::Aggregation(format!(
                                    "@unwind path {raw_path} must address a list, got {other}"
                                )))
                            }
                        };
                        for elem in list {
                            let mut clone = comp.clone();
                            path::set(&mut clone, raw_path, &steps, elem)?;
                            expanded.push(clone);
                        }
                    }
                    expanded
                }
            };
        }

        // every output document needs an identity before it can hit the view
        for doc in &stream {
            object::key(doc).map_err(|_| Error::ProjectionIdentity)?;
        }
        Ok(stream)
    }
}

impl<'de> Deserialize<'de> for Pipeline {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let map = value
            .as_object()
            .ok_or_else(|| D::Error::custom("pipeline must be a map"))?;

        let mut pipeline = Pipeline::default();
        for (key, entry) in map {
            match key.as_str() {
                "@join" => {
                    pipeline.join =
                        Some(Expression::try_from(entry).map_err(D::Error::custom)?);
                }
                "@aggregate" => {
                    let stages = entry
                        .as_array()
                        .ok_or_else(|| D::Error::custom("@aggregate must be a list"))?;
                    for stage in stages {
                        pipeline.aggregate.push(parse_stage(stage).map_err(D::Error::custom)?);
                    }
                }
                other => {
                    return Err(D::Error::custom(format!("unknown pipeline field {other:?}")))
                }
            }
        }
        Ok(pipeline)
    }
}

fn parse_stage(value: &Value) -> Result<Stage, String> {
    let map = value.as_object().ok_or("aggregation stage must be a map")?;
    if map.len() != 1 {
        return Err("aggregation stage must have exactly one operator".into());
    }
    let (op, arg) = match map.iter().next() {
        Some(entry) => entry,
        None => return Err("aggregation stage must have exactly one operator".into()),
    };
    match op.as_str() {
        "@select" => Expression::try_from(arg).map(Stage::Select).map_err(|e| e.to_string()),
        "@project" => Expression::try_from(arg).map(Stage::Project).map_err(|e| e.to_string()),
        "@unwind" => arg
            .as_str()
            .map(|s| Stage::Unwind(s.to_string()))
            .ok_or_else(|| "@unwind takes a JSON path".into()),
        other => Err(format!("unknown aggregation stage {other:?}")),
    }
}

impl Serialize for Pipeline {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error as _;
        let mut map = Map::new();
        if let Some(join) = &self.join {
            map.insert(
                "@join".to_string(),
                serde_json::to_value(join).map_err(S::Error::custom)?,
            );
        }
        if !self.aggregate.is_empty() {
            let mut stages = Vec::with_capacity(self.aggregate.len());
            for stage in &self.aggregate {
                let (op, arg) = match stage {
                    Stage::Select(e) => {
                        ("@select", serde_json::to_value(e).map_err(S::Error::custom)?)
                    }
                    Stage::Project(e) => {
                        ("@project", serde_json::to_value(e).map_err(S::Error::custom)?)
                    }
                    Stage::Unwind(p) => ("@unwind", Value::String(p.clone())),
                };
                let mut entry = Map::new();
                entry.insert(op.to_string(), arg);
                stages.push(Value::Object(entry));
            }
            map.insert("@aggregate".to_string(), Value::Array(stages));
        }
        Value::Object(map).serialize(serializer)
    }
}
