//! Structural diff between two render layer lists.
//!
//! Ops are emitted in apply order: every removal first, then paint calls,
//! then additions. Each addition is anchored before the first layer of the
//! previous list that is still present after the batch, so the final
//! order matches `next` no matter how many neighbours were removed.
//!
//! ```text
//! prev: [a, b, c, d]     remove b
//! next: [a, x, d]        remove c
//!                        add x before d   (c is going away, so not c)
//! ```

use rustc_hash::FxHashSet;
use serde_json::Value;

use super::StyleError;
use super::types::RenderLayer;
use super::update::PaintCall;
use crate::json::delta::{self, ArrayOp, Delta, ObjectOp};

#[derive(Debug, Clone, PartialEq)]
pub enum RenderOp {
    Remove { id: String },
    SetPaint(PaintCall),
    Add { layer: RenderLayer, before: Option<String> },
}

/// Render ops turning `prev` into `next`.
///
/// A changed layer whose only difference is inside `paint` becomes paint
/// calls. Any other in-place change of a layer is rejected, and nothing is
/// returned for the batch.
pub fn diff_render_layers(
    prev: &[RenderLayer],
    next: &[RenderLayer],
) -> Result<Vec<RenderOp>, StyleError> {
    let prev_json = to_values(prev);
    let next_json = to_values(next);
    let Some(delta) = delta::diff(&Value::Array(prev_json), &Value::Array(next_json)) else {
        return Ok(Vec::new());
    };
    let Delta::Array(ops) = delta else {
        return Ok(Vec::new());
    };

    let mut removed: FxHashSet<usize> = FxHashSet::default();
    for op in &ops {
        match op {
            ArrayOp::Deletion { index, count } => removed.extend(*index..index + count),
            ArrayOp::Substitution { index, .. } => {
                removed.insert(*index);
            }
            ArrayOp::Insertion { .. } | ArrayOp::Nested { .. } => {}
        }
    }

    let anchor = |from: usize| -> Option<String> {
        (from..prev.len())
            .find(|i| !removed.contains(i))
            .map(|i| prev[i].id.clone())
    };

    let mut removals = Vec::new();
    let mut paints = Vec::new();
    let mut adds = Vec::new();

    for op in ops {
        match op {
            ArrayOp::Deletion { index, count } => {
                for layer in &prev[index..index + count] {
                    removals.push(RenderOp::Remove { id: layer.id.clone() });
                }
            }
            ArrayOp::Substitution { index, value } => {
                removals.push(RenderOp::Remove {
                    id: prev[index].id.clone(),
                });
                adds.push(RenderOp::Add {
                    layer: from_value(value)?,
                    before: anchor(index + 1),
                });
            }
            ArrayOp::Insertion { index, values } => {
                let before = anchor(index);
                for value in values {
                    adds.push(RenderOp::Add {
                        layer: from_value(value)?,
                        before: before.clone(),
                    });
                }
            }
            ArrayOp::Nested { index, delta } => {
                paints.extend(paint_calls(&prev[index], delta)?);
            }
        }
    }

    removals.extend(paints);
    removals.extend(adds);
    Ok(removals)
}

/// Paint calls for an in-place layer change touching only `paint`.
fn paint_calls(prev: &RenderLayer, delta: Delta) -> Result<Vec<RenderOp>, StyleError> {
    let unsupported = |reason: String| StyleError::UnsupportedDelta {
        layer: prev.id.clone(),
        reason,
    };

    let Delta::Object(mut ops) = delta else {
        return Err(unsupported("layer is no longer an object".into()));
    };
    let paint_ops = match (ops.len(), ops.pop()) {
        (1, Some(ObjectOp::Nested { key, delta: Delta::Object(paint_ops) })) if key == "paint" => {
            paint_ops
        }
        (_, last) => {
            let mut keys: Vec<&str> = ops.iter().map(ObjectOp::key).collect();
            keys.extend(last.as_ref().map(ObjectOp::key));
            return Err(unsupported(format!("changed keys {keys:?}")));
        }
    };

    paint_ops
        .into_iter()
        .map(|op| {
            let (key, value) = match op {
                ObjectOp::Deletion { key } => (key, None),
                ObjectOp::Insertion { key, value } | ObjectOp::Substitution { key, value } => {
                    (key, Some(value))
                }
                ObjectOp::Nested { key, delta } => {
                    let base = prev.paint.get(&key).unwrap_or(&Value::Null);
                    let value = delta::apply(base, &delta).map_err(|e| unsupported(e.to_string()))?;
                    (key, Some(value))
                }
            };
            Ok(RenderOp::SetPaint(PaintCall::new(prev.id.clone(), key, value)))
        })
        .collect()
}

fn to_values(layers: &[RenderLayer]) -> Vec<Value> {
    // RenderLayer is plain data with string keys; serialization cannot fail
    layers
        .iter()
        .filter_map(|layer| serde_json::to_value(layer).ok())
        .collect()
}

fn from_value(value: Value) -> Result<RenderLayer, StyleError> {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    serde_json::from_value(value).map_err(|e| StyleError::UnsupportedDelta {
        layer: id,
        reason: e.to_string(),
    })
}
