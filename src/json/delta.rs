//! Structural JSON diff.
//!
//! `diff(prev, next)` describes how to turn `prev` into `next` as a tree of
//! keyed (object) and positional (array) operations:
//!
//! ```text
//! prev: [a, b, c, d]         ops (indices into prev):
//! next: [a, x, c, d, e]        Substitution { index: 1, value: x }
//!                              Insertion    { index: 4, values: [e] }
//! ```
//!
//! Array diffs keep the longest common subsequence of equal elements. Inside
//! each gap between kept elements, removed and added elements are paired up
//! in order: objects sharing the same `"id"` become `Nested`, anything else a
//! `Substitution`. Unpaired leftovers become `Deletion` / `Insertion`.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "ops", rename_all = "lowercase")]
pub enum Delta {
    Object(Vec<ObjectOp>),
    Array(Vec<ArrayOp>),
    /// Different JSON types, or a changed scalar: replace outright.
    Scalar(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ObjectOp {
    Deletion { key: String },
    Insertion { key: String, value: Value },
    Substitution { key: String, value: Value },
    Nested { key: String, delta: Delta },
}

impl ObjectOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Deletion { key }
            | Self::Insertion { key, .. }
            | Self::Substitution { key, .. }
            | Self::Nested { key, .. } => key,
        }
    }
}

/// Positional array operation. Every `index` refers to the previous array.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ArrayOp {
    /// Remove `count` elements starting at `index`.
    Deletion { index: usize, count: usize },
    /// Insert `values` before the element at `index` (or at the end).
    Insertion { index: usize, values: Vec<Value> },
    /// Replace the element at `index`.
    Substitution { index: usize, value: Value },
    /// Modify the element at `index` in place.
    Nested { index: usize, delta: Delta },
}

#[derive(Debug, Error, PartialEq)]
pub enum DeltaError {
    #[error("expected {expected} while applying delta")]
    Mismatch { expected: &'static str },

    #[error("delta references missing key `{0}`")]
    MissingKey(String),

    #[error("delta index {0} is out of order or out of range")]
    BadIndex(usize),
}

// =============================================================================
// Diff
// =============================================================================

/// Delta turning `prev` into `next`, or `None` when they are equal.
pub fn diff(prev: &Value, next: &Value) -> Option<Delta> {
    if prev == next {
        return None;
    }
    Some(match (prev, next) {
        (Value::Object(a), Value::Object(b)) => Delta::Object(diff_object(a, b)),
        (Value::Array(a), Value::Array(b)) => Delta::Array(diff_array(a, b)),
        _ => Delta::Scalar(next.clone()),
    })
}

fn diff_object(prev: &Map<String, Value>, next: &Map<String, Value>) -> Vec<ObjectOp> {
    let mut ops = Vec::new();
    for (key, old) in prev {
        match next.get(key) {
            None => ops.push(ObjectOp::Deletion { key: key.clone() }),
            Some(new) if new == old => {}
            Some(new) => ops.push(match diff(old, new) {
                Some(delta @ (Delta::Object(_) | Delta::Array(_))) => ObjectOp::Nested {
                    key: key.clone(),
                    delta,
                },
                _ => ObjectOp::Substitution {
                    key: key.clone(),
                    value: new.clone(),
                },
            }),
        }
    }
    for (key, new) in next {
        if !prev.contains_key(key) {
            ops.push(ObjectOp::Insertion {
                key: key.clone(),
                value: new.clone(),
            });
        }
    }
    ops
}

fn diff_array(prev: &[Value], next: &[Value]) -> Vec<ArrayOp> {
    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);

    for (mi, mj) in common_subsequence(prev, next).into_iter().chain([(prev.len(), next.len())]) {
        gap_ops(&prev[i..mi], &next[j..mj], i, &mut ops);
        i = mi + 1;
        j = mj + 1;
    }
    ops
}

/// Operations for one gap: `removed` starts at `prev[offset]`.
fn gap_ops(removed: &[Value], added: &[Value], offset: usize, ops: &mut Vec<ArrayOp>) {
    let paired = removed.len().min(added.len());

    for (k, (old, new)) in removed.iter().zip(added).enumerate() {
        let index = offset + k;
        let op = match (same_identity(old, new), diff(old, new)) {
            (true, Some(delta)) => ArrayOp::Nested { index, delta },
            _ => ArrayOp::Substitution {
                index,
                value: new.clone(),
            },
        };
        ops.push(op);
    }

    if removed.len() > paired {
        ops.push(ArrayOp::Deletion {
            index: offset + paired,
            count: removed.len() - paired,
        });
    }
    if added.len() > paired {
        ops.push(ArrayOp::Insertion {
            index: offset + removed.len(),
            values: added[paired..].to_vec(),
        });
    }
}

fn same_identity(a: &Value, b: &Value) -> bool {
    match (a.get("id"), b.get("id")) {
        (Some(x), Some(y)) => a.is_object() && b.is_object() && x == y,
        _ => false,
    }
}

/// Index pairs of a longest common subsequence of equal elements.
fn common_subsequence(a: &[Value], b: &[Value]) -> Vec<(usize, usize)> {
    let (n, m) = (a.len(), b.len());
    // lengths[i][j] = LCS length of a[i..] and b[j..]
    let mut lengths = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lengths[i][j] = if a[i] == b[j] {
                lengths[i + 1][j + 1] + 1
            } else {
                lengths[i + 1][j].max(lengths[i][j + 1])
            };
        }
    }

    let mut pairs = Vec::with_capacity(lengths[0][0]);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if lengths[i + 1][j] >= lengths[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

// =============================================================================
// Apply
// =============================================================================

/// Apply `delta` to `prev`, producing the value it was computed against.
pub fn apply(prev: &Value, delta: &Delta) -> Result<Value, DeltaError> {
    match delta {
        Delta::Scalar(value) => Ok(value.clone()),
        Delta::Object(ops) => {
            let mut out = prev
                .as_object()
                .cloned()
                .ok_or(DeltaError::Mismatch { expected: "object" })?;
            for op in ops {
                match op {
                    ObjectOp::Deletion { key } => {
                        out.remove(key);
                    }
                    ObjectOp::Insertion { key, value } | ObjectOp::Substitution { key, value } => {
                        out.insert(key.clone(), value.clone());
                    }
                    ObjectOp::Nested { key, delta } => {
                        let old = out
                            .get(key)
                            .ok_or_else(|| DeltaError::MissingKey(key.clone()))?;
                        let new = apply(old, delta)?;
                        out.insert(key.clone(), new);
                    }
                }
            }
            Ok(Value::Object(out))
        }
        Delta::Array(ops) => {
            let prev = prev
                .as_array()
                .ok_or(DeltaError::Mismatch { expected: "array" })?;
            apply_array(prev, ops).map(Value::Array)
        }
    }
}

fn apply_array(prev: &[Value], ops: &[ArrayOp]) -> Result<Vec<Value>, DeltaError> {
    let mut out = Vec::with_capacity(prev.len());
    let mut cursor = 0;

    let copy_to = |out: &mut Vec<Value>, cursor: &mut usize, index: usize| {
        if index < *cursor || index > prev.len() {
            return Err(DeltaError::BadIndex(index));
        }
        out.extend_from_slice(&prev[*cursor..index]);
        *cursor = index;
        Ok(())
    };

    for op in ops {
        match op {
            ArrayOp::Deletion { index, count } => {
                copy_to(&mut out, &mut cursor, *index)?;
                if index + count > prev.len() {
                    return Err(DeltaError::BadIndex(*index));
                }
                cursor = index + count;
            }
            ArrayOp::Insertion { index, values } => {
                copy_to(&mut out, &mut cursor, *index)?;
                out.extend(values.iter().cloned());
            }
            ArrayOp::Substitution { index, value } => {
                copy_to(&mut out, &mut cursor, *index)?;
                if *index >= prev.len() {
                    return Err(DeltaError::BadIndex(*index));
                }
                out.push(value.clone());
                cursor = index + 1;
            }
            ArrayOp::Nested { index, delta } => {
                copy_to(&mut out, &mut cursor, *index)?;
                let old = prev.get(*index).ok_or(DeltaError::BadIndex(*index))?;
                out.push(apply(old, delta)?);
                cursor = index + 1;
            }
        }
    }
    out.extend_from_slice(&prev[cursor..]);
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(prev: Value, next: Value) -> Option<Delta> {
        let delta = diff(&prev, &next);
        if let Some(delta) = &delta {
            assert_eq!(apply(&prev, delta).unwrap(), next);
        }
        delta
    }

    #[test]
    fn test_equal_values_have_no_delta() {
        assert_eq!(diff(&json!({"a": [1, 2]}), &json!({"a": [1, 2]})), None);
    }

    #[test]
    fn test_object_ops() {
        let delta = roundtrip(
            json!({"keep": 1, "gone": 2, "changed": 3, "deep": {"x": 1}}),
            json!({"keep": 1, "changed": 4, "deep": {"x": 2}, "new": 5}),
        )
        .unwrap();

        let Delta::Object(ops) = delta else {
            panic!("expected object delta");
        };
        assert_eq!(
            ops,
            vec![
                ObjectOp::Deletion { key: "gone".into() },
                ObjectOp::Substitution {
                    key: "changed".into(),
                    value: json!(4)
                },
                ObjectOp::Nested {
                    key: "deep".into(),
                    delta: Delta::Object(vec![ObjectOp::Substitution {
                        key: "x".into(),
                        value: json!(2)
                    }]),
                },
                ObjectOp::Insertion {
                    key: "new".into(),
                    value: json!(5)
                },
            ]
        );
    }

    #[test]
    fn test_array_substitution_and_append() {
        let delta = roundtrip(json!(["a", "b", "c", "d"]), json!(["a", "x", "c", "d", "e"])).unwrap();
        assert_eq!(
            delta,
            Delta::Array(vec![
                ArrayOp::Substitution {
                    index: 1,
                    value: json!("x")
                },
                ArrayOp::Insertion {
                    index: 4,
                    values: vec![json!("e")]
                },
            ])
        );
    }

    #[test]
    fn test_array_deletion_and_insertion_at_front() {
        let delta = roundtrip(json!([1, 2, 3]), json!([3])).unwrap();
        assert_eq!(
            delta,
            Delta::Array(vec![ArrayOp::Deletion { index: 0, count: 2 }])
        );

        let delta = roundtrip(json!([3]), json!([1, 2, 3])).unwrap();
        assert_eq!(
            delta,
            Delta::Array(vec![ArrayOp::Insertion {
                index: 0,
                values: vec![json!(1), json!(2)]
            }])
        );
    }

    #[test]
    fn test_array_nested_by_id() {
        let prev = json!([
            {"id": "a", "paint": {"fill-opacity": 1}},
            {"id": "b", "paint": {}},
        ]);
        let next = json!([
            {"id": "a", "paint": {"fill-opacity": 0.5}},
            {"id": "b", "paint": {}},
        ]);
        let delta = roundtrip(prev, next).unwrap();
        let Delta::Array(ops) = delta else {
            panic!("expected array delta");
        };
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], ArrayOp::Nested { index: 0, .. }));
    }

    #[test]
    fn test_mixed_roundtrips() {
        roundtrip(json!([1, 2, 3, 4, 5]), json!([5, 4, 3, 2, 1]));
        roundtrip(json!([]), json!([{"id": "a"}]));
        roundtrip(json!({"a": [1, {"id": "x", "v": 1}]}), json!({"a": [{"id": "x", "v": 2}, 9]}));
        roundtrip(json!(1), json!("one"));
    }

    #[test]
    fn test_apply_rejects_mismatched_shape() {
        let delta = Delta::Object(vec![]);
        assert_eq!(
            apply(&json!([1]), &delta),
            Err(DeltaError::Mismatch { expected: "object" })
        );

        let delta = Delta::Array(vec![ArrayOp::Substitution {
            index: 3,
            value: json!(0),
        }]);
        assert_eq!(apply(&json!([1]), &delta), Err(DeltaError::BadIndex(3)));
    }
}
