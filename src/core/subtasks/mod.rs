//! Delta patches over the planned subtask list.
//!
//! The refiner answers with a [`SubtaskPatch`] instead of a full list. Patches
//! apply in two passes: `remove`/`modify` first against ids, then `add` and
//! `reorder` in order against positions.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::core::error::ChainError;

/// A planned subtask as seen by the generator and the refiner. `id == 0`
/// marks an item that has not been persisted yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskInfo {
    #[serde(default)]
    pub id: i64,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Modify,
    Reorder,
    #[serde(untagged)]
    Unknown(String),
}

impl PatchOp {
    pub fn as_str(&self) -> &str {
        match self {
            PatchOp::Add => "add",
            PatchOp::Remove => "remove",
            PatchOp::Modify => "modify",
            PatchOp::Reorder => "reorder",
            PatchOp::Unknown(op) => op,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskOperation {
    pub op: PatchOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SubtaskOperation {
    fn new(op: PatchOp) -> Self {
        Self {
            op,
            id: None,
            after_id: None,
            title: None,
            description: None,
        }
    }

    pub fn add(after_id: Option<i64>, title: &str, description: &str) -> Self {
        Self {
            after_id,
            title: Some(title.to_string()),
            description: Some(description.to_string()),
            ..Self::new(PatchOp::Add)
        }
    }

    pub fn remove(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::new(PatchOp::Remove)
        }
    }

    pub fn modify(id: i64, title: Option<&str>, description: Option<&str>) -> Self {
        Self {
            id: Some(id),
            title: title.map(str::to_string),
            description: description.map(str::to_string),
            ..Self::new(PatchOp::Modify)
        }
    }

    pub fn reorder(id: i64, after_id: Option<i64>) -> Self {
        Self {
            id: Some(id),
            after_id,
            ..Self::new(PatchOp::Reorder)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskPatch {
    #[serde(default)]
    pub operations: Vec<SubtaskOperation>,
    #[serde(default)]
    pub message: String,
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Structural checks only; ids are resolved by [`apply_subtask_operations`].
pub fn validate_subtask_patch(patch: &SubtaskPatch) -> Result<(), ChainError> {
    for (index, op) in patch.operations.iter().enumerate() {
        let reason = match &op.op {
            PatchOp::Add if !present(&op.title) || !present(&op.description) => {
                "add operation requires title and description".to_string()
            }
            PatchOp::Remove if op.id.is_none() => "remove operation requires id".to_string(),
            PatchOp::Modify if op.id.is_none() => "modify operation requires id".to_string(),
            PatchOp::Modify if !present(&op.title) && !present(&op.description) => {
                "modify operation requires title or description".to_string()
            }
            PatchOp::Reorder if op.id.is_none() => "reorder operation requires id".to_string(),
            PatchOp::Unknown(name) => format!("unknown operation type '{}'", name),
            _ => continue,
        };
        return Err(ChainError::invalid_patch(index, reason));
    }
    Ok(())
}

fn index_by_id(list: &[SubtaskInfo]) -> HashMap<i64, usize> {
    list.iter()
        .enumerate()
        .filter(|(_, s)| s.id != 0)
        .map(|(i, s)| (s.id, i))
        .collect()
}

/// Insert position for `after_id`: front when absent or zero, right after the
/// referenced item, or the end when it cannot be resolved.
fn insert_position(list: &[SubtaskInfo], after_id: Option<i64>) -> usize {
    match after_id {
        None | Some(0) => 0,
        Some(after) => list
            .iter()
            .position(|s| s.id == after)
            .map(|i| i + 1)
            .unwrap_or(list.len()),
    }
}

pub fn apply_subtask_operations(
    planned: &[SubtaskInfo],
    patch: &SubtaskPatch,
) -> Result<Vec<SubtaskInfo>, ChainError> {
    let mut list = planned.to_vec();
    let mut index = index_by_id(&list);
    let mut removed = HashSet::new();

    for (i, op) in patch.operations.iter().enumerate() {
        match op.op {
            PatchOp::Remove => {
                let id = op
                    .id
                    .ok_or_else(|| ChainError::invalid_patch(i, "remove operation requires id"))?;
                if !index.contains_key(&id) {
                    return Err(ChainError::invalid_patch(i, format!("subtask {} not found", id)));
                }
                removed.insert(id);
            }
            PatchOp::Modify => {
                let id = op
                    .id
                    .ok_or_else(|| ChainError::invalid_patch(i, "modify operation requires id"))?;
                if !present(&op.title) && !present(&op.description) {
                    return Err(ChainError::invalid_patch(
                        i,
                        "modify operation requires title or description",
                    ));
                }
                let pos = *index
                    .get(&id)
                    .ok_or_else(|| ChainError::invalid_patch(i, format!("subtask {} not found", id)))?;
                if let Some(title) = op.title.as_ref().filter(|t| !t.trim().is_empty()) {
                    list[pos].title = title.clone();
                }
                if let Some(description) = op.description.as_ref().filter(|d| !d.trim().is_empty()) {
                    list[pos].description = description.clone();
                }
            }
            PatchOp::Add | PatchOp::Reorder => {}
            PatchOp::Unknown(ref name) => {
                return Err(ChainError::invalid_patch(
                    i,
                    format!("unknown operation type '{}'", name),
                ));
            }
        }
    }

    if !removed.is_empty() {
        list.retain(|s| !removed.contains(&s.id));
        index = index_by_id(&list);
    }

    for (i, op) in patch.operations.iter().enumerate() {
        match op.op {
            PatchOp::Add => {
                let (Some(title), Some(description)) = (
                    op.title.as_ref().filter(|t| !t.trim().is_empty()),
                    op.description.as_ref().filter(|d| !d.trim().is_empty()),
                ) else {
                    return Err(ChainError::invalid_patch(
                        i,
                        "add operation requires title and description",
                    ));
                };
                let pos = insert_position(&list, op.after_id);
                list.insert(
                    pos,
                    SubtaskInfo {
                        id: 0,
                        title: title.clone(),
                        description: description.clone(),
                    },
                );
                index = index_by_id(&list);
            }
            PatchOp::Reorder => {
                let id = op
                    .id
                    .ok_or_else(|| ChainError::invalid_patch(i, "reorder operation requires id"))?;
                let from = *index
                    .get(&id)
                    .ok_or_else(|| ChainError::invalid_patch(i, format!("subtask {} not found", id)))?;
                let item = list.remove(from);
                let pos = insert_position(&list, op.after_id);
                list.insert(pos, item);
                index = index_by_id(&list);
            }
            _ => {}
        }
    }

    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned() -> Vec<SubtaskInfo> {
        (1..=3)
            .map(|id| SubtaskInfo {
                id,
                title: format!("t{id}"),
                description: format!("d{id}"),
            })
            .collect()
    }

    fn ids(list: &[SubtaskInfo]) -> Vec<i64> {
        list.iter().map(|s| s.id).collect()
    }

    fn patch(operations: Vec<SubtaskOperation>) -> SubtaskPatch {
        SubtaskPatch {
            operations,
            message: "adjusting plan".into(),
        }
    }

    #[test]
    fn remove_drops_the_item() {
        let out = apply_subtask_operations(&planned(), &patch(vec![SubtaskOperation::remove(2)]))
            .unwrap();
        assert_eq!(ids(&out), vec![1, 3]);
    }

    #[test]
    fn add_after_inserts_new_item_with_zero_id() {
        let out = apply_subtask_operations(
            &planned(),
            &patch(vec![SubtaskOperation::add(Some(1), "X", "d")]),
        )
        .unwrap();
        assert_eq!(ids(&out), vec![1, 0, 2, 3]);
        assert_eq!(out[1].title, "X");
    }

    #[test]
    fn add_without_anchor_goes_first_and_unresolvable_goes_last() {
        let out = apply_subtask_operations(
            &planned(),
            &patch(vec![
                SubtaskOperation::add(None, "first", "d"),
                SubtaskOperation::add(Some(99), "last", "d"),
            ]),
        )
        .unwrap();
        assert_eq!(out[0].title, "first");
        assert_eq!(out[4].title, "last");
    }

    #[test]
    fn reorder_without_anchor_moves_to_front() {
        let out = apply_subtask_operations(
            &planned(),
            &patch(vec![SubtaskOperation::reorder(3, None)]),
        )
        .unwrap();
        assert_eq!(ids(&out), vec![3, 1, 2]);
    }

    #[test]
    fn reorder_after_anchor() {
        let out = apply_subtask_operations(
            &planned(),
            &patch(vec![SubtaskOperation::reorder(1, Some(3))]),
        )
        .unwrap();
        assert_eq!(ids(&out), vec![2, 3, 1]);
    }

    #[test]
    fn modify_keeps_order_and_unset_fields() {
        let out = apply_subtask_operations(
            &planned(),
            &patch(vec![SubtaskOperation::modify(2, Some("new"), None)]),
        )
        .unwrap();
        assert_eq!(ids(&out), vec![1, 2, 3]);
        assert_eq!(out[1].title, "new");
        assert_eq!(out[1].description, "d2");
    }

    #[test]
    fn removals_resolve_before_positions() {
        // The add anchors on an item removed later in the list of operations.
        let out = apply_subtask_operations(
            &planned(),
            &patch(vec![
                SubtaskOperation::add(Some(2), "X", "d"),
                SubtaskOperation::remove(2),
            ]),
        )
        .unwrap();
        assert_eq!(ids(&out), vec![1, 3, 0]);
    }

    #[test]
    fn unknown_id_names_the_operation_index() {
        let err = apply_subtask_operations(
            &planned(),
            &patch(vec![
                SubtaskOperation::remove(1),
                SubtaskOperation::reorder(42, None),
            ]),
        )
        .unwrap_err();
        match err {
            ChainError::InvalidPatch { index, reason } => {
                assert_eq!(index, 1);
                assert!(reason.contains("42"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = apply_subtask_operations(&planned(), &patch(vec![SubtaskOperation::modify(7, Some("x"), None)]))
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidPatch { index: 0, .. }));
    }

    #[test]
    fn empty_patch_is_identity() {
        let out = apply_subtask_operations(&planned(), &SubtaskPatch::default()).unwrap();
        assert_eq!(out, planned());
    }

    #[test]
    fn validation_errors_are_distinct() {
        let cases = [
            (
                SubtaskOperation::add(None, "", "d"),
                "add operation requires title and description",
            ),
            (
                SubtaskOperation::new(PatchOp::Remove),
                "remove operation requires id",
            ),
            (
                SubtaskOperation::new(PatchOp::Modify),
                "modify operation requires id",
            ),
            (
                SubtaskOperation::modify(1, None, None),
                "modify operation requires title or description",
            ),
            (
                SubtaskOperation::new(PatchOp::Reorder),
                "reorder operation requires id",
            ),
            (
                SubtaskOperation::new(PatchOp::Unknown("split".into())),
                "unknown operation type 'split'",
            ),
        ];
        for (op, expected) in cases {
            let err = validate_subtask_patch(&patch(vec![SubtaskOperation::remove(1), op])).unwrap_err();
            let text = err.to_string();
            assert!(text.contains(expected), "{text} should contain {expected}");
            assert!(matches!(err, ChainError::InvalidPatch { index: 1, .. }));
        }
        assert!(validate_subtask_patch(&patch(vec![SubtaskOperation::reorder(2, Some(1))])).is_ok());
    }

    #[test]
    fn unknown_op_deserializes_for_reporting() {
        let patch: SubtaskPatch = serde_json::from_str(
            r#"{"operations":[{"op":"add","title":"a","description":"b","after_id":1},{"op":"split","id":2}],"message":"m"}"#,
        )
        .unwrap();
        assert_eq!(patch.operations[0].op, PatchOp::Add);
        assert_eq!(patch.operations[1].op, PatchOp::Unknown("split".into()));
        assert!(validate_subtask_patch(&patch).is_err());
    }
}
