//! # Value provenance
//!
//! Every [`FlowValue`] names its parents. The registry here is the append-only
//! id -> value table used to walk that graph; the tracker answers lineage
//! questions over it.
//!
//! ## Version history
//!
//! A value's history maps every `source_id` found among itself and its
//! ancestors to the set of value ids produced at that causal point. Two values
//! are on the same branch unless some causal point appears in both histories
//! with different id sets, which is what happens to sibling iterations of a
//! fan-out.

use crate::error::ProvenanceError;
use blockflow_core::{FlowValue, ProvenanceConfig};
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// `source_id` -> ids of the values produced at that point.
pub type VersionHistory = BTreeMap<String, BTreeSet<Uuid>>;

/// Append-only table of every FlowValue of one flow execution.
#[derive(Debug, Default)]
pub struct FlowValueRegistry {
    values: DashMap<Uuid, Arc<FlowValue>>,
}

impl FlowValueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value whose parents are all known.
    pub fn register(&self, value: FlowValue) -> Result<Arc<FlowValue>, ProvenanceError> {
        for parent in &value.parent_ids {
            if !self.values.contains_key(parent) {
                return Err(ProvenanceError::UnknownParent {
                    value: value.id,
                    parent: *parent,
                });
            }
        }

        let value = Arc::new(value);
        match self.values.entry(value.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ProvenanceError::Duplicate(value.id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&value));
                Ok(value)
            }
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<FlowValue>> {
        self.values.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.values.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Lineage queries over a [`FlowValueRegistry`].
#[derive(Debug)]
pub struct ProvenanceTracker {
    registry: Arc<FlowValueRegistry>,
    memo: Mutex<IndexMap<Uuid, Arc<VersionHistory>>>,
    memo_limit: usize,
}

impl ProvenanceTracker {
    pub fn new(registry: Arc<FlowValueRegistry>, config: &ProvenanceConfig) -> Self {
        Self {
            registry,
            memo: Mutex::new(IndexMap::new()),
            memo_limit: config.history_memo_limit.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<FlowValueRegistry> {
        &self.registry
    }

    /// True iff `ancestor` is reachable from `value` through parent ids.
    /// A value is not its own descendant.
    pub fn is_descendant(&self, value: &FlowValue, ancestor: &Uuid) -> Result<bool, ProvenanceError> {
        let mut stack: Vec<Uuid> = value.parent_ids.clone();
        let mut seen = HashSet::new();

        while let Some(id) = stack.pop() {
            if &id == ancestor {
                return Ok(true);
            }
            if !seen.insert(id) {
                continue;
            }
            let parent = self
                .registry
                .get(&id)
                .ok_or(ProvenanceError::UnknownValue(id))?;
            stack.extend(parent.parent_ids.iter().copied());
        }
        Ok(false)
    }

    /// True iff every value in `triggers` is an ancestor of `value`.
    pub fn descends_from_all(
        &self,
        value: &FlowValue,
        triggers: &[Arc<FlowValue>],
    ) -> Result<bool, ProvenanceError> {
        for trigger in triggers {
            if !self.is_descendant(value, &trigger.id)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn version_history(&self, value: &FlowValue) -> Result<Arc<VersionHistory>, ProvenanceError> {
        if let Some(history) = self.memo.lock().get(&value.id) {
            return Ok(Arc::clone(history));
        }

        let mut history = VersionHistory::new();
        history
            .entry(value.source_id())
            .or_default()
            .insert(value.id);

        let mut stack: Vec<Uuid> = value.parent_ids.clone();
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }

            let memoized = self.memo.lock().get(&id).cloned();
            if let Some(known) = memoized {
                for (source, versions) in known.iter() {
                    history
                        .entry(source.clone())
                        .or_default()
                        .extend(versions.iter().copied());
                }
                continue;
            }

            let parent = self
                .registry
                .get(&id)
                .ok_or(ProvenanceError::UnknownValue(id))?;
            history
                .entry(parent.source_id())
                .or_default()
                .insert(parent.id);
            stack.extend(parent.parent_ids.iter().copied());
        }

        let history = Arc::new(history);
        self.remember(value.id, Arc::clone(&history));
        Ok(history)
    }

    /// False when the two values went through different versions of a shared
    /// causal point.
    pub fn is_same_branch(&self, a: &FlowValue, b: &FlowValue) -> Result<bool, ProvenanceError> {
        let left = self.version_history(a)?;
        let right = self.version_history(b)?;

        let mut left_iter = left.iter().peekable();
        let mut right_iter = right.iter().peekable();
        while let (Some((left_key, left_set)), Some((right_key, right_set))) =
            (left_iter.peek(), right_iter.peek())
        {
            match left_key.cmp(right_key) {
                std::cmp::Ordering::Less => {
                    left_iter.next();
                }
                std::cmp::Ordering::Greater => {
                    right_iter.next();
                }
                std::cmp::Ordering::Equal => {
                    if left_set != right_set {
                        return Ok(false);
                    }
                    left_iter.next();
                    right_iter.next();
                }
            }
        }
        Ok(true)
    }

    pub fn memo_len(&self) -> usize {
        self.memo.lock().len()
    }

    fn remember(&self, id: Uuid, history: Arc<VersionHistory>) {
        let mut memo = self.memo.lock();
        memo.insert(id, history);
        if memo.len() > self.memo_limit {
            let evicted = memo.len() / 2;
            memo.drain(..evicted);
            tracing::debug!(evicted, remaining = memo.len(), "evicted version history memo");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_core::ValueSourceRef;
    use serde_json::json;

    fn tracker(limit: usize) -> ProvenanceTracker {
        ProvenanceTracker::new(
            Arc::new(FlowValueRegistry::new()),
            &ProvenanceConfig {
                history_memo_limit: limit,
            },
        )
    }

    fn step(block: &str) -> ValueSourceRef {
        ValueSourceRef::Step {
            block_id: block.to_string(),
            step_id: "run".to_string(),
            output_id: "run".to_string(),
        }
    }

    fn add(tracker: &ProvenanceTracker, value: FlowValue) -> Arc<FlowValue> {
        tracker.registry().register(value).unwrap()
    }

    #[test]
    fn test_descendant_of_every_parent() {
        let tracker = tracker(100);
        let p1 = add(&tracker, FlowValue::root("a", json!(1)));
        let p2 = add(&tracker, FlowValue::root("b", json!(2)));
        let unrelated = add(&tracker, FlowValue::root("c", json!(3)));
        let child = add(&tracker, FlowValue::derived(step("sum"), &[&*p1, &*p2], json!(3)));
        let grandchild = add(&tracker, FlowValue::derived(step("double"), &[&*child], json!(6)));

        assert!(tracker.is_descendant(&child, &p1.id).unwrap());
        assert!(tracker.is_descendant(&child, &p2.id).unwrap());
        assert!(tracker.is_descendant(&grandchild, &p1.id).unwrap());
        assert!(!tracker.is_descendant(&child, &unrelated.id).unwrap());
        assert!(!tracker.is_descendant(&child, &child.id).unwrap());
    }

    #[test]
    fn test_unknown_parent_is_rejected() {
        let registry = FlowValueRegistry::new();
        let orphan = FlowValue::new(step("x"), vec![Uuid::new_v4()], json!(null));
        assert!(matches!(
            registry.register(orphan),
            Err(ProvenanceError::UnknownParent { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let registry = FlowValueRegistry::new();
        let value = FlowValue::root("a", json!(1));
        registry.register(value.clone()).unwrap();
        assert_eq!(
            registry.register(value.clone()),
            Err(ProvenanceError::Duplicate(value.id))
        );
    }

    #[test]
    fn test_descends_from_all_triggers() {
        let tracker = tracker(100);
        let t1 = add(&tracker, FlowValue::root("a", json!(1)));
        let t2 = add(&tracker, FlowValue::root("b", json!(2)));
        let both = add(&tracker, FlowValue::derived(step("tool"), &[&*t1, &*t2], json!("ok")));
        let only_t1 = add(&tracker, FlowValue::derived(step("tool"), &[&*t1], json!("half")));

        let triggers = vec![Arc::clone(&t1), Arc::clone(&t2)];
        assert!(tracker.descends_from_all(&both, &triggers).unwrap());
        assert!(!tracker.descends_from_all(&only_t1, &triggers).unwrap());
    }

    #[test]
    fn test_sibling_branches_diverge() {
        let tracker = tracker(100);
        let items = add(&tracker, FlowValue::root("items", json!(["a", "b"])));
        let fan_out = ValueSourceRef::ToolInput {
            block_id: "map".to_string(),
            tool_id: "run".to_string(),
            input_id: "item".to_string(),
        };
        let a = add(&tracker, FlowValue::derived(fan_out.clone(), &[&*items], json!("a")));
        let b = add(&tracker, FlowValue::derived(fan_out, &[&*items], json!("b")));
        let from_a = add(&tracker, FlowValue::derived(step("upper"), &[&*a], json!("A")));
        let from_b = add(&tracker, FlowValue::derived(step("upper"), &[&*b], json!("B")));
        let also_from_a = add(&tracker, FlowValue::derived(step("len"), &[&*a], json!(1)));

        assert!(!tracker.is_same_branch(&from_a, &from_b).unwrap());
        assert!(tracker.is_same_branch(&from_a, &also_from_a).unwrap());
        assert!(tracker.is_same_branch(&from_a, &items).unwrap());
    }

    #[test]
    fn test_history_covers_ancestors() {
        let tracker = tracker(100);
        let root = add(&tracker, FlowValue::root("x", json!(1)));
        let child = add(&tracker, FlowValue::derived(step("a"), &[&*root], json!(2)));

        let history = tracker.version_history(&child).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[&root.source_id()].contains(&root.id));
        assert!(history[&child.source_id()].contains(&child.id));
    }

    #[test]
    fn test_memo_evicts_oldest_half() {
        let tracker = tracker(4);
        let values: Vec<_> = (0..5)
            .map(|i| add(&tracker, FlowValue::root(format!("in{i}"), json!(i))))
            .collect();
        for value in &values {
            tracker.version_history(value).unwrap();
        }
        assert!(tracker.memo_len() <= 4);
        assert!(tracker.memo_len() >= 2);

        // evicted entries are recomputed on demand
        let again = tracker.version_history(&values[0]).unwrap();
        assert!(again[&values[0].source_id()].contains(&values[0].id));
    }
}
