//! The workflow-nodes bag: a typed attribute map shared by successive
//! steps (spec.md §3 "Workflow-nodes bag", §9 "Dynamic attribute bag").

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

pub const NODE_SERVER_ID: &str = "server_id";
pub const NODE_BACKUP: &str = "backup";
pub const NODE_LABELS: &str = "labels";
pub const NODE_TARGET_BASE: &str = "target_base";

#[derive(Clone)]
pub enum NodeValue {
    String(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    /// `Ref<Backup>` / `Ref<Deque<String>>` / `Ref<Json>` in the design
    /// note's tagged enum become one dynamically-typed ref variant here;
    /// [`NodesBag::get_ref`] recovers the concrete type.
    Ref(Arc<dyn Any + Send + Sync>),
}

/// Ownership: the workflow owns the bag; steps read/write but do not
/// free keys they did not insert (spec.md §3). Keys added during a
/// step's `setup` must be removed, or taken over, by that same step's
/// `teardown`.
#[derive(Default)]
pub struct NodesBag {
    values: HashMap<&'static str, NodeValue>,
}

impl NodesBag {
    pub fn new() -> Self {
        NodesBag::default()
    }

    pub fn set(&mut self, key: &'static str, value: NodeValue) {
        self.values.insert(key, value);
    }

    pub fn take(&mut self, key: &'static str) -> Option<NodeValue> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &'static str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_string(&self, key: &'static str) -> Option<&str> {
        match self.values.get(key) {
            Some(NodeValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &'static str) -> Option<i64> {
        match self.values.get(key) {
            Some(NodeValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &'static str) -> Option<bool> {
        match self.values.get(key) {
            Some(NodeValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &'static str) -> Option<&[u8]> {
        match self.values.get(key) {
            Some(NodeValue::Bytes(b)) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn get_ref<T: Any + Send + Sync>(&self, key: &'static str) -> Option<Arc<T>> {
        match self.values.get(key) {
            Some(NodeValue::Ref(r)) => r.clone().downcast::<T>().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_round_trip() {
        let mut bag = NodesBag::new();
        bag.set(NODE_SERVER_ID, NodeValue::String("srv1".into()));
        bag.set(NODE_TARGET_BASE, NodeValue::Ref(Arc::new(String::from("/data"))));

        assert_eq!(bag.get_string(NODE_SERVER_ID), Some("srv1"));
        assert_eq!(
            bag.get_ref::<String>(NODE_TARGET_BASE).as_deref().map(String::as_str),
            Some("/data")
        );
        assert!(bag.get_int(NODE_SERVER_ID).is_none());
    }

    #[test]
    fn take_removes_the_key() {
        let mut bag = NodesBag::new();
        bag.set(NODE_LABELS, NodeValue::Bool(true));
        assert!(bag.contains(NODE_LABELS));
        bag.take(NODE_LABELS);
        assert!(!bag.contains(NODE_LABELS));
    }
}
