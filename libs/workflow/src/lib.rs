//! C10 — workflow engine and the nodes bag it threads through steps.

pub mod engine;
pub mod nodes;

pub use engine::{Step, Workflow};
pub use nodes::{NodeValue, NodesBag, NODE_BACKUP, NODE_LABELS, NODE_SERVER_ID, NODE_TARGET_BASE};
