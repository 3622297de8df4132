//! Node assembly and the operator-facing API
//!
//! [`NodeBuilder`] wires every component together; [`CtrlApi`] is the thin
//! request/response facade the control plane exposes over the cores'
//! public queries.

mod ctrl;
mod node;

pub use ctrl::CtrlApi;
pub use node::{Node, NodeBuilder};
