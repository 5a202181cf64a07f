//! Human approval for risky tool calls.
//!
//! [`policy`] decides whether a call needs approval; [`broker`] holds the
//! resulting requests until they are answered, time out, or the engine shuts
//! down.

pub mod broker;
pub mod policy;

pub use broker::{
    DEFAULT_PERMISSION_TIMEOUT, DecisionOutcome, PermissionBroker, PermissionDecision,
    PermissionRequest, PermissionTicket,
};
pub use policy::{ApprovalMode, Gate, evaluate};
