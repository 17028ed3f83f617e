//! Permission & validation layer
//!
//! Two independent checks guard every proposed action: a structural shape
//! check that needs no state, and a role/ownership check against the state
//! the action would be applied to. The gateway runs both as a fast path and
//! the session re-runs the permission check against the committed state at
//! apply time, since the state may have moved on in between.

mod rights;
mod shape;

pub use rights::{required_rights, validate_permissions, Right};
pub use shape::{decode_action, validate_shape, IssueSeverity, ValidationIssue};
