//! Opaque per-request handles.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use uuid::Uuid;

use crate::constraints::ConstraintSet;

/// Identifies one outbound request and carries its constraints.
///
/// Equality and hashing use the id only. Connection managers treat the
/// handle as a token; endpoints read the constraints when choosing or
/// creating a connection.
#[derive(Clone)]
pub struct RequestHandle {
    id: Uuid,
    constraints: Arc<ConstraintSet>,
}

impl RequestHandle {
    /// Creates a handle with a fresh id.
    #[must_use]
    pub fn new(constraints: ConstraintSet) -> Self {
        Self {
            id: Uuid::new_v4(),
            constraints: Arc::new(constraints),
        }
    }

    /// Creates a handle for a request without constraints.
    #[must_use]
    pub fn unconstrained() -> Self {
        Self::new(ConstraintSet::empty())
    }

    /// Unique id of this handle.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Constraints attached to the request.
    #[must_use]
    pub fn constraints(&self) -> &ConstraintSet {
        &self.constraints
    }
}

impl PartialEq for RequestHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RequestHandle {}

impl Hash for RequestHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("constraints", &self.constraints.len())
            .finish()
    }
}
