//! Matching declared fleet nodes to live instances.
//!
//! Reconciliation is all-or-nothing in one direction only: every tagged live
//! instance must correspond to a declared node, while declared nodes without
//! a live instance simply stay unbound. When several tagged instances share
//! a node name, the last one listed wins.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::directory::{DirectoryError, Instance, InstanceDirectory, filter_by_tag, list_instances};
use crate::fleet::Fleet;

/// Drift between the declared fleet and the live instances.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReconciliationError {
    /// Raised when a tagged instance has no matching declaration.
    #[error("instance {instance} is tagged '{tag}' but not declared in the fleet")]
    UndeclaredInstance {
        /// Name of the orphan instance.
        instance: String,
        /// Fleet tag the instance carries.
        tag: String,
    },
}

/// Errors raised while binding a fleet against a live directory.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BindError {
    /// Raised when listing instances fails.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// Raised when the live instances drift from the declaration.
    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),
}

/// Binds tagged instances in `live` to the fleet nodes of the same name.
///
/// Returns a new fleet; `fleet` is left untouched. Any previous bindings on
/// the copy are discarded first, so the result depends only on the inputs.
/// A node claimed by more than one tagged instance ends up bound to the last
/// of them in listing order.
///
/// # Errors
///
/// Returns [`ReconciliationError::UndeclaredInstance`] for the first tagged
/// instance (in listing order) with no matching node.
pub fn reconcile(fleet: &Fleet, live: &[Instance]) -> Result<Fleet, ReconciliationError> {
    let tag = fleet.tag();
    let mut bound = fleet.clone();
    bound.clear_bindings();

    for instance in filter_by_tag(live, tag) {
        let Some(node) = bound.node_mut(&instance.name) else {
            return Err(ReconciliationError::UndeclaredInstance {
                instance: instance.name,
                tag: tag.to_owned(),
            });
        };
        if let Some(previous) = node.bound_instance() {
            warn!(
                node = %node.name,
                replaced = previous.id,
                instance_id = instance.id,
                "several instances share a node name; binding the later one"
            );
        }
        debug!(node = %node.name, instance_id = instance.id, "bound node to instance");
        node.bind(instance);
    }

    Ok(bound)
}

/// Lists a directory and reconciles the fleet against it.
#[derive(Debug)]
pub struct Reconciler<D> {
    directory: D,
}

impl<D: InstanceDirectory> Reconciler<D> {
    /// Creates a reconciler over `directory`.
    pub const fn new(directory: D) -> Self {
        Self { directory }
    }

    /// Borrow the underlying directory.
    pub const fn directory(&self) -> &D {
        &self.directory
    }

    /// Returns a bound copy of `fleet`.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::Directory`] when listing fails and
    /// [`BindError::Reconciliation`] when the live instances drift.
    pub async fn bind(&self, fleet: &Fleet) -> Result<Fleet, BindError> {
        let live = list_instances(&self.directory).await?;
        let bound = reconcile(fleet, &live)?;
        info!(
            tag = fleet.tag(),
            declared = fleet.len(),
            bound = bound.bound_nodes().count(),
            "reconciled fleet"
        );
        Ok(bound)
    }
}
