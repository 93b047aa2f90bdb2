//! Control-plane handshake with delegated allocation controllers.
//!
//! The scheduler and the controllers negotiate through one
//! [`ControlPlaneContext`] per workload:
//!
//! ```text
//! NoContext ──► NodesRequested ──► NodeSelected ──► Observed ──► Closed
//!   (create, potential_nodes)  (CAS selected_node)  (controller   (delete in
//!                                                     status)      PostBind)
//! ```
//!
//! Changes decided during a scheduling attempt are kept here as pending
//! ("dirty") fields and only written to the store by [`HandshakeState::publish`].

use tracing::{debug, info};

use claimgrid_state::{ControlPlaneContext, StateStore, Workload};

use crate::error::{CoordinatorError, CoordinatorResult};

#[derive(Debug, Clone, Default)]
pub struct HandshakeState {
    /// The context as last read from or written to the store.
    context: Option<ControlPlaneContext>,
    selected_node: Option<String>,
    potential_nodes: Option<Vec<String>>,
}

impl HandshakeState {
    /// Load the workload's context, refusing one that belongs to some
    /// other workload or is on its way out.
    pub fn load(store: &StateStore, workload: &Workload) -> CoordinatorResult<Self> {
        let key = workload.key();
        let context = store.get::<ControlPlaneContext>(&key)?;
        if let Some(ctx) = &context {
            let owned = ctx
                .meta
                .controller_owner()
                .is_some_and(|o| o.uid == workload.uid);
            if !owned {
                return Err(CoordinatorError::ForeignContext {
                    key,
                    uid: workload.uid.clone(),
                });
            }
            if ctx.meta.deletion_requested {
                return Err(CoordinatorError::ContextBeingDeleted { key });
            }
        }
        Ok(Self {
            context,
            ..Default::default()
        })
    }

    pub fn context(&self) -> Option<&ControlPlaneContext> {
        self.context.as_ref()
    }

    /// Whether the controller reported anything for claim `slot`.
    pub fn has_status_for(&self, slot: &str) -> bool {
        self.context
            .as_ref()
            .is_some_and(|c| c.claim_status(slot).is_some())
    }

    /// Whether the controller marked `node` unsuitable for claim `slot`.
    pub fn is_unsuitable(&self, slot: &str, node: &str) -> bool {
        self.context
            .as_ref()
            .and_then(|c| c.claim_status(slot))
            .is_some_and(|s| s.unsuitable_nodes.iter().any(|n| n == node))
    }

    /// Whether the stored context already asks about `node`.
    pub fn lists_potential_node(&self, node: &str) -> bool {
        self.context
            .as_ref()
            .is_some_and(|c| c.lists_potential_node(node))
    }

    /// Whether the stored context already lists every one of `nodes`.
    pub fn lists_all_potential_nodes<'a>(&self, mut nodes: impl Iterator<Item = &'a str>) -> bool {
        self.context
            .as_ref()
            .is_some_and(|c| nodes.all(|n| c.lists_potential_node(n)))
    }

    /// The stored selected node.
    pub fn stored_selected_node(&self) -> Option<&str> {
        self.context
            .as_ref()
            .and_then(|c| c.spec.selected_node.as_deref())
    }

    pub fn request_potential_nodes(&mut self, nodes: Vec<String>) {
        self.potential_nodes = Some(nodes);
    }

    pub fn select_node(&mut self, node: &str) {
        self.selected_node = Some(node.to_string());
    }

    pub fn pending_potential_nodes(&self) -> Option<&[String]> {
        self.potential_nodes.as_deref()
    }

    pub fn pending_selected_node(&self) -> Option<&str> {
        self.selected_node.as_deref()
    }

    /// Pending changes not yet written to the store.
    pub fn is_dirty(&self) -> bool {
        self.selected_node.is_some() || self.potential_nodes.is_some()
    }

    /// Write pending changes: create the context if it does not exist,
    /// otherwise compare-and-swap against the version last seen.
    pub fn publish(&mut self, store: &StateStore, workload: &Workload) -> CoordinatorResult<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        let mut context = self
            .context
            .clone()
            .unwrap_or_else(|| ControlPlaneContext::for_workload(workload));
        if let Some(node) = self.selected_node.take() {
            context.spec.selected_node = Some(node);
        }
        if let Some(nodes) = self.potential_nodes.take() {
            context.spec.potential_nodes = nodes;
        }

        let written = if self.context.is_none() {
            store.create(&context)?
        } else {
            store.update(&context)?
        };
        info!(
            workload = %workload.key(),
            selected_node = ?written.spec.selected_node,
            potential_nodes = written.spec.potential_nodes.len(),
            version = %written.meta.version,
            "control plane context published"
        );
        self.context = Some(written);
        Ok(())
    }

    /// Delete the stored context once the workload is bound.
    ///
    /// Returns `true` if something was deleted.
    pub fn delete(store: &StateStore, workload: &Workload) -> CoordinatorResult<bool> {
        let key = workload.key();
        let Some(context) = store.get::<ControlPlaneContext>(&key)? else {
            return Ok(false);
        };
        if !context
            .meta
            .controller_owner()
            .is_some_and(|o| o.uid == workload.uid)
        {
            debug!(workload = %key, "leaving control plane context of another workload");
            return Ok(false);
        }
        let deleted = store.delete::<ControlPlaneContext>(&key, Some(context.meta.version))?;
        if deleted {
            info!(workload = %key, "control plane context deleted");
        }
        Ok(deleted)
    }
}
