// src/scaler/provisioner.rs

//! Node lifecycle capability used by the cluster scaler.
//!
//! Concrete cloud or cluster APIs live outside this crate; they plug in by
//! implementing [`Provisioner`].

use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;

use crate::batch::NodeId;
use crate::errors::ProvisionerError;
use crate::scaler::node::NodeType;

pub type ProvisionerFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProvisionerError>> + Send + 'a>>;

/// A node as reported by the provisioner.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub node_type: String,
    pub launch_time: SystemTime,
}

/// Trait abstracting node creation and termination.
pub trait Provisioner: Send + Sync {
    /// Ask for `count` nodes of `node_type`. May return fewer ids than
    /// requested (e.g. preemptible capacity is scarce).
    fn create_nodes<'a>(
        &'a self,
        node_type: &'a NodeType,
        count: usize,
    ) -> ProvisionerFuture<'a, Vec<NodeId>>;

    fn terminate_nodes(&self, ids: Vec<NodeId>) -> ProvisionerFuture<'_, ()>;

    fn list_nodes(&self) -> ProvisionerFuture<'_, Vec<NodeInfo>>;
}

impl<P: Provisioner + ?Sized> Provisioner for Box<P> {
    fn create_nodes<'a>(
        &'a self,
        node_type: &'a NodeType,
        count: usize,
    ) -> ProvisionerFuture<'a, Vec<NodeId>> {
        (**self).create_nodes(node_type, count)
    }

    fn terminate_nodes(&self, ids: Vec<NodeId>) -> ProvisionerFuture<'_, ()> {
        (**self).terminate_nodes(ids)
    }

    fn list_nodes(&self) -> ProvisionerFuture<'_, Vec<NodeInfo>> {
        (**self).list_nodes()
    }
}
