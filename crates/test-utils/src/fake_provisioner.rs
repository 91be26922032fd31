use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use jobflow::batch::NodeId;
use jobflow::errors::ProvisionerError;
use jobflow::scaler::{NodeInfo, NodeType, Provisioner, ProvisionerFuture};

/// One call made against the fake, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionerCall {
    Create { node_type: String, count: usize },
    Terminate { ids: Vec<NodeId> },
    List,
}

#[derive(Debug, Default)]
struct ProvisionerState {
    next_id: u64,
    nodes: BTreeMap<NodeId, NodeInfo>,
    calls: Vec<ProvisionerCall>,
    /// Upper bound on nodes handed out per create call, by type.
    fulfil_limit: HashMap<String, usize>,
    /// Every call fails while set.
    broken: bool,
}

/// In-memory provisioner that records every call.
///
/// Clones share state, like [`FakeBatchSystem`](crate::FakeBatchSystem).
#[derive(Debug, Clone, Default)]
pub struct FakeProvisioner {
    state: Arc<Mutex<ProvisionerState>>,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProvisionerState> {
        self.state.lock().unwrap()
    }

    /// Create calls for `node_type` return at most `limit` nodes.
    pub fn limit_fulfilment(&self, node_type: &str, limit: usize) {
        self.lock().fulfil_limit.insert(node_type.to_string(), limit);
    }

    pub fn set_broken(&self, broken: bool) {
        self.lock().broken = broken;
    }

    /// Register a node that exists outside the scaler's knowledge.
    pub fn add_node(&self, id: &str, node_type: &str) {
        self.lock().nodes.insert(
            id.to_string(),
            NodeInfo {
                id: id.to_string(),
                node_type: node_type.to_string(),
                launch_time: SystemTime::now(),
            },
        );
    }

    pub fn calls(&self) -> Vec<ProvisionerCall> {
        self.lock().calls.clone()
    }

    pub fn creates(&self) -> Vec<(String, usize)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ProvisionerCall::Create { node_type, count } => Some((node_type, count)),
                _ => None,
            })
            .collect()
    }

    pub fn terminations(&self) -> Vec<Vec<NodeId>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ProvisionerCall::Terminate { ids } => Some(ids),
                _ => None,
            })
            .collect()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.lock().nodes.keys().cloned().collect()
    }

    pub fn nodes_of(&self, node_type: &str) -> Vec<NodeId> {
        self.lock()
            .nodes
            .values()
            .filter(|n| n.node_type == node_type)
            .map(|n| n.id.clone())
            .collect()
    }
}

fn broken() -> ProvisionerError {
    ProvisionerError::Failed("provider unreachable".to_string())
}

impl Provisioner for FakeProvisioner {
    fn create_nodes<'a>(
        &'a self,
        node_type: &'a NodeType,
        count: usize,
    ) -> ProvisionerFuture<'a, Vec<NodeId>> {
        let mut state = self.lock();
        state.calls.push(ProvisionerCall::Create {
            node_type: node_type.name.clone(),
            count,
        });
        let result = if state.broken {
            Err(broken())
        } else {
            let granted = state
                .fulfil_limit
                .get(&node_type.name)
                .map_or(count, |limit| count.min(*limit));
            let mut ids = Vec::with_capacity(granted);
            for _ in 0..granted {
                state.next_id += 1;
                let id = format!("{}-{}", node_type.name, state.next_id);
                state.nodes.insert(
                    id.clone(),
                    NodeInfo {
                        id: id.clone(),
                        node_type: node_type.name.clone(),
                        launch_time: SystemTime::now(),
                    },
                );
                ids.push(id);
            }
            Ok(ids)
        };
        drop(state);
        Box::pin(async move { result })
    }

    fn terminate_nodes(&self, ids: Vec<NodeId>) -> ProvisionerFuture<'_, ()> {
        let mut state = self.lock();
        state.calls.push(ProvisionerCall::Terminate { ids: ids.clone() });
        let result = if state.broken {
            Err(broken())
        } else {
            for id in &ids {
                state.nodes.remove(id);
            }
            Ok(())
        };
        drop(state);
        Box::pin(async move { result })
    }

    fn list_nodes(&self) -> ProvisionerFuture<'_, Vec<NodeInfo>> {
        let mut state = self.lock();
        state.calls.push(ProvisionerCall::List);
        let result = if state.broken {
            Err(broken())
        } else {
            Ok(state.nodes.values().cloned().collect())
        };
        drop(state);
        Box::pin(async move { result })
    }
}
