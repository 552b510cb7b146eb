use super::ProxyNode;

/// A named savepoint existing on every replica of one connection.
#[derive(Debug)]
pub struct ClusterSavepoint {
    node: ProxyNode,
    name: String,
}

impl ClusterSavepoint {
    pub(crate) fn new(node: ProxyNode, name: String) -> Self {
        Self { node, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> &ProxyNode {
        &self.node
    }

    /// True once released or once its connection closed
    pub fn is_closed(&self) -> bool {
        self.node.is_closed()
    }
}
