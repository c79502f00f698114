//! Resolution of a target identity into its root-to-target chain.

use std::fmt;
use std::sync::Arc;

use crate::auth::error::ConfigError;
use crate::auth::graph::IdentityGraph;
use crate::auth::types::Identity;

/// Ordered, immutable path from a root identity to a target identity.
///
/// Cloning is cheap and shares the same links; there is no way to mutate
/// a chain after it is resolved.
#[derive(Clone)]
pub struct Chain {
    links: Arc<[Arc<Identity>]>,
}

impl Chain {
    /// The identity the chain authenticates as.
    pub fn target(&self) -> &Identity {
        &self.links[self.links.len() - 1]
    }

    /// The root identity, authenticated without parent credentials.
    pub fn root(&self) -> &Identity {
        &self.links[0]
    }

    pub fn get(&self, index: usize) -> Option<&Identity> {
        self.links.get(index).map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// A resolved chain always holds at least its target.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Identity> + ExactSizeIterator {
        self.links.iter().map(Arc::as_ref)
    }

    /// Position of `name` within this chain.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.links.iter().position(|link| link.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.links.iter().map(|link| link.name.as_str()).collect()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join(" -> "))
    }
}

/// Builds chains from an identity graph. Holds no state besides the graph,
/// so results always reflect the graph it was created with.
pub struct ChainResolver {
    graph: Arc<IdentityGraph>,
}

impl ChainResolver {
    pub fn new(graph: Arc<IdentityGraph>) -> Self {
        Self { graph }
    }

    /// Follow parent links from `target` to its root and return them in
    /// root-to-target order.
    pub fn resolve(&self, target: &str) -> Result<Chain, ConfigError> {
        let mut current = self.graph.lookup(target)?;
        let mut path = vec![Arc::clone(current)];

        while let Some(parent) = self.graph.parent_of(current)? {
            if path.iter().any(|link| link.name == parent.name) || path.len() > self.graph.len() {
                return Err(ConfigError::CyclicChain {
                    name: parent.name.clone(),
                });
            }
            path.push(Arc::clone(parent));
            current = parent;
        }

        path.reverse();
        Ok(Chain {
            links: path.into(),
        })
    }
}
