//! Validated view of declared identities and their parent links.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::auth::error::ConfigError;
use crate::auth::types::Identity;

/// Static, validated identity graph. Built once per configuration load.
#[derive(Debug)]
pub struct IdentityGraph {
    identities: HashMap<String, Arc<Identity>>,
    /// Lowercased name to canonical name; `None` when two names fold together.
    folded: HashMap<String, Option<String>>,
    /// Declaration order, for listing.
    order: Vec<String>,
}

impl IdentityGraph {
    /// Validate and index the declared identities.
    ///
    /// Fails when a name is declared twice, a parent is undeclared, parent
    /// links do not terminate within `identities.len()` hops, or a kind's
    /// parent requirement is violated.
    pub fn new(declared: Vec<Identity>) -> Result<Self, ConfigError> {
        let mut identities = HashMap::with_capacity(declared.len());
        let mut folded: HashMap<String, Option<String>> = HashMap::new();
        let mut order = Vec::with_capacity(declared.len());

        for identity in declared {
            if identities.contains_key(&identity.name) {
                return Err(ConfigError::DuplicateIdentity {
                    name: identity.name,
                });
            }
            folded
                .entry(identity.name.to_lowercase())
                .and_modify(|slot| *slot = None)
                .or_insert_with(|| Some(identity.name.clone()));
            order.push(identity.name.clone());
            identities.insert(identity.name.clone(), identity);
        }

        let mut graph = Self {
            identities: HashMap::new(),
            folded,
            order,
        };

        // Canonicalize parent names so every later lookup is exact.
        let mut canonical = HashMap::with_capacity(identities.len());
        for name in &graph.order {
            let Some(mut identity) = identities.remove(name) else {
                continue;
            };
            if let Some(parent) = identity.parent.take() {
                let resolved = graph.canonical_name(&parent, |n| canonical_exists(n, &graph))?;
                identity.parent = Some(resolved);
            }
            canonical.insert(name.clone(), Arc::new(identity));
        }
        graph.identities = canonical;

        graph.check_termination()?;
        graph.check_kinds()?;

        debug!("Identity graph built with {} identities", graph.len());
        Ok(graph)
    }

    /// Look up an identity by name, falling back to a case-insensitive match.
    pub fn lookup(&self, name: &str) -> Result<&Arc<Identity>, ConfigError> {
        if let Some(identity) = self.identities.get(name) {
            return Ok(identity);
        }
        let canonical = self.canonical_name(name, |n| self.identities.contains_key(n))?;
        self.identities
            .get(&canonical)
            .ok_or(ConfigError::UnknownIdentity {
                name: name.to_string(),
            })
    }

    /// Declared parent of `identity`, `None` for roots.
    pub fn parent_of(&self, identity: &Identity) -> Result<Option<&Arc<Identity>>, ConfigError> {
        match identity.parent.as_deref() {
            Some(parent) => self.lookup(parent).map(Some),
            None => Ok(None),
        }
    }

    /// Identity names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// The single identity flagged `default`.
    pub fn default_identity(&self) -> Result<&Arc<Identity>, ConfigError> {
        let mut defaults = self
            .order
            .iter()
            .filter_map(|name| self.identities.get(name))
            .filter(|identity| identity.default);
        match (defaults.next(), defaults.next()) {
            (None, _) => Err(ConfigError::NoDefaultIdentity),
            (Some(identity), None) => Ok(identity),
            (Some(first), Some(second)) => {
                let mut names = vec![first.name.clone(), second.name.clone()];
                names.extend(defaults.map(|identity| identity.name.clone()));
                Err(ConfigError::MultipleDefaultIdentities { names })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn canonical_name(
        &self,
        name: &str,
        exists: impl Fn(&str) -> bool,
    ) -> Result<String, ConfigError> {
        if exists(name) {
            return Ok(name.to_string());
        }
        match self.folded.get(&name.to_lowercase()) {
            Some(Some(canonical)) => Ok(canonical.clone()),
            _ => Err(ConfigError::UnknownIdentity {
                name: name.to_string(),
            }),
        }
    }

    /// Every parent walk must reach a root within `len()` hops.
    fn check_termination(&self) -> Result<(), ConfigError> {
        let limit = self.identities.len();
        for name in &self.order {
            let mut current = &self.identities[name];
            let mut hops = 0;
            while let Some(parent) = current.parent.as_deref() {
                hops += 1;
                if hops > limit {
                    return Err(ConfigError::CyclicChain { name: name.clone() });
                }
                current = &self.identities[parent];
            }
        }
        Ok(())
    }

    fn check_kinds(&self) -> Result<(), ConfigError> {
        for name in &self.order {
            let identity = &self.identities[name];
            match (identity.kind.is_root(), identity.parent.is_some()) {
                (true, true) => {
                    return Err(ConfigError::InvalidConfig {
                        identity: name.clone(),
                        reason: format!("{} identities cannot have a parent", identity.kind),
                    })
                }
                (false, false) => {
                    return Err(ConfigError::InvalidConfig {
                        identity: name.clone(),
                        reason: format!("{} identities require a parent", identity.kind),
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn canonical_exists(name: &str, graph: &IdentityGraph) -> bool {
    graph.order.iter().any(|declared| declared == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::IdentityKind;

    fn sample() -> Vec<Identity> {
        vec![
            Identity::new("base", IdentityKind::Provider, None),
            Identity::new("ps", IdentityKind::PermissionSet, Some("base")),
            Identity::new("Admin", IdentityKind::AssumeRole, Some("PS")),
        ]
    }

    #[test]
    fn test_lookup_exact_and_case_insensitive() {
        let graph = IdentityGraph::new(sample()).unwrap();
        assert_eq!(graph.lookup("ps").unwrap().name, "ps");
        assert_eq!(graph.lookup("admin").unwrap().name, "Admin");
        assert_eq!(graph.lookup("ADMIN").unwrap().name, "Admin");
    }

    #[test]
    fn test_parent_names_are_canonicalized() {
        let graph = IdentityGraph::new(sample()).unwrap();
        let admin = graph.lookup("Admin").unwrap();
        assert_eq!(admin.parent_name(), "ps");
        assert_eq!(graph.parent_of(admin).unwrap().unwrap().name, "ps");
    }

    #[test]
    fn test_unknown_identity() {
        let graph = IdentityGraph::new(sample()).unwrap();
        assert_eq!(
            graph.lookup("nobody").unwrap_err(),
            ConfigError::UnknownIdentity {
                name: "nobody".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let result = IdentityGraph::new(vec![Identity::new(
            "role",
            IdentityKind::AssumeRole,
            Some("missing"),
        )]);
        assert!(matches!(result, Err(ConfigError::UnknownIdentity { name }) if name == "missing"));
    }

    #[test]
    fn test_cycle_rejected() {
        let result = IdentityGraph::new(vec![
            Identity::new("a", IdentityKind::AssumeRole, Some("b")),
            Identity::new("b", IdentityKind::AssumeRole, Some("c")),
            Identity::new("c", IdentityKind::AssumeRole, Some("a")),
        ]);
        assert!(matches!(result, Err(ConfigError::CyclicChain { .. })));
    }

    #[test]
    fn test_self_parent_rejected() {
        let result = IdentityGraph::new(vec![Identity::new(
            "loop",
            IdentityKind::AssumeRole,
            Some("loop"),
        )]);
        assert!(matches!(result, Err(ConfigError::CyclicChain { .. })));
    }

    #[test]
    fn test_duplicate_rejected() {
        let result = IdentityGraph::new(vec![
            Identity::new("base", IdentityKind::Provider, None),
            Identity::new("base", IdentityKind::User, None),
        ]);
        assert!(matches!(result, Err(ConfigError::DuplicateIdentity { .. })));
    }

    #[test]
    fn test_kind_parent_requirements() {
        let orphan = IdentityGraph::new(vec![Identity::new(
            "role",
            IdentityKind::AssumeRole,
            None,
        )]);
        assert!(matches!(orphan, Err(ConfigError::InvalidConfig { .. })));

        let chained_root = IdentityGraph::new(vec![
            Identity::new("base", IdentityKind::Provider, None),
            Identity::new("other", IdentityKind::Provider, Some("base")),
        ]);
        assert!(matches!(chained_root, Err(ConfigError::InvalidConfig { .. })));
    }

    #[test]
    fn test_ambiguous_case_folding_requires_exact_name() {
        let graph = IdentityGraph::new(vec![
            Identity::new("dev", IdentityKind::User, None),
            Identity::new("DEV", IdentityKind::User, None),
        ])
        .unwrap();
        assert_eq!(graph.lookup("dev").unwrap().name, "dev");
        assert_eq!(graph.lookup("DEV").unwrap().name, "DEV");
        assert!(graph.lookup("Dev").is_err());
    }

    #[test]
    fn test_first_unknown_parent_in_declaration_order_is_reported() {
        for _ in 0..8 {
            let result = IdentityGraph::new(vec![
                Identity::new("base", IdentityKind::Provider, None),
                Identity::new("a", IdentityKind::AssumeRole, Some("missing-a")),
                Identity::new("b", IdentityKind::AssumeRole, Some("missing-b")),
                Identity::new("c", IdentityKind::AssumeRole, Some("missing-c")),
            ]);
            assert_eq!(
                result.unwrap_err(),
                ConfigError::UnknownIdentity {
                    name: "missing-a".to_string()
                }
            );
        }
    }

    #[test]
    fn test_default_identity() {
        let graph = IdentityGraph::new(sample()).unwrap();
        assert_eq!(graph.default_identity().unwrap_err(), ConfigError::NoDefaultIdentity);

        let mut identities = sample();
        identities[2].default = true;
        let graph = IdentityGraph::new(identities.clone()).unwrap();
        assert_eq!(graph.default_identity().unwrap().name, "Admin");

        identities[0].default = true;
        identities[1].default = true;
        let graph = IdentityGraph::new(identities).unwrap();
        assert_eq!(
            graph.default_identity().unwrap_err(),
            ConfigError::MultipleDefaultIdentities {
                names: vec!["base".to_string(), "ps".to_string(), "Admin".to_string()]
            }
        );
    }

    #[test]
    fn test_names_keep_declaration_order() {
        let graph = IdentityGraph::new(sample()).unwrap();
        assert_eq!(graph.names().collect::<Vec<_>>(), vec!["base", "ps", "Admin"]);
    }
}
