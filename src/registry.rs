//! Stage-type registry
//!
//! Networks look stage types up by name here. A registry is an ordinary
//! value: build one, register the built-in and application stage types on
//! it, and pass it to network construction.

use crate::error::{Error, Result};
use crate::stage::StageDef;
use crate::stages;
use crate::transport::Transport;
use ahash::AHashMap;
use std::sync::Arc;

/// Mapping from stage type name to definition
#[derive(Debug, Default, Clone)]
pub struct Registry {
    defs: AHashMap<String, Arc<StageDef>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every stage type that needs no transport:
    /// file I/O, round-robin combine, sort and merge.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for def in stages::io::definitions()
            .into_iter()
            .chain(stages::sort::definitions())
        {
            registry.insert(def);
        }
        registry
    }

    /// [`builtin`](Self::builtin) plus the stage types that talk to other
    /// ranks through `transport`: distributed-sort scatter/gather and the
    /// ring transfer pair.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        let mut registry = Self::builtin();
        for def in stages::dsort::definitions(&transport)
            .into_iter()
            .chain(stages::ring::definitions(&transport))
        {
            registry.insert(def);
        }
        registry
    }

    fn insert(&mut self, def: StageDef) {
        self.defs.insert(def.name().to_string(), Arc::new(def));
    }

    /// Add a stage type; a name may only be registered once
    pub fn register(&mut self, def: StageDef) -> Result<()> {
        if self.defs.contains_key(def.name()) {
            return Err(Error::DuplicateStageType(def.name().to_string()));
        }
        tracing::debug!(kind = def.name(), "registered stage type");
        self.insert(def);
        Ok(())
    }

    /// Look a stage type up by name
    pub fn get(&self, name: &str) -> Result<Arc<StageDef>> {
        self.defs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStageType(name.to_string()))
    }

    /// True if `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    /// Every registered definition, sorted by name
    pub fn definitions(&self) -> Vec<Arc<StageDef>> {
        let mut defs: Vec<_> = self.defs.values().cloned().collect();
        defs.sort_by(|a, b| a.name().cmp(b.name()));
        defs
    }

    /// Number of registered stage types
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageLogic, StageIo, Step};
    use crate::transport::LocalCluster;

    struct Noop;

    impl StageLogic for Noop {
        fn step(&mut self, _io: &StageIo<'_>) -> Result<Step> {
            Ok(Step::Terminate)
        }
    }

    fn noop(name: &str) -> StageDef {
        StageDef::new(name, |_| Ok(Box::new(Noop) as Box<dyn StageLogic>))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        assert!(registry.is_empty());

        registry.register(noop("noop")).unwrap();
        assert!(registry.contains("noop"));
        assert_eq!(registry.get("noop").unwrap().name(), "noop");

        assert!(matches!(
            registry.register(noop("noop")),
            Err(Error::DuplicateStageType(_))
        ));
        assert!(matches!(registry.get("missing"), Err(Error::UnknownStageType(_))));
    }

    #[test]
    fn test_builtin_types() {
        let registry = Registry::builtin();
        for kind in ["read-file", "write-file", "multiwrite-file", "rr-combine", "sort", "merge"] {
            assert!(registry.contains(kind), "missing {}", kind);
        }
        assert!(!registry.contains("dsort-scatter"));

        let names: Vec<String> = registry
            .definitions()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_transport_types() {
        let endpoint = LocalCluster::new(1).into_endpoints().remove(0);
        let registry = Registry::with_transport(Arc::new(endpoint));
        for kind in ["dsort-scatter", "dsort-gather", "send-next", "recv-prev", "merge"] {
            assert!(registry.contains(kind), "missing {}", kind);
        }
    }
}
