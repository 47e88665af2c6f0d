//! Verb to component lookup.

use crate::builtin;
use crate::Component;
use std::collections::HashMap;
use std::sync::Arc;

pub struct Registry {
    components: HashMap<&'static str, Arc<dyn Component>>,
    aliases: HashMap<&'static str, &'static str>,
}

impl Registry {
    /// All builtin verbs.
    pub fn builtin() -> Registry {
        let mut registry = Registry {
            components: HashMap::new(),
            aliases: HashMap::new(),
        };
        registry.register(Arc::new(builtin::run::Run));
        registry.register(Arc::new(builtin::transfer::Transfer));
        registry.register(Arc::new(builtin::arg::CacheArg::arg()));
        registry.register(Arc::new(builtin::arg::CacheArg::env()));
        registry.register(Arc::new(builtin::cachefile::Cachefile));
        registry.register(Arc::new(builtin::cacheevict::Cacheevict));
        registry.register(Arc::new(builtin::workdir::Workdir));
        registry.register(Arc::new(builtin::query::Query));
        registry.register(Arc::new(builtin::query_wait::QueryWait));
        registry.register(Arc::new(builtin::job_wait::JobWait));
        registry.register(Arc::new(builtin::wait::Wait));
        registry.register(Arc::new(builtin::dnf::Dnf));
        registry.register(Arc::new(builtin::service::Service));
        registry.register(Arc::new(builtin::echo::Echo));
        registry.alias("ADD", "COPY");
        registry
    }

    pub fn register(&mut self, component: Arc<dyn Component>) {
        self.components.insert(component.verb(), component);
    }

    fn alias(&mut self, alias: &'static str, verb: &'static str) {
        self.aliases.insert(alias, verb);
    }

    pub fn get(&self, verb: &str) -> Option<Arc<dyn Component>> {
        let verb = verb.to_uppercase();
        let verb = self
            .aliases
            .get(verb.as_str())
            .copied()
            .unwrap_or(verb.as_str());
        self.components.get(verb).cloned()
    }

    pub fn verbs(&self) -> Vec<&'static str> {
        let mut verbs: Vec<_> = self.components.keys().copied().collect();
        verbs.sort_unstable();
        verbs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let registry = Registry::builtin();
        for verb in [
            "RUN",
            "COPY",
            "ARG",
            "ENV",
            "CACHEFILE",
            "CACHEEVICT",
            "WORKDIR",
            "QUERY",
            "QUERY_WAIT",
            "JOB_WAIT",
            "WAIT",
            "DNF",
            "SERVICE",
            "ECHO",
        ] {
            assert!(registry.get(verb).is_some(), "missing verb {verb}");
        }
    }

    #[test]
    fn test_add_aliases_copy() {
        let registry = Registry::builtin();
        let component = registry.get("ADD").unwrap();
        assert_eq!(component.verb(), "COPY");
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = Registry::builtin();
        assert!(registry.get("run").is_some());
    }

    #[test]
    fn test_unknown_verb_is_none() {
        let registry = Registry::builtin();
        assert!(registry.get("NOPE").is_none());
    }

    #[test]
    fn test_lock_names_shared_by_aliases() {
        let registry = Registry::builtin();
        assert_eq!(registry.get("ARG").unwrap().lock_name(), Some("arg"));
        assert_eq!(registry.get("ENV").unwrap().lock_name(), Some("arg"));
        assert_eq!(registry.get("COPY").unwrap().lock_name(), Some("copy"));
        assert_eq!(registry.get("ADD").unwrap().lock_name(), Some("copy"));
    }
}
