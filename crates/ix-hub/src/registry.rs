//! Process-local instance memo.
//!
//! Instances are keyed by cache key plus a fingerprint of the constructor
//! arguments. Construction for one key runs at most once at a time; a second
//! caller waiting on the same key receives the first caller's instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::cache_key::CacheKey;
use crate::component::{Component, ConstructorArgs};
use crate::error::Result;
use crate::integrity::ContentHash;
use crate::lock::KeyedMutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InstanceKey {
    cache_key: CacheKey,
    fingerprint: ContentHash,
}

impl InstanceKey {
    fn new(cache_key: &CacheKey, args: &ConstructorArgs) -> Self {
        InstanceKey {
            cache_key: cache_key.clone(),
            fingerprint: args.fingerprint(),
        }
    }
}

/// Memoized component instances.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceKey, Arc<dyn Component>>>,
    guards: KeyedMutex<InstanceKey>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cache_key: &CacheKey, args: &ConstructorArgs) -> Option<Arc<dyn Component>> {
        self.instances
            .read()
            .get(&InstanceKey::new(cache_key, args))
            .cloned()
    }

    /// The memoized instance, or the result of `create` stored for next time.
    pub fn get_or_create<F>(
        &self,
        cache_key: &CacheKey,
        args: &ConstructorArgs,
        create: F,
    ) -> Result<Arc<dyn Component>>
    where
        F: FnOnce() -> Result<Arc<dyn Component>>,
    {
        let key = InstanceKey::new(cache_key, args);
        if let Some(found) = self.instances.read().get(&key) {
            return Ok(found.clone());
        }

        let _guard = self.guards.lock(&key);
        if let Some(found) = self.instances.read().get(&key) {
            return Ok(found.clone());
        }
        let instance = create()?;
        debug!(key = %cache_key, "registered instance");
        self.instances.write().insert(key, instance.clone());
        Ok(instance)
    }

    /// Always build a new instance and overwrite any memoized one.
    pub fn replace<F>(
        &self,
        cache_key: &CacheKey,
        args: &ConstructorArgs,
        create: F,
    ) -> Result<Arc<dyn Component>>
    where
        F: FnOnce() -> Result<Arc<dyn Component>>,
    {
        let key = InstanceKey::new(cache_key, args);
        let _guard = self.guards.lock(&key);
        let instance = create()?;
        debug!(key = %cache_key, "replaced instance");
        self.instances.write().insert(key, instance.clone());
        Ok(instance)
    }

    /// Drop every instance built from `cache_key`, whatever its arguments.
    pub fn remove_cache_key(&self, cache_key: &CacheKey) -> usize {
        let mut instances = self.instances.write();
        let before = instances.len();
        instances.retain(|k, _| k.cache_key != *cache_key);
        before - instances.len()
    }

    pub fn clear(&self) {
        self.instances.write().clear();
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Job, Role, TaskSpec};
    use crate::error::HubError;
    use crate::reference::ReferenceKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Debug)]
    struct Fixed(usize);

    impl Component for Fixed {
        fn role(&self) -> Role {
            Role::Agent
        }
        fn type_name(&self) -> &str {
            "fixed"
        }
        fn implementation(&self) -> &str {
            "Fixed"
        }
        fn invoke(&self, job: &Job) -> crate::error::Result<TaskSpec> {
            Err(HubError::Config {
                detail: format!("{} cannot run {}", self.0, job.name),
            })
        }
    }

    fn key(n: &str) -> CacheKey {
        CacheKey::derive(ReferenceKind::Builtin, n, n, n)
    }

    #[test]
    fn factory_runs_once_under_contention() {
        let registry = Arc::new(InstanceRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let calls = calls.clone();
                thread::spawn(move || {
                    registry
                        .get_or_create(&key("a"), &ConstructorArgs::new(), || {
                            let n = calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Ok(Arc::new(Fixed(n)) as Arc<dyn Component>)
                        })
                        .unwrap()
                })
            })
            .collect();
        let instances: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn arguments_separate_instances() {
        let registry = InstanceRegistry::new();
        let make = |n| move || Ok(Arc::new(Fixed(n)) as Arc<dyn Component>);
        let plain = ConstructorArgs::new();
        let tuned = ConstructorArgs::new().with("x", 1);
        let a = registry.get_or_create(&key("a"), &plain, make(1)).unwrap();
        let b = registry.get_or_create(&key("a"), &tuned, make(2)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&key("a"), &tuned).is_some());

        assert_eq!(registry.remove_cache_key(&key("a")), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn failed_construction_is_not_memoized() {
        let registry = InstanceRegistry::new();
        let err = registry
            .get_or_create(&key("a"), &ConstructorArgs::new(), || {
                Err(HubError::Config {
                    detail: "boom".into(),
                })
            })
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(registry.is_empty());
    }

    #[test]
    fn replace_overwrites() {
        let registry = InstanceRegistry::new();
        let args = ConstructorArgs::new();
        let first = registry
            .get_or_create(&key("a"), &args, || Ok(Arc::new(Fixed(1)) as Arc<dyn Component>))
            .unwrap();
        let second = registry
            .replace(&key("a"), &args, || Ok(Arc::new(Fixed(2)) as Arc<dyn Component>))
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&registry.get(&key("a"), &args).unwrap(), &second));
    }
}
