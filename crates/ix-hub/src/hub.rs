//! The hub: reference in, instance out.
//!
//! A load goes through four stages, each of which can fail with its own
//! error variant:
//!
//! 1. parse the reference string ([`ReferenceParser`])
//! 2. locate the module on disk, resolving and fetching remote revisions
//!    under a per-key lock ([`Hub::resolve`])
//! 3. read the module and pick its implementation ([`Hub::load_module`])
//! 4. construct (or reuse) the instance ([`InstanceRegistry`])
//!
//! Immutable revisions are remembered per hub, so repeating a load touches
//! neither the network nor the disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::builtin::BuiltinCatalog;
use crate::cache::{now_secs, CacheEntry, CacheStore, EntryRecord, PruneReport};
use crate::cache_key::CacheKey;
use crate::component::{
    Component, ComponentFactory, ConstructorArgs, FactoryCatalog, FactoryContext, Role,
};
use crate::config::{BranchPolicy, HubConfig};
use crate::error::{HubError, Result};
use crate::fetch::{Fetcher, GitFetcher};
use crate::integrity::ContentHash;
use crate::loader::{LoadError, LoadedModule, ModuleLoader};
use crate::lock::LockManager;
use crate::reference::{ComponentReference, Credentials, ReferenceKind, ReferenceParser};
use crate::registry::InstanceRegistry;
use crate::revision::{exact_commit, GitResolver, ResolvedRevision, RevisionResolver};

/// One request to resolve and load a component.
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    pub reference: String,
    pub revision: Option<String>,
    pub credentials: Option<Credentials>,
    /// Re-resolve online, re-fetch, and rebuild the instance.
    pub force_reload: bool,
    pub args: ConstructorArgs,
    /// Fail unless the module declares this role.
    pub expect_role: Option<Role>,
}

impl LoadRequest {
    pub fn new(reference: impl Into<String>) -> Self {
        LoadRequest {
            reference: reference.into(),
            ..Self::default()
        }
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn force_reload(mut self, force: bool) -> Self {
        self.force_reload = force;
        self
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key, value);
        self
    }

    pub fn args(mut self, args: ConstructorArgs) -> Self {
        self.args = args;
        self
    }

    pub fn expect_role(mut self, role: Role) -> Self {
        self.expect_role = Some(role);
        self
    }
}

/// Where a resolved module's files come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOrigin {
    /// Registered in memory; no files.
    Builtin,
    /// A local directory read where it is.
    InPlace,
    /// A published cache object.
    Cached,
}

/// A reference pinned to a concrete module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    pub reference: ComponentReference,
    pub cache_key: CacheKey,
    pub origin: ModuleOrigin,
    /// Module directory; `None` for builtins.
    pub path: Option<PathBuf>,
    /// Commit id, content hash, or builtin name.
    pub resolved: String,
    /// Set for git-backed modules.
    pub revision: Option<ResolvedRevision>,
}

type MemoKey = (ReferenceKind, String, Option<String>);

/// Resolves, caches and loads components. Cheap to share across threads.
pub struct Hub {
    config: HubConfig,
    parser: ReferenceParser,
    cache: CacheStore,
    locks: LockManager,
    resolver: Arc<dyn RevisionResolver>,
    fetcher: Arc<dyn Fetcher>,
    builtins: BuiltinCatalog,
    factories: FactoryCatalog,
    loader: ModuleLoader,
    registry: InstanceRegistry,
    resolutions: RwLock<HashMap<MemoKey, ResolvedModule>>,
}

/// Assembles a [`Hub`], replacing any of its collaborators.
pub struct HubBuilder {
    config: HubConfig,
    resolver: Option<Arc<dyn RevisionResolver>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    builtins: BuiltinCatalog,
    factories: FactoryCatalog,
    base_dir: Option<PathBuf>,
}

impl HubBuilder {
    pub fn new(config: HubConfig) -> Self {
        HubBuilder {
            config,
            resolver: None,
            fetcher: None,
            builtins: BuiltinCatalog::standard(),
            factories: FactoryCatalog::new(),
            base_dir: None,
        }
    }

    pub fn resolver(mut self, resolver: impl RevisionResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn fetcher(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    pub fn builtins(mut self, builtins: BuiltinCatalog) -> Self {
        self.builtins = builtins;
        self
    }

    pub fn factory(
        mut self,
        name: impl Into<String>,
        factory: impl ComponentFactory + 'static,
    ) -> Self {
        self.factories.register(name, factory);
        self
    }

    /// Directory relative local references are resolved against.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<Hub> {
        self.config.validate()?;
        let mut parser =
            ReferenceParser::new(self.config.endpoint.trim()).with_builtins(self.builtins.names());
        if let Some(dir) = self.base_dir {
            parser = parser.with_base_dir(dir);
        }
        let cache = CacheStore::new(&self.config.cache_dir);
        let locks = LockManager::new(cache.locks_dir(), self.config.lock_timeout);
        let timeout = self.config.fetch_timeout;
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(GitResolver::new(timeout)));
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(GitFetcher::new(timeout)));
        debug!(
            cache_dir = %self.config.cache_dir.display(),
            endpoint = %self.config.endpoint,
            offline = self.config.offline,
            "hub ready"
        );
        Ok(Hub {
            config: self.config,
            parser,
            cache,
            locks,
            resolver,
            fetcher,
            builtins: self.builtins,
            factories: self.factories,
            loader: ModuleLoader,
            registry: InstanceRegistry::new(),
            resolutions: RwLock::new(HashMap::new()),
        })
    }
}

impl Hub {
    /// A hub with the default git backends and standard builtins.
    pub fn new(config: HubConfig) -> Result<Self> {
        HubBuilder::new(config).build()
    }

    pub fn builder(config: HubConfig) -> HubBuilder {
        HubBuilder::new(config)
    }

    /// A hub configured from `$IX_HOME/config.toml` and the environment.
    pub fn from_env() -> Result<Self> {
        Self::new(HubConfig::load()?)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn builtins(&self) -> &BuiltinCatalog {
        &self.builtins
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Parse a request's reference without resolving it.
    pub fn parse(&self, request: &LoadRequest) -> Result<ComponentReference> {
        self.parser.parse(
            &request.reference,
            request.revision.as_deref(),
            request.credentials.clone(),
        )
    }

    /// Resolve, load and instantiate a component.
    pub fn resolve_and_load(&self, request: &LoadRequest) -> Result<Arc<dyn Component>> {
        let resolved = self.resolve(request)?;
        let create = || {
            let module = self.load_module(&resolved)?;
            self.instantiate(&resolved, &module, &request.args)
        };
        let instance = if request.force_reload {
            self.registry
                .replace(&resolved.cache_key, &request.args, create)?
        } else {
            self.registry
                .get_or_create(&resolved.cache_key, &request.args, create)?
        };

        if let Some(expected) = request.expect_role {
            if instance.role() != expected {
                return Err(HubError::RoleMismatch {
                    reference: resolved.reference.to_string(),
                    cache_key: resolved.cache_key.to_string(),
                    expected,
                    declared: instance.role(),
                });
            }
        }
        Ok(instance)
    }

    /// Pin a reference to a concrete module, fetching it if needed.
    pub fn resolve(&self, request: &LoadRequest) -> Result<ResolvedModule> {
        let reference = self.parse(request)?;
        match reference.kind() {
            ReferenceKind::Builtin => Ok(self.builtin_module(reference)),
            ReferenceKind::Local if reference.revision().is_none() => {
                self.in_place_module(reference)
            }
            ReferenceKind::Local => {
                let is_repo = reference
                    .local_path()
                    .is_some_and(|p| p.join(".git").exists());
                if !is_repo {
                    return Err(HubError::InvalidReference {
                        reference: reference.to_string(),
                        detail: "a revision was given but the directory is not a git repository"
                            .into(),
                    });
                }
                self.materialize(reference, request.force_reload)
            }
            ReferenceKind::Remote => self.materialize(reference, request.force_reload),
        }
    }

    /// Read a resolved module's declarations.
    pub fn load_module(&self, resolved: &ResolvedModule) -> Result<LoadedModule> {
        let reference = resolved.reference.to_string();
        match (resolved.origin, &resolved.path) {
            (ModuleOrigin::Builtin, _) | (_, None) => self
                .builtins
                .get(resolved.reference.identity())
                .map(|b| b.module())
                .ok_or_else(|| HubError::InvalidReference {
                    reference,
                    detail: "builtin is no longer registered".into(),
                }),
            (ModuleOrigin::InPlace, Some(path)) => {
                self.loader
                    .load(path)
                    .map_err(|e| HubError::InvalidModule {
                        reference,
                        path: path.clone(),
                        detail: e.to_string(),
                    })
            }
            (ModuleOrigin::Cached, Some(path)) => {
                self.loader
                    .load(path)
                    .map_err(|e| HubError::CorruptCacheEntry {
                        reference,
                        cache_key: resolved.cache_key.to_string(),
                        path: path.clone(),
                        detail: e.to_string(),
                    })
            }
        }
    }

    /// Select the module's implementation and build it.
    pub fn instantiate(
        &self,
        resolved: &ResolvedModule,
        module: &LoadedModule,
        args: &ConstructorArgs,
    ) -> Result<Arc<dyn Component>> {
        let reference = resolved.reference.to_string();
        let decl = module
            .select()
            .map_err(|e| discovery_error(e, resolved))?;
        let factory = self
            .factories
            .get(&decl.factory)
            .ok_or_else(|| HubError::UnknownFactory {
                reference: reference.clone(),
                implementation: decl.name.clone(),
                factory: decl.factory.clone(),
            })?;
        let ctx = FactoryContext {
            module,
            implementation: decl,
            args,
        };
        let instance = factory.create(&ctx).map_err(|e| HubError::Construction {
            reference,
            implementation: decl.name.clone(),
            detail: e.to_string(),
        })?;
        info!(
            reference = %resolved.reference,
            key = %resolved.cache_key,
            implementation = %decl.name,
            "instantiated component"
        );
        Ok(instance)
    }

    /// Remove cached modules: everything, one reference, or one reference at
    /// one revision. Matching in-memory instances are evicted too.
    pub fn clear_cache(&self, reference: Option<&str>, revision: Option<&str>) -> Result<usize> {
        let Some(raw) = reference else {
            let removed = self.cache.clear()?;
            self.resolutions.write().clear();
            self.registry.clear();
            return Ok(removed);
        };

        let reference = self.parser.parse(raw, revision, None)?;
        match reference.kind() {
            ReferenceKind::Builtin => {
                let key = self.builtin_module(reference).cache_key;
                self.registry.remove_cache_key(&key);
                Ok(0)
            }
            ReferenceKind::Local if revision.is_none() => {
                // The in-place instance has no cache entry of its own.
                if let Ok(module) = self.in_place_module(reference.clone()) {
                    self.registry.remove_cache_key(&module.cache_key);
                }
                self.evict(&reference, None)
            }
            _ => self.evict(&reference, revision),
        }
    }

    fn evict(&self, reference: &ComponentReference, revision: Option<&str>) -> Result<usize> {
        let removed = self.cache.remove_matching(reference.identity(), revision)?;
        for key in &removed {
            self.registry.remove_cache_key(key);
        }
        self.forget(reference, revision);
        info!(reference = %reference, removed = removed.len(), "cleared cache entries");
        Ok(removed.len())
    }

    /// Delete cache objects no entry points to.
    pub fn prune_cache(&self) -> Result<PruneReport> {
        self.cache.prune(&self.locks)
    }

    /// Every published cache entry.
    pub fn cached_entries(&self) -> Result<Vec<CacheEntry>> {
        self.cache.list()
    }

    fn builtin_module(&self, reference: ComponentReference) -> ResolvedModule {
        let name = reference.identity().to_string();
        ResolvedModule {
            cache_key: CacheKey::derive(ReferenceKind::Builtin, &name, &name, &name),
            origin: ModuleOrigin::Builtin,
            path: None,
            resolved: name,
            revision: None,
            reference,
        }
    }

    fn in_place_module(&self, reference: ComponentReference) -> Result<ResolvedModule> {
        let path = reference
            .local_path()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let hash = ContentHash::of_tree(&path).map_err(|e| HubError::InvalidModule {
            reference: reference.to_string(),
            path: path.clone(),
            detail: format!("hashing module tree: {e}"),
        })?;
        let dir_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| reference.name().to_string());
        Ok(ResolvedModule {
            cache_key: CacheKey::derive(
                ReferenceKind::Local,
                &dir_name,
                reference.identity(),
                hash.as_str(),
            ),
            origin: ModuleOrigin::InPlace,
            path: Some(path),
            resolved: hash.to_string(),
            revision: None,
            reference,
        })
    }

    fn memo_key(reference: &ComponentReference) -> MemoKey {
        (
            reference.kind(),
            reference.identity().to_string(),
            reference.revision().map(str::to_string),
        )
    }

    fn forget(&self, reference: &ComponentReference, revision: Option<&str>) {
        self.resolutions.write().retain(|(kind, identity, requested), module| {
            let same_source = *kind == reference.kind() && identity == reference.identity();
            let same_revision = match revision {
                None => true,
                Some(rev) => {
                    requested.as_deref() == Some(rev)
                        || (rev.len() >= 4 && module.resolved.starts_with(rev))
                }
            };
            !(same_source && same_revision)
        });
    }

    /// Whether a previously resolved revision may be reused without asking the remote.
    fn reusable(&self, revision: &ResolvedRevision) -> bool {
        !revision.kind.is_mutable() || self.config.branch_policy == BranchPolicy::Pinned
    }

    fn module_for(
        &self,
        reference: ComponentReference,
        key: CacheKey,
        entry: CacheEntry,
        revision: ResolvedRevision,
    ) -> ResolvedModule {
        ResolvedModule {
            reference,
            cache_key: key,
            origin: ModuleOrigin::Cached,
            path: Some(entry.path),
            resolved: revision.commit.clone(),
            revision: Some(revision),
        }
    }

    fn key_for(reference: &ComponentReference, commit: &str) -> CacheKey {
        CacheKey::derive(
            reference.kind(),
            reference.name(),
            reference.identity(),
            commit,
        )
    }

    fn remember(&self, module: &ResolvedModule) {
        if module.revision.as_ref().is_some_and(|r| self.reusable(r)) {
            self.resolutions
                .write()
                .insert(Self::memo_key(&module.reference), module.clone());
        }
    }

    /// Locate a git-backed module, fetching and publishing it when absent.
    fn materialize(&self, reference: ComponentReference, force: bool) -> Result<ResolvedModule> {
        let memo_key = Self::memo_key(&reference);

        if !force {
            if let Some(hit) = self.resolutions.read().get(&memo_key) {
                debug!(reference = %reference, key = %hit.cache_key, "resolution memo hit");
                return Ok(hit.clone());
            }
        }

        if self.config.offline {
            return self.offline_module(reference, force);
        }

        let pinned = if force {
            None
        } else {
            self.cache
                .pinned_revision(reference.identity(), reference.revision())?
                .filter(|r| self.reusable(r))
        };
        let (revision, online) = match pinned {
            Some(revision) => (revision, false),
            None => (
                self.resolver.resolve(&reference, reference.revision())?,
                true,
            ),
        };
        let key = Self::key_for(&reference, &revision.commit);
        let with_context = |e: HubError| e.with_reference(&reference);

        if !force {
            if let Some(entry) = self.cache.lookup(&key).map_err(with_context)? {
                info!(reference = %reference, key = %key, "cache hit");
                if online {
                    self.cache.pin_revision(reference.identity(), &revision)?;
                }
                let module = self.module_for(reference, key, entry, revision);
                self.remember(&module);
                return Ok(module);
            }
        }

        let _lock = self.locks.acquire(&key).map_err(with_context)?;
        if !force {
            if let Some(entry) = self.cache.lookup(&key).map_err(with_context)? {
                debug!(reference = %reference, key = %key, "published by another writer");
                self.cache.pin_revision(reference.identity(), &revision)?;
                let module = self.module_for(reference, key, entry, revision);
                self.remember(&module);
                return Ok(module);
            }
        }

        let entry = self.fetch_and_publish(&reference, &key, &revision)?;
        self.cache.pin_revision(reference.identity(), &revision)?;
        let module = self.module_for(reference, key, entry, revision);
        if force {
            self.resolutions.write().remove(&memo_key);
        }
        self.remember(&module);
        Ok(module)
    }

    fn offline_module(&self, reference: ComponentReference, force: bool) -> Result<ResolvedModule> {
        let offline = || HubError::Offline {
            reference: reference.to_string(),
        };
        if force {
            return Err(offline());
        }
        let pinned = self
            .cache
            .pinned_revision(reference.identity(), reference.revision())?;
        let Some(revision) = pinned.or_else(|| reference.revision().and_then(exact_commit)) else {
            return Err(offline());
        };
        let key = Self::key_for(&reference, &revision.commit);
        match self
            .cache
            .lookup(&key)
            .map_err(|e| e.with_reference(&reference))?
        {
            Some(entry) => {
                debug!(reference = %reference, key = %key, "offline cache hit");
                let module = self.module_for(reference, key, entry, revision);
                self.remember(&module);
                Ok(module)
            }
            None => Err(offline()),
        }
    }

    /// Fetch into staging, check the tree loads, then publish. Caller holds the key lock.
    fn fetch_and_publish(
        &self,
        reference: &ComponentReference,
        key: &CacheKey,
        revision: &ResolvedRevision,
    ) -> Result<CacheEntry> {
        let staging = self.cache.create_staging(key)?;
        info!(reference = %reference, key = %key, commit = %revision.commit, "fetching");

        let root = self
            .fetcher
            .fetch(reference, revision, staging.path())
            .map_err(|e| match e {
                HubError::Fetch {
                    reference: r,
                    detail,
                    ..
                } => HubError::Fetch {
                    reference: r,
                    cache_key: key.to_string(),
                    detail,
                },
                other => other.with_reference(reference),
            })?;
        if root != staging.path() {
            return Err(HubError::Fetch {
                reference: reference.to_string(),
                cache_key: key.to_string(),
                detail: format!(
                    "fetcher placed the module at {} instead of the staging directory",
                    root.display()
                ),
            });
        }

        self.loader
            .load(staging.path())
            .map_err(|e| HubError::InvalidModule {
                reference: reference.to_string(),
                path: staging.path().to_path_buf(),
                detail: format!(
                    "fetched tree at {} is not a valid module: {e}",
                    revision.commit
                ),
            })?;

        let record = EntryRecord {
            key: key.clone(),
            object: String::new(),
            kind: reference.kind(),
            identity: reference.identity().to_string(),
            name: reference.name().to_string(),
            revision: reference.revision().map(str::to_string),
            commit: revision.commit.clone(),
            revision_kind: Some(revision.kind),
            fetched_at: now_secs(),
        };
        self.cache.publish(staging, record)
    }
}

fn discovery_error(e: LoadError, resolved: &ResolvedModule) -> HubError {
    let reference = resolved.reference.to_string();
    let cache_key = resolved.cache_key.to_string();
    match e {
        LoadError::NoImplementation { role, available } => HubError::NoImplementationFound {
            reference,
            cache_key,
            role,
            available,
        },
        LoadError::Ambiguous { role, candidates } => HubError::AmbiguousImplementation {
            reference,
            cache_key,
            role,
            candidates,
        },
        other => HubError::InvalidModule {
            reference,
            path: resolved.path.clone().unwrap_or_default(),
            detail: other.to_string(),
        },
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("config", &self.config)
            .field("builtins", &self.builtins.names().collect::<Vec<_>>())
            .field("factories", &self.factories)
            .field("registry", &self.registry)
            .finish()
    }
}
