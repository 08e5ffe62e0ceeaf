//! Component hub for Interaxions.
//!
//! Turns a reference such as `"org/repo"` at `"v1.0.0"`, a local directory,
//! or a builtin name into a live component instance, and keeps the fetched
//! sources in a shared on-disk cache.
//!
//! # Architecture
//!
//! - **References** are classified by [`ReferenceParser`]: builtin, local
//!   directory, full URL, or `org/repo` against the configured endpoint.
//! - **Revisions** of git sources are pinned to commits by a
//!   [`RevisionResolver`] and materialized by a [`Fetcher`].
//! - **The cache** ([`CacheStore`]) publishes fetched trees atomically under a
//!   per-key lock ([`LockManager`]) that spans threads and processes.
//! - **Modules** are read by [`ModuleLoader`]; their `[[implementation]]`
//!   declarations pick the factory that builds the instance.
//! - **Instances** are memoized per cache key and constructor arguments in
//!   the [`InstanceRegistry`].
//!
//! [`Hub`] ties these together.

pub mod builtin;
pub mod cache;
pub mod cache_key;
pub mod component;
pub mod config;
pub mod error;
pub mod fetch;
pub mod git;
pub mod hub;
pub mod integrity;
pub mod loader;
pub mod lock;
pub mod manifest;
pub mod reference;
pub mod registry;
pub mod revision;

// Re-exports for convenience.
pub use builtin::{normalize_name, BuiltinCatalog, BuiltinComponent};
pub use cache::{CacheEntry, CacheStore, EntryRecord, PruneReport};
pub use cache_key::CacheKey;
pub use component::{
    Capability, Component, ComponentFactory, ConstructorArgs, DeclarativeComponent,
    FactoryCatalog, FactoryContext, FactoryError, Job, Role, TaskSpec, DECLARATIVE_FACTORY,
};
pub use config::{BranchPolicy, HubConfig};
pub use error::{HubError, Result};
pub use fetch::{Fetcher, GitFetcher};
pub use git::Git;
pub use hub::{Hub, HubBuilder, LoadRequest, ModuleOrigin, ResolvedModule};
pub use integrity::ContentHash;
pub use loader::{LoadError, LoadedModule, ModuleLoader};
pub use lock::{KeyLock, LockManager};
pub use manifest::{ImplementationDecl, ModuleConfig};
pub use reference::{ComponentReference, Credentials, ReferenceKind, ReferenceParser};
pub use registry::InstanceRegistry;
pub use revision::{GitResolver, ResolvedRevision, RevisionKind, RevisionResolver};
