//! In-memory stand-ins for the git backends.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use ix_hub::{
    ComponentReference, Fetcher, HubError, ResolvedRevision, Result, RevisionKind,
    RevisionResolver, Role,
};

/// What a fetched module declares.
#[derive(Debug, Clone)]
pub struct ModuleShape {
    pub role: Role,
    pub implementations: Vec<String>,
    /// Written as `implementation:` in the declared configuration.
    pub explicit: Option<String>,
    /// Skip `config.yaml` entirely.
    pub broken: bool,
}

impl ModuleShape {
    pub fn single(role: Role, implementation: &str) -> Self {
        ModuleShape {
            role,
            implementations: vec![implementation.to_string()],
            explicit: None,
            broken: false,
        }
    }
}

#[derive(Debug)]
struct State {
    refs: HashMap<Option<String>, ResolvedRevision>,
    shape: ModuleShape,
    fetch_delay: Duration,
}

/// A fake remote serving every repository identically.
///
/// Clones share state, so one clone can be handed to a hub as resolver and
/// another as fetcher while the test keeps a third to inspect counters.
#[derive(Debug, Clone)]
pub struct FakeRemote {
    state: Arc<Mutex<State>>,
    resolves: Arc<AtomicUsize>,
    fetches: Arc<AtomicUsize>,
}

impl FakeRemote {
    pub fn new(shape: ModuleShape) -> Self {
        FakeRemote {
            state: Arc::new(Mutex::new(State {
                refs: HashMap::new(),
                shape,
                fetch_delay: Duration::ZERO,
            })),
            resolves: Arc::new(AtomicUsize::new(0)),
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn set(
        &self,
        requested: Option<&str>,
        commit: &str,
        kind: RevisionKind,
        ref_name: Option<String>,
    ) {
        self.state.lock().refs.insert(
            requested.map(str::to_string),
            ResolvedRevision {
                requested: requested.map(str::to_string),
                commit: commit.to_string(),
                kind,
                ref_name,
            },
        );
    }

    pub fn tag(&self, name: &str, commit: &str) -> &Self {
        let ref_name = Some(format!("refs/tags/{name}"));
        self.set(Some(name), commit, RevisionKind::Tag, ref_name);
        self
    }

    pub fn branch(&self, name: &str, commit: &str) -> &Self {
        let ref_name = Some(format!("refs/heads/{name}"));
        self.set(Some(name), commit, RevisionKind::Branch, ref_name);
        self
    }

    pub fn default_branch(&self, commit: &str) -> &Self {
        let ref_name = Some("HEAD".to_string());
        self.set(None, commit, RevisionKind::DefaultBranch, ref_name);
        self
    }

    pub fn set_shape(&self, shape: ModuleShape) {
        self.state.lock().shape = shape;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.lock().fetch_delay = delay;
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl RevisionResolver for FakeRemote {
    fn resolve(
        &self,
        source: &ComponentReference,
        revision: Option<&str>,
    ) -> Result<ResolvedRevision> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let key = revision.map(str::to_string);
        let found = self.state.lock().refs.get(&key).cloned();
        found.ok_or_else(|| HubError::RevisionNotFound {
            reference: source.to_string(),
            revision: revision.unwrap_or("HEAD").to_string(),
            detail: "no such ref".into(),
        })
    }
}

impl Fetcher for FakeRemote {
    fn fetch(
        &self,
        _source: &ComponentReference,
        resolved: &ResolvedRevision,
        dest: &Path,
    ) -> Result<PathBuf> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (shape, delay) = {
            let state = self.state.lock();
            (state.shape.clone(), state.fetch_delay)
        };
        std::thread::sleep(delay);
        write_module(dest, &shape, &resolved.commit);
        Ok(dest.to_path_buf())
    }
}

/// Write a module directory with `shape`'s declarations.
pub fn write_module(dest: &Path, shape: &ModuleShape, commit: &str) {
    fs::create_dir_all(dest).unwrap();
    if !shape.broken {
        let mut config = format!(
            "repo_type: {}\ntype: sample\ncommit: \"{commit}\"\n",
            shape.role
        );
        if let Some(explicit) = &shape.explicit {
            config.push_str(&format!("implementation: {explicit}\n"));
        }
        fs::write(dest.join("config.yaml"), config).unwrap();
    }

    let signature = shape.role.capability().signature();
    let mut decls = String::new();
    for name in &shape.implementations {
        decls.push_str(&format!(
            "[[implementation]]\nname = \"{name}\"\nrole = \"{}\"\nprovides = [\"{signature}\"]\n\n",
            shape.role
        ));
    }
    fs::write(dest.join("component.toml"), decls).unwrap();
}
