//! Module loading and implementation discovery.
//!
//! Loading reads the declared configuration, the template files it names, and
//! every implementation declaration at the module root. Nothing is cached
//! here: a module is re-derived from its files on each load.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::component::Role;
use crate::manifest::{parse_declarations, ImplementationDecl, ModuleConfig};

/// Why a module could not be loaded or no implementation could be selected.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no config.yaml or config.yml in {}", .0.display())]
    MissingConfig(PathBuf),

    #[error("{}: {detail}", file.display())]
    Malformed { file: PathBuf, detail: String },

    #[error("template '{name}' refers to missing file {}", path.display())]
    MissingTemplate { name: String, path: PathBuf },

    #[error("no {role} implementation found; declared: [{}]", available.join(", "))]
    NoImplementation { role: Role, available: Vec<String> },

    #[error("multiple {role} implementations found: [{}]", candidates.join(", "))]
    Ambiguous { role: Role, candidates: Vec<String> },

    #[error("reading {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> LoadError + '_ {
    move |source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A module's declarations, fully read into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModule {
    /// Module directory; `None` for builtins.
    pub root: Option<PathBuf>,
    pub config: ModuleConfig,
    /// Template name to file contents.
    pub templates: BTreeMap<String, String>,
    /// Every declaration found, qualifying or not, in scan order.
    pub implementations: Vec<ImplementationDecl>,
}

impl LoadedModule {
    /// Declarations that satisfy the declared role's capability.
    pub fn qualifying(&self) -> Vec<&ImplementationDecl> {
        self.implementations
            .iter()
            .filter(|d| d.qualifies_for(self.config.role))
            .collect()
    }

    /// Pick the implementation to instantiate.
    ///
    /// One qualifying declaration is taken as is. Among several, the one named
    /// by `implementation` (or else by `type`) wins.
    pub fn select(&self) -> Result<&ImplementationDecl, LoadError> {
        let qualifying = self.qualifying();
        match qualifying.as_slice() {
            [] => Err(LoadError::NoImplementation {
                role: self.config.role,
                available: self
                    .implementations
                    .iter()
                    .map(|d| d.name.clone())
                    .collect(),
            }),
            [only] => Ok(*only),
            many => {
                let wanted = self
                    .config
                    .implementation
                    .as_deref()
                    .unwrap_or(self.config.type_name.as_str());
                many.iter()
                    .find(|d| d.name == wanted)
                    .copied()
                    .ok_or_else(|| LoadError::Ambiguous {
                        role: self.config.role,
                        candidates: many.iter().map(|d| d.name.clone()).collect(),
                    })
            }
        }
    }
}

/// Reads component modules from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleLoader;

impl ModuleLoader {
    pub fn load(&self, root: &Path) -> Result<LoadedModule, LoadError> {
        let config_path =
            ModuleConfig::locate(root).ok_or_else(|| LoadError::MissingConfig(root.to_path_buf()))?;
        let text = std::fs::read_to_string(&config_path).map_err(io_error(&config_path))?;
        let config = ModuleConfig::parse(&text, &config_path)?;

        let templates = load_templates(root, &config)?;
        let implementations = scan_declarations(root)?;
        debug!(
            root = %root.display(),
            role = %config.role,
            implementations = implementations.len(),
            "loaded module"
        );

        Ok(LoadedModule {
            root: Some(root.to_path_buf()),
            config,
            templates,
            implementations,
        })
    }
}

fn load_templates(
    root: &Path,
    config: &ModuleConfig,
) -> Result<BTreeMap<String, String>, LoadError> {
    let canonical_root = root.canonicalize().map_err(io_error(root))?;
    let mut templates = BTreeMap::new();
    for (name, relative) in &config.templates {
        let path = root.join(relative);
        if !path.is_file() {
            return Err(LoadError::MissingTemplate {
                name: name.clone(),
                path,
            });
        }
        let resolved = path.canonicalize().map_err(io_error(&path))?;
        if !resolved.starts_with(&canonical_root) {
            return Err(LoadError::Malformed {
                file: path,
                detail: format!("template '{name}' points outside the module"),
            });
        }
        let body = std::fs::read_to_string(&resolved).map_err(io_error(&resolved))?;
        templates.insert(name.clone(), body);
    }
    Ok(templates)
}

/// Root-level `*.toml` files, sorted by file name.
fn scan_declarations(root: &Path) -> Result<Vec<ImplementationDecl>, LoadError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(root).map_err(io_error(root))? {
        let path = entry.map_err(io_error(root))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }
    files.sort();

    let mut decls = Vec::new();
    for file in files {
        let text = std::fs::read_to_string(&file).map_err(io_error(&file))?;
        decls.extend(parse_declarations(&text, &file)?);
    }
    Ok(decls)
}
