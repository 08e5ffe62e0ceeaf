//! Module manifest parsing.
//!
//! A component module carries two kinds of declaration at its root:
//!
//! - `config.yaml` (or `config.yml`): the declared role, type name, optional
//!   implementation name, template files, and free-form parameters.
//! - `*.toml` files with `[[implementation]]` tables naming the
//!   implementations the module provides and the operations they support.
//!
//! ```toml
//! [[implementation]]
//! name = "RolloutAndVerify"
//! role = "workflow"
//! provides = ["create_workflow(job) -> workflow"]
//! factory = "declarative"
//!
//! [implementation.params]
//! max_attempts = 3
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::component::{Role, DECLARATIVE_FACTORY};
use crate::loader::LoadError;

/// Accepted names for the declared configuration, in lookup order.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["config.yaml", "config.yml"];

/// The declared configuration of a module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleConfig {
    pub role: Role,
    /// Declared type name (`type` key).
    pub type_name: String,
    /// Explicit implementation choice, used when several qualify.
    pub implementation: Option<String>,
    /// Template name to path relative to the module root.
    pub templates: BTreeMap<String, PathBuf>,
    /// Every other key, passed through untouched.
    pub params: BTreeMap<String, Value>,
}

impl ModuleConfig {
    pub fn new(role: Role, type_name: impl Into<String>) -> Self {
        ModuleConfig {
            role,
            type_name: type_name.into(),
            implementation: None,
            templates: BTreeMap::new(),
            params: BTreeMap::new(),
        }
    }

    /// Find the config file under `root`, preferring `config.yaml`.
    pub fn locate(root: &Path) -> Option<PathBuf> {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| root.join(name))
            .find(|p| p.is_file())
    }

    /// Parse a YAML document. `file` is only used in error messages.
    pub fn parse(text: &str, file: &Path) -> Result<Self, LoadError> {
        let malformed = |detail: String| LoadError::Malformed {
            file: file.to_path_buf(),
            detail,
        };

        let yaml: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| malformed(e.to_string()))?;
        let json = serde_json::to_value(yaml).map_err(|e| malformed(e.to_string()))?;
        let mut map = match json {
            Value::Object(map) if !map.is_empty() => map,
            Value::Object(_) | Value::Null => {
                return Err(malformed("configuration is empty".into()));
            }
            _ => return Err(malformed("configuration must be a mapping".into())),
        };

        let role_value = map
            .remove("repo_type")
            .or_else(|| map.remove("role"))
            .ok_or_else(|| malformed("missing `repo_type`".into()))?;
        let role = match role_value {
            Value::String(s) => s.parse::<Role>().map_err(malformed)?,
            other => return Err(malformed(format!("`repo_type` must be a string, got {other}"))),
        };

        let type_name = match map.remove("type") {
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            Some(_) => return Err(malformed("`type` must be a non-empty string".into())),
            None => return Err(malformed("missing `type`".into())),
        };

        let implementation = match map.remove("implementation") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => return Err(malformed("`implementation` must be a string".into())),
        };

        let mut templates = BTreeMap::new();
        match map.remove("templates") {
            None | Some(Value::Null) => {}
            Some(Value::Object(entries)) => {
                for (name, path) in entries {
                    match path {
                        Value::String(p) => {
                            templates.insert(name, PathBuf::from(p));
                        }
                        _ => {
                            return Err(malformed(format!(
                                "template '{name}' must map to a file path"
                            )))
                        }
                    }
                }
            }
            Some(_) => return Err(malformed("`templates` must be a mapping".into())),
        }

        Ok(ModuleConfig {
            role,
            type_name,
            implementation,
            templates,
            params: map.into_iter().collect(),
        })
    }
}

/// One `[[implementation]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationDecl {
    pub name: String,
    pub role: Role,
    /// Operation signatures, e.g. `"create_task(job) -> task"`.
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default = "default_factory")]
    pub factory: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// File the declaration was read from.
    #[serde(skip)]
    pub source: Option<String>,
}

fn default_factory() -> String {
    DECLARATIVE_FACTORY.to_string()
}

impl ImplementationDecl {
    /// A declarative implementation providing `role`'s capability.
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        ImplementationDecl {
            name: name.into(),
            role,
            provides: vec![role.capability().signature().to_string()],
            factory: default_factory(),
            params: BTreeMap::new(),
            source: None,
        }
    }

    /// Role matches and the role's capability is among `provides`.
    pub fn qualifies_for(&self, role: Role) -> bool {
        self.role == role && role.capability().is_provided_by(&self.provides)
    }
}

#[derive(Deserialize)]
struct DeclarationFile {
    #[serde(default)]
    implementation: Vec<ImplementationDecl>,
}

/// Parse the `[[implementation]]` tables in a TOML document.
///
/// Documents without an `implementation` key contribute nothing.
pub fn parse_declarations(text: &str, file: &Path) -> Result<Vec<ImplementationDecl>, LoadError> {
    let malformed = |e: toml::de::Error| LoadError::Malformed {
        file: file.to_path_buf(),
        detail: e.to_string(),
    };
    let table: toml::Table = toml::from_str(text).map_err(malformed)?;
    if !table.contains_key("implementation") {
        return Ok(Vec::new());
    }
    let parsed: DeclarationFile = toml::from_str(text).map_err(malformed)?;
    let source = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());
    Ok(parsed
        .implementation
        .into_iter()
        .map(|mut decl| {
            decl.source = source.clone();
            decl
        })
        .collect())
}
