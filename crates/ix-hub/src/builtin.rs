//! Builtin components.
//!
//! Builtins are registered in memory by the host and go through the same
//! discovery and instantiation path as modules read from disk.

use std::collections::BTreeMap;

use serde_json::json;

use crate::component::Role;
use crate::loader::LoadedModule;
use crate::manifest::{ImplementationDecl, ModuleConfig};

const SWE_AGENT_IMAGE: &str = "ghcr.io/interaxions/swe-agent:latest";
const SWE_AGENT_MAIN: &str =
    "sweagent run --config {{ sweagent_config }} --instance {{ instance_id }}\n";
const SWE_BENCH_VERIFY: &str =
    "python -m swebench.harness.run_evaluation --predictions_path {{ predictions_path }}\n";

/// Canonical builtin name: lowercase, `-` folded to `_`.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('-', "_")
}

/// A builtin module definition.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinComponent {
    name: String,
    config: ModuleConfig,
    templates: BTreeMap<String, String>,
    implementations: Vec<ImplementationDecl>,
}

impl BuiltinComponent {
    pub fn new(name: &str, config: ModuleConfig) -> Self {
        BuiltinComponent {
            name: normalize_name(name),
            config,
            templates: BTreeMap::new(),
            implementations: Vec::new(),
        }
    }

    pub fn with_template(mut self, name: impl Into<String>, body: impl Into<String>) -> Self {
        self.templates.insert(name.into(), body.into());
        self
    }

    pub fn with_implementation(mut self, decl: ImplementationDecl) -> Self {
        self.implementations.push(decl);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    /// The builtin as a loaded module.
    pub fn module(&self) -> LoadedModule {
        LoadedModule {
            root: None,
            config: self.config.clone(),
            templates: self.templates.clone(),
            implementations: self.implementations.clone(),
        }
    }
}

/// Builtins known to a hub, keyed by normalized name.
#[derive(Debug, Clone, Default)]
pub struct BuiltinCatalog {
    entries: BTreeMap<String, BuiltinComponent>,
}

impl BuiltinCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The components that ship with Interaxions.
    pub fn standard() -> Self {
        let mut catalog = Self::new();

        let mut agent = ModuleConfig::new(Role::Agent, "swe-agent");
        agent.params.extend([
            ("image".to_string(), json!(SWE_AGENT_IMAGE)),
            ("max_iterations".to_string(), json!(100)),
            ("num_retries".to_string(), json!(3)),
        ]);
        catalog.register(
            BuiltinComponent::new("swe_agent", agent)
                .with_template("main", SWE_AGENT_MAIN)
                .with_implementation(ImplementationDecl::new("SWEAgent", Role::Agent)),
        );

        let mut env = ModuleConfig::new(Role::Environment, "swe-bench");
        env.params.insert("predictions_path".into(), json!("gold"));
        let factory = ImplementationDecl::new("SWEBenchFactory", Role::Environment);
        catalog.register(
            BuiltinComponent::new("swe_bench", env)
                .with_template("verify", SWE_BENCH_VERIFY)
                .with_implementation(factory),
        );

        let mut workflow = ModuleConfig::new(Role::Workflow, "rollout-and-verify");
        let steps = json!(["rollout", "verify"]);
        workflow.params.insert("steps".into(), steps);
        let rollout = ImplementationDecl::new("RolloutAndVerify", Role::Workflow);
        catalog.register(
            BuiltinComponent::new("rollout_and_verify", workflow).with_implementation(rollout),
        );

        catalog
    }

    /// Add or replace a builtin.
    pub fn register(&mut self, component: BuiltinComponent) {
        self.entries.insert(component.name.clone(), component);
    }

    /// Look up by any spelling that normalizes to a registered name.
    pub fn get(&self, name: &str) -> Option<&BuiltinComponent> {
        self.entries.get(&normalize_name(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
