//! Component contract.
//!
//! A loaded module yields an instance implementing [`Component`]. Instances
//! are produced by a [`ComponentFactory`] selected by name from a
//! [`FactoryCatalog`]. The catalog always carries the `declarative` factory,
//! which turns a module's declared configuration directly into a component.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::integrity::ContentHash;
use crate::loader::LoadedModule;
use crate::manifest::ImplementationDecl;

/// Name of the factory every catalog provides.
pub const DECLARATIVE_FACTORY: &str = "declarative";

/// The three kinds of component a module can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    Agent,
    Environment,
    Workflow,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::Environment => "environment",
            Role::Workflow => "workflow",
        }
    }

    /// The operation an implementation must provide to fill this role.
    pub fn capability(&self) -> Capability {
        match self {
            Role::Agent | Role::Environment => Capability {
                operation: "create_task",
                signature: "create_task(job) -> task",
            },
            Role::Workflow => Capability {
                operation: "create_workflow",
                signature: "create_workflow(job) -> workflow",
            },
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            // Scaffolds are agents under their older name.
            "agent" | "scaffold" => Ok(Role::Agent),
            "environment" => Ok(Role::Environment),
            "workflow" => Ok(Role::Workflow),
            other => Err(format!(
                "unknown role '{other}' (expected agent, environment, or workflow)"
            )),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

/// A role's required operation and its declared signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    operation: &'static str,
    signature: &'static str,
}

impl Capability {
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn signature(&self) -> &'static str {
        self.signature
    }

    /// Whether any of the declared signatures matches, ignoring whitespace.
    pub fn is_provided_by(&self, provides: &[String]) -> bool {
        let wanted = squash(self.signature);
        provides.iter().any(|p| squash(p) == wanted)
    }
}

fn squash(signature: &str) -> String {
    signature.chars().filter(|c| !c.is_whitespace()).collect()
}

/// A unit of work handed to a component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Job {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Description of the task (or workflow) a component produced for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub job: Job,
    pub role: Role,
    /// The capability operation that produced this spec.
    pub operation: String,
    pub component_type: String,
    pub implementation: String,
    pub params: BTreeMap<String, Value>,
    /// Template sources, unrendered.
    pub templates: BTreeMap<String, String>,
}

/// Arguments passed to a factory when an instance is constructed.
///
/// Two loads with equal arguments share one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstructorArgs(BTreeMap<String, Value>);

impl ConstructorArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// SHA-256 over the canonical JSON form (keys sorted at every level).
    pub fn fingerprint(&self) -> ContentHash {
        let canonical = Value::Object(self.0.clone().into_iter().collect()).to_string();
        ContentHash::compute(canonical.as_bytes())
    }
}

/// An instantiated implementation.
pub trait Component: fmt::Debug + Send + Sync {
    fn role(&self) -> Role;

    /// The declared type name from the module's configuration.
    fn type_name(&self) -> &str;

    /// Name of the implementation declaration this instance was built from.
    fn implementation(&self) -> &str;

    /// Run the role's capability operation for `job`.
    fn invoke(&self, job: &Job) -> Result<TaskSpec>;
}

/// Error type returned by factories; mapped to a construction error by the hub.
pub type FactoryError = Box<dyn std::error::Error + Send + Sync>;

/// Everything a factory may use to build an instance.
#[derive(Debug, Clone, Copy)]
pub struct FactoryContext<'a> {
    pub module: &'a LoadedModule,
    pub implementation: &'a ImplementationDecl,
    pub args: &'a ConstructorArgs,
}

/// Builds component instances for implementations that name it.
pub trait ComponentFactory: Send + Sync {
    fn create(&self, ctx: &FactoryContext<'_>)
        -> std::result::Result<Arc<dyn Component>, FactoryError>;
}

impl<F> ComponentFactory for F
where
    F: Fn(&FactoryContext<'_>) -> std::result::Result<Arc<dyn Component>, FactoryError>
        + Send
        + Sync,
{
    fn create(
        &self,
        ctx: &FactoryContext<'_>,
    ) -> std::result::Result<Arc<dyn Component>, FactoryError> {
        self(ctx)
    }
}

/// Named factories available to a hub.
#[derive(Clone)]
pub struct FactoryCatalog {
    factories: BTreeMap<String, Arc<dyn ComponentFactory>>,
}

impl FactoryCatalog {
    /// A catalog holding only the declarative factory.
    pub fn new() -> Self {
        let declarative: Arc<dyn ComponentFactory> = Arc::new(DeclarativeFactory);
        let mut factories = BTreeMap::new();
        factories.insert(DECLARATIVE_FACTORY.to_string(), declarative);
        FactoryCatalog { factories }
    }

    /// Register (or replace) a factory under `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl ComponentFactory + 'static,
    ) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ComponentFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl Default for FactoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FactoryCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

struct DeclarativeFactory;

impl ComponentFactory for DeclarativeFactory {
    fn create(
        &self,
        ctx: &FactoryContext<'_>,
    ) -> std::result::Result<Arc<dyn Component>, FactoryError> {
        Ok(Arc::new(DeclarativeComponent::from_context(ctx)))
    }
}

/// A component defined entirely by its module's declared configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclarativeComponent {
    role: Role,
    type_name: String,
    implementation: String,
    params: BTreeMap<String, Value>,
    templates: BTreeMap<String, String>,
}

impl DeclarativeComponent {
    /// Merge parameters: module config, then implementation params, then constructor args.
    pub fn from_context(ctx: &FactoryContext<'_>) -> Self {
        let mut params = ctx.module.config.params.clone();
        params.extend(ctx.implementation.params.clone());
        params.extend(ctx.args.iter().map(|(k, v)| (k.clone(), v.clone())));
        DeclarativeComponent {
            role: ctx.module.config.role,
            type_name: ctx.module.config.type_name.clone(),
            implementation: ctx.implementation.name.clone(),
            params,
            templates: ctx.module.templates.clone(),
        }
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }
}

impl Component for DeclarativeComponent {
    fn role(&self) -> Role {
        self.role
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn implementation(&self) -> &str {
        &self.implementation
    }

    fn invoke(&self, job: &Job) -> Result<TaskSpec> {
        Ok(TaskSpec {
            job: job.clone(),
            role: self.role,
            operation: self.role.capability().operation().to_string(),
            component_type: self.type_name.clone(),
            implementation: self.implementation.clone(),
            params: self.params.clone(),
            templates: self.templates.clone(),
        })
    }
}
