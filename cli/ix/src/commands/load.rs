//! `ix load`: instantiate a component and run it on one job.

use anyhow::{anyhow, Context, Result};
use ix_hub::{Hub, Job, Role, TaskSpec};

use super::{parse_key_value, SourceArgs};

/// Flags specific to `ix load`.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub args: Vec<String>,
    pub role: Option<String>,
    pub job: String,
    pub params: Vec<String>,
}

pub fn run(hub: &Hub, source: &SourceArgs, options: &LoadOptions) -> Result<()> {
    let spec = produce(hub, source, options)?;
    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}

pub fn produce(hub: &Hub, source: &SourceArgs, options: &LoadOptions) -> Result<TaskSpec> {
    let mut request = source.request();
    for raw in &options.args {
        let (key, value) = parse_key_value(raw).context("parsing --arg")?;
        request = request.arg(key, value);
    }
    if let Some(role) = &options.role {
        let role: Role = role.parse().map_err(|e: String| anyhow!(e))?;
        request = request.expect_role(role);
    }

    let mut job = Job::new(&options.job);
    for raw in &options.params {
        let (key, value) = parse_key_value(raw).context("parsing --param")?;
        job = job.with_param(key, value);
    }

    let component = hub
        .resolve_and_load(&request)
        .with_context(|| format!("loading {}", source.reference))?;
    component
        .invoke(&job)
        .with_context(|| format!("{} on job '{}'", component.implementation(), job.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ix_hub::HubConfig;
    use serde_json::json;

    fn source(reference: &str) -> SourceArgs {
        SourceArgs {
            reference: reference.into(),
            revision: None,
            username: None,
            token: None,
            force_reload: false,
        }
    }

    #[test]
    fn builtin_agent_produces_a_task() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(HubConfig::new(dir.path())).unwrap();
        let options = LoadOptions {
            args: vec!["max_iterations=5".into()],
            role: Some("agent".into()),
            job: "fix-bug".into(),
            params: vec!["instance_id=astropy-123".into()],
        };
        let spec = produce(&hub, &source("swe-agent"), &options).unwrap();
        assert_eq!(spec.operation, "create_task");
        assert_eq!(spec.implementation, "SWEAgent");
        assert_eq!(spec.params["max_iterations"], json!(5));
        assert_eq!(spec.job.params["instance_id"], json!("astropy-123"));
    }

    #[test]
    fn wrong_role_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(HubConfig::new(dir.path())).unwrap();
        let options = LoadOptions {
            role: Some("environment".into()),
            job: "j".into(),
            ..LoadOptions::default()
        };
        let err = produce(&hub, &source("rollout_and_verify"), &options).unwrap_err();
        assert!(format!("{err:#}").contains("expected environment"));
    }

    #[test]
    fn unknown_role_is_rejected_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(HubConfig::new(dir.path())).unwrap();
        let options = LoadOptions {
            role: Some("planner".into()),
            job: "j".into(),
            ..LoadOptions::default()
        };
        let err = produce(&hub, &source("swe_agent"), &options).unwrap_err();
        assert!(err.to_string().contains("unknown role"));
        assert!(hub.registry().is_empty());
    }
}
