//! `ix resolve`: pin a reference and show where its module lives.

use anyhow::{Context, Result};
use ix_hub::{Hub, ModuleOrigin, ResolvedModule};

use super::SourceArgs;

pub fn run(hub: &Hub, source: &SourceArgs) -> Result<()> {
    let resolved = hub
        .resolve(&source.request())
        .with_context(|| format!("resolving {}", source.reference))?;
    print!("{}", render(&resolved));
    Ok(())
}

pub fn render(resolved: &ResolvedModule) -> String {
    let resolved_as = match (&resolved.revision, resolved.origin) {
        (Some(rev), _) => format!("{} ({})", rev.commit, rev.kind),
        (None, ModuleOrigin::InPlace) => format!("{} (content hash)", resolved.resolved),
        (None, _) => resolved.resolved.clone(),
    };
    let path = resolved
        .path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(builtin, no files)".to_string());

    format!(
        "reference  {}\nkind       {}\ncache key  {}\nresolved   {}\npath       {}\n",
        resolved.reference,
        resolved.reference.kind(),
        resolved.cache_key,
        resolved_as,
        path
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ix_hub::{HubConfig, LoadRequest};
    use std::fs;

    #[test]
    fn builtin_has_no_path() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(HubConfig::new(dir.path())).unwrap();
        let resolved = hub.resolve(&LoadRequest::new("SWE-Agent")).unwrap();
        let text = render(&resolved);
        assert!(text.contains("kind       builtin"));
        assert!(text.contains("resolved   swe_agent"));
        assert!(text.contains("(builtin, no files)"));
    }

    #[test]
    fn local_module_reports_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("env");
        fs::create_dir_all(&module).unwrap();
        let config = "repo_type: environment\ntype: e\n";
        fs::write(module.join("config.yaml"), config).unwrap();

        let hub = Hub::builder(HubConfig::new(dir.path().join("cache")))
            .base_dir(dir.path())
            .build()
            .unwrap();
        let resolved = hub.resolve(&LoadRequest::new("env")).unwrap();
        let text = render(&resolved);
        assert!(text.contains("kind       local"));
        assert!(text.contains("(content hash)"));
        assert!(text.contains(&module.canonicalize().unwrap().display().to_string()));
    }
}
