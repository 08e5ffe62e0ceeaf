//! `ix inspect`: declared configuration and implementation discovery.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use ix_hub::{Hub, LoadedModule};

use super::SourceArgs;

pub fn run(hub: &Hub, source: &SourceArgs) -> Result<()> {
    let resolved = hub
        .resolve(&source.request())
        .with_context(|| format!("resolving {}", source.reference))?;
    let module = hub
        .load_module(&resolved)
        .with_context(|| format!("loading {}", resolved.reference))?;
    println!("{}  ({})", resolved.reference, resolved.cache_key);
    print!("{}", render(&module));
    Ok(())
}

pub fn render(module: &LoadedModule) -> String {
    let config = &module.config;
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(out, "role            {}", config.role);
    let _ = writeln!(out, "type            {}", config.type_name);
    if let Some(name) = &config.implementation {
        let _ = writeln!(out, "implementation  {name}");
    }
    let signature = config.role.capability().signature();
    let _ = writeln!(out, "capability      {signature}");

    if !config.params.is_empty() {
        let _ = writeln!(out, "params:");
        for (key, value) in &config.params {
            let _ = writeln!(out, "  {key} = {value}");
        }
    }
    if !module.templates.is_empty() {
        let _ = writeln!(out, "templates:");
        for (name, body) in &module.templates {
            let _ = writeln!(out, "  {name} ({} bytes)", body.len());
        }
    }

    let _ = writeln!(out, "implementations:");
    if module.implementations.is_empty() {
        let _ = writeln!(out, "  (none declared)");
    }
    let qualifying = module.qualifying();
    for decl in &module.implementations {
        let mark = if qualifying.iter().any(|q| q.name == decl.name) {
            "+"
        } else {
            "-"
        };
        let source = decl.source.as_deref().unwrap_or("builtin");
        let _ = writeln!(
            out,
            "  {mark} {} [{}] factory={} from {source}",
            decl.name, decl.role, decl.factory
        );
    }

    match module.select() {
        Ok(decl) => {
            let _ = writeln!(out, "selected        {}", decl.name);
        }
        Err(e) => {
            let _ = writeln!(out, "selected        (none: {e})");
        }
    }
    out
}
