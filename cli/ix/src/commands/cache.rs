//! `ix cache`: list, clear and prune entries.

use anyhow::{Context, Result};
use ix_hub::{CacheEntry, Hub};

pub fn list(hub: &Hub) -> Result<()> {
    let entries = hub.cached_entries().context("listing cache")?;
    if entries.is_empty() {
        println!("cache is empty ({})", hub.cache().root().display());
        return Ok(());
    }
    for entry in &entries {
        println!("{}", render_entry(entry));
    }
    Ok(())
}

pub fn render_entry(entry: &CacheEntry) -> String {
    let record = &entry.record;
    let revision = record.revision.as_deref().unwrap_or("HEAD");
    let kind = record
        .revision_kind
        .map(|k| k.to_string())
        .unwrap_or_else(|| "-".to_string());
    let commit = record.commit.get(..12).unwrap_or(record.commit.as_str());
    format!(
        "{}  {}@{revision}  {commit} ({kind})  {}",
        record.key,
        record.name,
        entry.path.display()
    )
}

pub fn clear(hub: &Hub, reference: Option<&str>, revision: Option<&str>) -> Result<()> {
    let removed = hub
        .clear_cache(reference, revision)
        .context("clearing cache")?;
    match (reference, revision) {
        (None, _) => println!("Removed {removed} cache entries"),
        (Some(r), None) => println!("Removed {removed} cache entries for {r}"),
        (Some(r), Some(rev)) => println!("Removed {removed} cache entries for {r}@{rev}"),
    }
    Ok(())
}

pub fn prune(hub: &Hub) -> Result<()> {
    let report = hub.prune_cache().context("pruning cache")?;
    println!(
        "Pruned {} unreferenced objects and {} staging directories",
        report.objects_removed, report.staging_removed
    );
    Ok(())
}

pub fn path(hub: &Hub) -> Result<()> {
    println!("{}", hub.cache().root().display());
    Ok(())
}
