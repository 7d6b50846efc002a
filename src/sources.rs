//! CLI listing of knowledge groups and their run state.

use anyhow::Result;

use crate::config::Config;
use crate::store::MetaStore;

pub async fn list_groups(config: &Config, store: &dyn MetaStore) -> Result<()> {
    if config.groups.is_empty() {
        println!("No knowledge groups configured. Add a [groups.<name>] section to the config.");
        return Ok(());
    }

    println!(
        "{:<20} {:<14} {:<12} {:<10} NEXT UPDATE",
        "GROUP", "KIND", "STATUS", "ITEMS"
    );

    for (name, group) in &config.groups {
        let run = store.group_run(name).await?;
        let items = store.list_items(name).await?;

        let next_update = run
            .next_update_at
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<20} {:<14} {:<12} {:<10} {}",
            name,
            group.kind,
            run.status.as_str(),
            items.len(),
            next_update
        );

        if let Some(error) = &run.fetch_error {
            println!("    last error: {}", error);
        }
    }

    Ok(())
}

pub async fn list_items(store: &dyn MetaStore, group_name: &str) -> Result<()> {
    let items = store.list_items(group_name).await?;

    if items.is_empty() {
        println!("No items for group '{}'.", group_name);
        return Ok(());
    }

    for item in items {
        println!(
            "[{}] {} ({} chunks)",
            item.status.as_str(),
            item.key,
            item.chunk_ids.len()
        );
        if let Some(title) = &item.title {
            println!("    title: {}", title);
        }
        if let Some(error) = &item.error {
            println!("    error: {}", error);
        }
    }

    Ok(())
}
