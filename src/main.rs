use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use memorm::prelude::*;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "memorm")]
#[command(about = "Runs a small workload against the in-memory persistence handler")]
struct Cli {
    /// JSON persistence configuration; missing keys take their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of customers to persist
    #[arg(long, default_value_t = 3)]
    customers: usize,

    #[arg(long, value_enum, default_value_t = Mode::Datastore)]
    mode: Mode,

    /// Print the effective configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Datastore,
    Optimistic,
}

#[derive(Debug, Default, Clone, Persistable)]
#[persistable(class = "Customer", identity = "native", version = "number", detachable)]
struct Customer {
    #[persistable(primary_key)]
    id: i64,
    name: String,
    #[persistable(lazy)]
    notes: Option<String>,
    #[persistable(state)]
    state: StateSlot,
}

fn load_config(cli: &Cli) -> Result<PersistenceConfig> {
    let config = match &cli.config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            PersistenceConfig::from_json(&json).map_err(anyhow::Error::msg)?
        }
        None => PersistenceConfig::default(),
    };
    Ok(config.optimistic(cli.mode == Mode::Optimistic))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    if cli.show_config {
        println!("{}", config.to_json().map_err(anyhow::Error::msg)?);
        return Ok(());
    }

    let handler = Arc::new(MemoryPersistenceHandler::new());
    let unit = PersistenceUnit::new(config, handler.clone(), EnhancementRegistry::init())?;
    unit.register::<Customer>()?;

    let mut ctx = unit.open_context()?;
    ctx.begin()?;
    let mut ids = Vec::new();
    for n in 0..cli.customers {
        let handle = ctx.make_persistent(Customer {
            name: format!("customer-{}", n + 1),
            notes: Some("created by the demo".into()),
            ..Default::default()
        })?;
        ids.push(handle);
    }
    ctx.commit()?;
    let ids = ids
        .into_iter()
        .map(|h| ctx.object_id(h))
        .collect::<memorm::Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    println!("persisted {} customers: {:?}", ids.len(), handler.stats());
    ctx.close()?;

    let Some(first) = ids.first().cloned() else {
        return Ok(());
    };

    let mut reader = unit.open_context()?;
    handler.reset_stats();
    let handle = reader.find_object(&first, false)?;
    let name = reader.get_string_field(handle, "name")?;
    println!("read '{}' back: {:?}", name, handler.stats());

    reader.begin()?;
    let mut graph = reader.detach_copy(handle)?;
    reader.commit()?;
    graph.set_field(&first, "name", "renamed while detached")?;

    reader.begin()?;
    let attached = reader.attach_copy(&graph)?;
    reader.commit()?;
    println!(
        "attached {} at version {:?}: {:?}",
        first,
        reader.version(attached)?,
        handler.stats()
    );
    if let Some(l2) = unit.level2_cache() {
        println!("level 2 cache: {} entries, {:?}", l2.len(), l2.stats());
    }
    reader.close()?;
    Ok(())
}
