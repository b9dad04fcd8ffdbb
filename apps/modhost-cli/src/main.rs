use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use modhost::{ExportTable, ManifestFormat, ModuleHost, ModuleLoader};
use modhost_bootstrap::{AppConfig, CliArgs};
use serde_json::json;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// ModHost - hot-reloadable module host
#[derive(Parser)]
#[command(name = "modhost")]
#[command(about = "ModHost - load, inspect and hot-reload script modules")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Core module override (relative paths are anchored at home_dir)
    #[arg(long)]
    core: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and exit
    Check,
    /// Load a module on its own and print what it exports
    Inspect {
        /// Module file to inspect
        module: PathBuf,
    },
    /// Load the core, then load and unload a client repeatedly
    Cycle {
        /// Client module file
        #[arg(long)]
        client: PathBuf,
        /// Number of load/unload rounds
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        core_module: cli.core.clone(),
        verbose: cli.verbose,
    };

    // 1) defaults -> 2) YAML (if provided) -> 3) env (MODHOST__*) -> 4) CLI overrides
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.clone().unwrap_or_default();
    modhost_bootstrap::init_logging(&logging_config, &config.home_dir());

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Check) {
        Commands::Check => check_config(&config),
        Commands::Inspect { module } => inspect(&module),
        Commands::Cycle { client, count } => cycle(config, &client, count),
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    tracing::info!("Checking configuration…");
    if !config.host.core_module.is_file() {
        tracing::warn!(
            core_module = %config.host.core_module.display(),
            "core module file does not exist yet"
        );
    }
    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let loader = ModuleLoader::new(Arc::new(ManifestFormat));
    let module = loader
        .load(path)
        .with_context(|| format!("Failed to load '{}'", path.display()))?;

    let types: Vec<_> = module
        .exported_types()
        .iter()
        .map(|ty| {
            let d = ty.descriptor();
            let serializable: Vec<&str> = d.serializable_fields().collect();
            let fields: Vec<&str> = d.fields.iter().map(|f| f.name.as_str()).collect();
            json!({
                "name": d.name,
                "kind": d.kind,
                "unique_id": d.unique_id,
                "fields": fields,
                "serializable_fields": serializable,
            })
        })
        .collect();

    let references = module
        .primary()
        .map(|image| image.image().references().to_vec())
        .unwrap_or_default();

    let report = json!({
        "name": module.name(),
        "module_id": module.id().to_string(),
        "references": references,
        "images": module.loaded_images(),
        "types": types,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    let ticket = loader.unload(module);
    tracing::debug!(reclaimed = ticket.is_reclaimed(), "inspected module released");
    Ok(())
}

fn cycle(config: AppConfig, client: &Path, count: u32) -> Result<()> {
    let mut host = ModuleHost::new(config.host);
    host.initialize(Arc::new(ExportTable::new()))?;
    host.load_core()?;

    for round in 1..=count {
        host.load_client(client)?;

        let classes = host.instantiable_classes().unwrap_or_default();
        let handles: Vec<_> = classes
            .entities
            .iter()
            .zip(0u32..)
            .filter_map(|((name, _), entity)| host.instantiate_client_entity(name, entity, 0))
            .collect();
        tracing::info!(
            round,
            entities = classes.entities.len(),
            components = classes.components.len(),
            instantiated = handles.len(),
            "client loaded"
        );
        for handle in handles {
            host.destroy_object(handle);
        }

        let started = Instant::now();
        host.unload_client()?;
        println!(
            "round {round}: {} entities instantiated, client unloaded in {} ms",
            classes.entities.len(),
            started.elapsed().as_millis()
        );
    }

    host.unload_core()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cycle_runs_against_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let core = dir.path().join("CoreScripts.yaml");
        let client = dir.path().join("Game.Client.yaml");
        std::fs::write(&core, "name: CoreScripts\n").unwrap();
        std::fs::write(
            &client,
            "name: Game.Client\nreferences: [CoreScripts]\ntypes:\n  - { name: Game.Player, kind: entity, unique_id: 3 }\n",
        )
        .unwrap();

        let mut config = AppConfig::default();
        config.host.core_module = core;
        config.host.unload_timeout_ms = 1000;
        cycle(config, &client, 3).unwrap();
    }

    #[test]
    fn inspect_reports_missing_files() {
        let err = inspect(Path::new("/no/such/module.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to load"));
    }
}
