//! `warrend`: the Warren multi-tenant application host.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use warren_host::{HostConfig, WarrenHost};
use warren_kernel::caching::Token;
use warren_kernel::extensions::BuiltinModules;
use warren_kernel::folder::{MODULES_DIR, SITES_DIR, THEMES_DIR};

/// Warren - multi-tenant application host.
#[derive(Parser, Debug)]
#[command(name = "warrend")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Site root directory (defaults to $WARREN_SITE_ROOT, then ".").
    #[arg(short, long, global = true)]
    site_root: Option<PathBuf>,

    /// Build tenants sequentially.
    #[arg(long, global = true)]
    no_parallel: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize every tenant and keep serving.
    Run {
        /// Rebuild automatically when the site folder changes.
        #[arg(long)]
        watch: bool,
    },
    /// Print the tenant table.
    Status,
    /// List discoverable extensions.
    Extensions,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config =
        HostConfig::resolve(args.site_root.clone()).with_parallelism(!args.no_parallel);
    tracing::info!(site_root = %config.site_root.display(), "starting warrend");

    let host = WarrenHost::new(config, Arc::new(BuiltinModules::new()))?;
    match args.command {
        Command::Run { watch } => run(host, watch),
        Command::Status => status(host),
        Command::Extensions => extensions(host),
    }
}

fn init_tracing() {
    let json_logging = std::env::var("WARREN_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warren=info"));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

fn run(host: WarrenHost, watch: bool) -> Result<()> {
    host.initialize()?;
    report(&host)?;

    if host.restart_required() {
        tracing::warn!("extension changes require a restart to take full effect");
    }
    if !watch {
        return Ok(());
    }

    tracing::info!("watching the site folder; press Ctrl-C to stop");
    let mut tokens = site_tokens(&host);
    loop {
        std::thread::sleep(Duration::from_secs(2));
        if tokens.iter().any(|token| !token.is_current()) {
            tracing::info!("site folder changed; reloading");
            host.reload()?;
            report(&host)?;
            tokens = site_tokens(&host);
        }
    }
}

/// Change tokens covering everything a reload cares about.
fn site_tokens(host: &WarrenHost) -> Vec<Token> {
    [MODULES_DIR, THEMES_DIR, SITES_DIR]
        .iter()
        .map(|dir| host.folder().when_path_changes(dir))
        .collect()
}

fn report(host: &WarrenHost) -> Result<()> {
    let tenants = host.running_tenants();
    if tenants.is_empty() {
        println!("No tenants running.");
    } else {
        println!("Running tenants:");
        for tenant in tenants {
            if let Some(context) = host.context(&tenant) {
                println!(
                    "  {tenant}  (descriptor serial {}, {} features)",
                    context.descriptor().serial_number,
                    context.descriptor().features.len(),
                );
            }
        }
    }
    Ok(())
}

fn status(host: WarrenHost) -> Result<()> {
    host.initialize()?;
    let rows = host.status()?;
    if rows.is_empty() {
        println!("No tenants configured.");
        return Ok(());
    }

    println!("{:<20} {:<14} {:<10} {:<8} RUNNING", "TENANT", "STATE", "PROVIDER", "SERIAL");
    for row in rows {
        println!(
            "{:<20} {:<14} {:<10} {:<8} {}",
            row.name,
            format!("{:?}", row.state),
            row.data_provider,
            row.serial.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            if row.running { "yes" } else { "no" },
        );
    }
    Ok(())
}

fn extensions(host: WarrenHost) -> Result<()> {
    let catalog = host.catalog();
    println!("Discovered extensions:");
    for extension in catalog {
        println!(
            "  {} {} ({})",
            extension.id, extension.version, extension.kind
        );
        for feature in &extension.features {
            if feature.dependencies.is_empty() {
                println!("    feature {}", feature.id);
            } else {
                println!(
                    "    feature {} (depends on {})",
                    feature.id,
                    feature.dependencies.join(", ")
                );
            }
        }
    }
    Ok(())
}
