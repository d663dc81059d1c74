use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use fleetplane::cli::{
    distribute, format_config_summary, format_distribution, format_plan, format_rebalance, plan,
    rebalance, serve, validate_config, Cli, Commands,
};
use fleetplane::config::load_or_default;

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Validate(args) = &cli.command {
        let config = validate_config(&args.file)?;
        print!("{}", format_config_summary(&config));
        return Ok(());
    }

    // A .env file may have provided the path after argument parsing
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os("FLEETPLANE_CONFIG").map(PathBuf::from));
    let config = load_or_default(config_path.as_deref())?;

    match &cli.command {
        Commands::Serve(args) => serve(config, args).await?,
        Commands::Distribute(args) => {
            let plan = distribute(&config, args)?;
            if args.json {
                print_json(&plan)?;
            } else {
                print!("{}", format_distribution(&plan));
            }
        }
        Commands::Rebalance(args) => {
            let outcome = rebalance(args)?;
            if args.json {
                print_json(&outcome)?;
            } else {
                print!("{}", format_rebalance(&outcome));
            }
        }
        Commands::Plan(args) => {
            let plan = plan(&config, args)?;
            if args.json {
                print_json(&plan)?;
            } else {
                print!("{}", format_plan(&plan));
            }
        }
        Commands::Validate(_) => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
