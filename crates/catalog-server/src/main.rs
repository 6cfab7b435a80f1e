use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};

use catalog_server::config::loader::load_config;
use catalog_server::{
    AppConfig, BootstrapError, CatalogServer, connect_shared_cache, flush_shared_cache,
};

#[derive(Debug, Parser)]
#[command(name = "catalog-server", version, about = "Product catalog with read-through caching")]
struct Cli {
    /// Configuration file (TOML). Defaults to ./catalog.toml when present.
    #[arg(long, short, env = "CATALOG_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Check that the shared Redis cache answers a health round-trip
    Health,
    /// Drop every entry from the shared Redis cache
    Flush,
}

#[tokio::main]
async fn main() -> ExitCode {
    // .env is optional
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    catalog_server::observability::init_tracing();

    let cli = Cli::parse();
    let cfg = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(2);
        }
    };
    catalog_server::observability::apply_logging_level(&cfg.logging.level);
    tracing::info!(
        path = cli.config.as_deref().unwrap_or(catalog_server::config::loader::DEFAULT_CONFIG_FILE),
        "Configuration loaded"
    );

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&cfg).await,
        Command::Health => health(&cfg).await,
        Command::Flush => flush(&cfg).await,
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn serve(cfg: &AppConfig) -> anyhow::Result<ExitCode> {
    catalog_server::metrics::init_metrics();
    let server = CatalogServer::from_config(cfg)
        .await
        .context("cache backend bootstrap failed")?;
    server.run().await?;
    Ok(ExitCode::SUCCESS)
}

async fn health(cfg: &AppConfig) -> anyhow::Result<ExitCode> {
    match connect_shared_cache(&cfg.redis, &cfg.cache).await {
        Ok(_) => {
            println!("cache: redis healthy ({})", cfg.redis.url);
            Ok(ExitCode::SUCCESS)
        }
        Err(BootstrapError::Disabled) => {
            println!("cache: redis disabled, nothing to check");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("cache: redis unhealthy: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn flush(cfg: &AppConfig) -> anyhow::Result<ExitCode> {
    flush_shared_cache(&cfg.redis, &cfg.cache)
        .await
        .context("cache flush failed")?;
    println!("cache: redis flushed ({})", cfg.redis.url);
    Ok(ExitCode::SUCCESS)
}
