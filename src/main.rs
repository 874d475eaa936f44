use std::{path::Path, sync::Arc};

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod lock;
mod metadata;
mod semantic;
#[cfg(test)]
mod tests;
mod web;

use app::{bootstrap::Bootstrapper, AppFactory, AppService};
use config::Config;
use lock::FileLock;

fn main() -> anyhow::Result<()> {
    // stdout carries command output, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let base_path = AppFactory::base_path(args.base_path)?;
    let config = Config::load_with(&base_path)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?
        .block_on(run(args.command, config))
}

async fn run(command: cli::Command, config: Config) -> anyhow::Result<()> {
    match command {
        cli::Command::Serve { addr, no_bootstrap } => {
            let _lock = acquire_lock(config.base_path())?;
            let service = open_ready(&config).await?;

            if config.bootstrap.enabled && !no_bootstrap {
                let outcome = service
                    .bootstrap(Bootstrapper::sources_from_config(&config))
                    .await
                    .context("bootstrap failed")?;
                if outcome.ran {
                    log::info!("bootstrapped: {:?}", outcome.written);
                }
            }

            let addr = addr.unwrap_or_else(|| config.server.addr.clone());
            let state = web::SharedState::new(Arc::new(service), Arc::new(config));
            web::serve(state, &addr).await
        }

        cli::Command::Bootstrap {} => {
            let _lock = acquire_lock(config.base_path())?;
            let service = open_ready(&config).await?;

            let outcome = service
                .bootstrap(Bootstrapper::sources_from_config(&config))
                .await
                .context("bootstrap failed")?;
            print_json(&outcome)
        }

        cli::Command::Search {
            collection,
            text,
            top_n,
        } => {
            let service = open_read_only(&config)?;
            let result = match top_n {
                Some(top_n) => service.search_top(&collection, &text, top_n).await?,
                None => service.search(&collection, &text).await?,
            };
            print_json(&result)
        }

        cli::Command::Add { collection, fields } => {
            let _lock = acquire_lock(config.base_path())?;
            let service = open(&config)?;

            let position = service.add(&collection, fields.into_iter().collect()).await?;
            print_json(&serde_json::json!({ "position": position }))
        }

        cli::Command::Reconcile { collection } => {
            let _lock = acquire_lock(config.base_path())?;
            let service = open(&config)?;

            let report = service.reconcile(&collection).await?;
            print_json(&report)
        }

        cli::Command::Status {} => {
            let service = open_read_only(&config)?;
            print_json(&service.status())
        }
    }
}

fn acquire_lock(base_path: &Path) -> anyhow::Result<FileLock> {
    FileLock::try_acquire(base_path)
        .with_context(|| format!("failed to lock {}", base_path.display()))
}

fn open(config: &Config) -> anyhow::Result<AppService> {
    let embedder = AppFactory::create_embedder(config)?;
    AppFactory::create_app_service(config, embedder)
}

/// For commands that run without the lock: never creates files.
fn open_read_only(config: &Config) -> anyhow::Result<AppService> {
    let embedder = AppFactory::create_embedder(config)?;
    AppFactory::create_read_only_service(config, embedder)
}

/// Wait for the embedder before opening collections.
async fn open_ready(config: &Config) -> anyhow::Result<AppService> {
    let embedder = AppFactory::create_embedder(config)?;

    let emb = &config.embedder;
    embedder
        .wait_ready(
            std::time::Duration::from_secs(emb.healthcheck_timeout_secs),
            std::time::Duration::from_secs(emb.healthcheck_sleep_secs),
            emb.healthcheck_max_attempts,
        )
        .await
        .context("embedder is not reachable")?;

    AppFactory::create_app_service(config, embedder)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
