//! `comfybatch` -- run batches of images and prompts through ComfyUI.
//!
//! # Environment variables
//!
//! | Variable                     | Description                              |
//! |------------------------------|------------------------------------------|
//! | `RUST_LOG`                   | Log filter; overrides `application.log_level` |
//! | `COMFYBATCH__COMFYUI__URL`   | Any settings key, as `COMFYBATCH__<SECTION>__<KEY>` |
//!
//! A `.env` file in the working directory is loaded first.

mod args;
mod commands;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use comfybatch_pipeline::settings::Settings;

use args::{Cli, Command};

/// Crates whose logs the configured level applies to.
const LOG_TARGETS: &[&str] = &[
    "comfybatch",
    "comfybatch_core",
    "comfybatch_comfyui",
    "comfybatch_pipeline",
];

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    init_tracing(&settings.log_level, cli.json_logs);

    match cli.command {
        Command::Run(args) => commands::run::execute(&settings, args).await,
        Command::Inspect(args) => commands::inspect::execute(args).map(|()| ExitCode::SUCCESS),
        Command::Status => commands::status::execute(&settings).await,
    }
}

fn init_tracing(level: &str, json: bool) {
    let default_filter = LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let (plain, json) = if json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr)), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .init();
}
