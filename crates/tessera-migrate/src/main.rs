//! Tessera migrate binary: brings the database schema up to date and exits.
//!
//! Usage: `tessera-migrate [config-path]`. The config path falls back to
//! `TESSERA_CONFIG_PATH`, then `tessera.toml`.

use std::process::ExitCode;

use tessera_migrate::config;
use tessera_migrate::startup::{self, Started};

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("TESSERA_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn main() -> ExitCode {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("tessera.toml"));

    let config = match config::load_config(selected_config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    startup::init_tracing(&config.logging);

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        environment = %config.environment,
        "resolved startup configuration path"
    );
    tracing::debug!(database = ?config.database, "database configuration");

    match startup::run(&config) {
        Ok(Started::Ready {
            transactions,
            report,
            ..
        }) => {
            tracing::info!(
                applied = report.applied.len(),
                skipped = report.skipped.len(),
                isolation = %transactions.default_isolation(),
                "tessera ready"
            );
            ExitCode::SUCCESS
        }
        Ok(Started::Canned(_)) => {
            tracing::warn!("tessera ready without database validation");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "startup failed");
            ExitCode::FAILURE
        }
    }
}
