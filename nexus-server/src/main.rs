use std::sync::Arc;

use clap::Parser;
use nexus_core::{ArkClient, ArkConfig, NexusConfig, Session, SessionSettings};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use nexus_server::server;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "nexus.toml")]
    config: String,

    /// Validate config and credentials, then exit.
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience; production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config_path = shellexpand::tilde(&args.config).to_string();

    let config = match NexusConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let api_key = config.api_key();

    if args.health {
        println!("✅ Config loaded from {}", config_path);
        println!("   engine: {}", config.engine.base_url);
        println!("   vision model: {}", config.engine.vision_model);
        println!("   reasoning model: {}", config.engine.reasoning_model);
        if api_key.is_none() {
            println!("❌ {} is not set", config.engine.api_key_env);
            std::process::exit(1);
        }
        println!("✅ {} is set", config.engine.api_key_env);
        return Ok(());
    }

    let engine = match ArkClient::new(ArkConfig::from_config(&config.engine, api_key)) {
        Ok(client) => client,
        Err(e) => {
            eprintln!(
                "Failed to create reasoning engine client ({}): {}",
                config.engine.api_key_env, e
            );
            std::process::exit(1);
        }
    };
    let session = Session::new(Arc::new(engine), SessionSettings::from(&config));

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    if config.http.enabled {
        let http_session = session.clone();
        let http_config = config.clone();
        let http_shutdown = tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) =
                nexus_server::http::start_http_server(http_session, http_config, http_shutdown)
                    .await
            {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let socket_path = shellexpand::tilde(&config.service.socket_path).to_string();
    server::run_unix_server(&socket_path, session, tx.subscribe()).await?;

    Ok(())
}
