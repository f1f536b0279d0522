use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bgplb::cli::{format_dry_run, Args};
use bgplb::config::{load_config_file, ManagerConfig};
use bgplb::manager::spawn_workers;
use bgplb::server::{create_router, AppState};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
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

    // Load and validate configuration. Only an explicit path must exist.
    let config_path = args.config_path();
    let mut config = if args.config.is_none() && !config_path.exists() {
        info!(
            "No config file at {}, starting without peers",
            config_path.display()
        );
        ManagerConfig::default()
    } else {
        match load_config_file(&config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(
                    "Failed to load config file {}: {}",
                    config_path.display(),
                    e
                );
                process::exit(1);
            }
        }
    };
    args.apply_overrides(&mut config);

    // Dry-run mode: print the effective configuration and exit
    if args.dry_run {
        println!("{}", format_dry_run(&config, &args));
        return;
    }

    let state = match AppState::new(&config) {
        Ok(state) => state,
        Err(e) => {
            error!("Invalid peer configuration: {}", e);
            process::exit(1);
        }
    };

    let addr = args.listen_addr();
    info!("Starting bgplb on {}", addr);
    info!("Loaded {} BGP peers", state.sessions.len());

    let pool = spawn_workers(Arc::clone(&state.manager), config.workers);
    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET    /health                                   - Health check");
    info!("  GET    /v1/status                                - Reconciler status");
    info!("  GET    /v1/peers                                 - BGP peer sessions");
    info!("  PUT    /v1/peers/{{address}}/state                 - Report session state");
    info!("  PUT    /v1/services                              - Add or update a service");
    info!("  DELETE /v1/namespaces/{{ns}}/services/{{name}}       - Delete a service");
    info!("  PUT    /v1/namespaces/{{ns}}/services/{{name}}/endpoints - Set endpoints");
    info!("  GET    /v1/routes                                - Announced routes");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await;

    pool.shutdown().await;

    if let Err(e) = served {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
