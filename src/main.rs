use std::path::PathBuf;

use adauth::{
    AppState, build_app,
    config::AdAuthConfig,
    observability,
    saml::generate_sp_metadata,
};
use clap::Parser;

const DEFAULT_CONFIG_PATH: &str = "adauth.toml";

#[derive(Parser, Debug)]
#[command(version, about = "SAML 2.0 service provider for AD FS")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the HTTP server (default)
    Serve,
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Print the SP metadata to register with AD FS
    SpMetadata {
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match AdAuthConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                args.config.display(),
                e
            );
            std::process::exit(1);
        }
    };

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config, &args.config).await,
        Command::CheckConfig => {
            println!("Configuration OK: {}", args.config.display());
        }
        Command::SpMetadata { output } => {
            let metadata = generate_sp_metadata(&config.federation);
            match output {
                Some(path) => {
                    if let Err(e) = std::fs::write(&path, metadata) {
                        eprintln!("Failed to write {}: {}", path.display(), e);
                        std::process::exit(1);
                    }
                    eprintln!("SP metadata written to {}", path.display());
                }
                None => println!("{metadata}"),
            }
        }
    }
}

async fn run_server(config: AdAuthConfig, config_path: &std::path::Path) {
    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Failed to initialize tracing: {e}");
        std::process::exit(1);
    }

    tracing::info!(
        config_file = %config_path.display(),
        entity_id = %config.federation.entity_id,
        "Starting AD-Auth service"
    );

    if config.federation.idp_certificate.is_none() {
        tracing::info!(
            metadata_url = %config.federation.metadata_url,
            "No pinned IdP certificate; signing keys will be loaded from federation metadata"
        );
    }

    let bind_addr = config.server.socket_addr();
    let state = match AppState::from_config(config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize authentication service");
            std::process::exit(1);
        }
    };
    let config = state.config.clone();
    let app = build_app(&config, state);

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %bind_addr, error = %e, "Failed to bind to address");
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on http://{}", bind_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }

    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
