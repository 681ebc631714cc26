use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use courier_server::auth::Authenticator;
use courier_server::chat::{watchdog::Watchdog, ChatServer};
use courier_server::config::{generate_config_template, Cli, Config};
use courier_server::routes;
use courier_server::state::AppState;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let cli = Cli::parse();

    // Handle --generate-config: print template and exit
    if cli.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    let config = Config::load(&cli)?;

    // Initialize tracing/logging
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "courier_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "courier_server=info".parse().unwrap()),
            )
            .init();
    }

    // Worker pool sized from config, defaulting to the host CPU count
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("COURIER server v{} starting", env!("CARGO_PKG_VERSION"));

    if config.server.secure.enabled {
        tracing::warn!(
            crt_path = %config.server.secure.crt_path,
            key_path = %config.server.secure.key_path,
            "TLS termination is delegated to the fronting proxy"
        );
    }
    if config.rest_api.enabled {
        tracing::warn!("restApi is served by the management sidecar, not this process");
    }

    let chat = Arc::new(ChatServer::new(&config)?);
    let auth = Arc::new(Authenticator::from_config(&config.server.auth));
    let token = chat.shutdown_token();

    if chat.settings().watchdog_enabled {
        let lifetime = chat.settings().connection_lifetime_seconds;
        tracing::info!(
            lifetime_seconds = lifetime,
            "watchdog enabled with 1 minute interval"
        );
        Watchdog::new(chat.clone(), lifetime).spawn(token.clone());
    }

    let endpoint = config.endpoint_path();
    let state = AppState {
        chat: chat.clone(),
        auth,
    };
    let app = routes::build_router(state, &endpoint);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;
    let scheme = if config.server.secure.enabled { "wss" } else { "ws" };
    tracing::info!("Listening on {}://{}{}", scheme, addr, endpoint);

    // Ctrl-C triggers the same graceful stop as stopService
    let interrupt_chat = chat.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            interrupt_chat.stop();
        }
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(token.cancelled_owned())
    .await?;

    chat.stop();
    Ok(())
}
