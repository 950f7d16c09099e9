use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cognito_local::cognito::server::create_router;
use cognito_local::cognito::state::{CognitoService, ServiceOptions};
use cognito_local::cognito::triggers::TriggerRuntime;
use cognito_local::cognito::types::{
    CreateUserPoolClientRequest, CreateUserPoolRequest, ListUserPoolClientsRequest,
    ListUserPoolsRequest,
};

#[derive(Parser)]
#[command(
    name = "cognito-local",
    about = "Local AWS Cognito User Pools emulator"
)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
    #[arg(long, default_value = "9229")]
    port: u16,
    /// Directory holding pool documents, the signing key and the
    /// message delivery log.
    #[arg(long, default_value = ".cognito")]
    data_dir: PathBuf,
    /// Trigger binding configuration file (hook -> endpoint URL).
    #[arg(long)]
    triggers: Option<PathBuf>,
    /// Issuer base URL embedded in minted tokens.
    #[arg(long)]
    issuer: Option<String>,
    /// Create a user pool with this name at startup if none exists.
    #[arg(long)]
    create_pool: Option<String>,
    /// Create an app client with this name on the pre-created pool.
    #[arg(long)]
    create_client: Option<String>,
    /// Hand out predictable one-time codes (for scripted flows).
    #[arg(long)]
    deterministic_codes: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "cognito_local=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let issuer = args
        .issuer
        .clone()
        .unwrap_or_else(|| format!("http://localhost:{}", args.port));

    let triggers = match &args.triggers {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading trigger bindings");
            TriggerRuntime::from_config_file(path)?
        }
        None => TriggerRuntime::empty(),
    };

    let service = Arc::new(
        CognitoService::open(ServiceOptions {
            data_dir: args.data_dir.clone(),
            issuer,
            triggers,
            deterministic_codes: args.deterministic_codes,
        })
        .await?,
    );

    if let Some(pool_name) = &args.create_pool {
        bootstrap(&service, pool_name, args.create_client.as_deref()).await?;
    }

    let app = create_router(service);
    let addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "cognito-local listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Pre-create a pool (and optionally a client) so SDK consumers can point
/// at the emulator without an admin bootstrap step.
async fn bootstrap(
    service: &CognitoService,
    pool_name: &str,
    client_name: Option<&str>,
) -> anyhow::Result<()> {
    let pools = service.list_user_pools(ListUserPoolsRequest::default()).await?;
    let pool_id = match pools
        .user_pools
        .iter()
        .find(|p| p.name == pool_name)
    {
        Some(existing) => existing.id.clone(),
        None => {
            let created = service
                .create_user_pool(CreateUserPoolRequest {
                    pool_name: pool_name.to_string(),
                    policies: None,
                    mfa_configuration: None,
                    auto_verified_attributes: Vec::new(),
                    schema: Vec::new(),
                })
                .await?;
            tracing::info!(pool_id = %created.user_pool.id, "created user pool");
            created.user_pool.id
        }
    };

    if let Some(client_name) = client_name {
        let clients = service
            .list_user_pool_clients(ListUserPoolClientsRequest {
                user_pool_id: pool_id.clone(),
                max_results: None,
                next_token: None,
            })
            .await?;
        if !clients
            .user_pool_clients
            .iter()
            .any(|c| c.client_name == client_name)
        {
            let created = service
                .create_user_pool_client(CreateUserPoolClientRequest {
                    user_pool_id: pool_id,
                    client_name: client_name.to_string(),
                    generate_secret: false,
                    explicit_auth_flows: Vec::new(),
                    read_attributes: Vec::new(),
                    write_attributes: Vec::new(),
                    access_token_validity: None,
                    id_token_validity: None,
                    refresh_token_validity: None,
                })
                .await?;
            tracing::info!(client_id = %created.user_pool_client.client_id, "created app client");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
