use std::process::ExitCode;
use std::sync::Arc;

use mrs_auth::core::auth::{
    AuthApiState, JwtService, SessionStores, TokenAuthority, UserServiceClient, auth_api_router,
};
use mrs_auth::core::config::Config;
use mrs_auth::core::store::memory::DEFAULT_SWEEP_PERIOD;
use mrs_auth::core::store::{self, MemoryRepository, RedisRepository};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (if exists)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "authentication service failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    // Log config status (without revealing secrets)
    tracing::info!(
        "Config loaded: issuer={}, redis={}, user_service={}",
        config.issuer,
        config.has_redis(),
        config.user_service_endpoint
    );

    let jwt = JwtService::from_rsa_pem(&config.private_key_pem, config.issuer.clone())?;
    tracing::info!("Signing key loaded: kid={}", jwt.key_id());

    let stores = match &config.redis_url {
        Some(url) => {
            let manager = store::redis::connect(url).await?;
            SessionStores {
                access_tokens: Arc::new(RedisRepository::new(
                    store::redis::ACCESS_TOKEN_PREFIX,
                    manager.clone(),
                )),
                refresh_tokens: Arc::new(RedisRepository::new(
                    store::redis::REFRESH_TOKEN_PREFIX,
                    manager.clone(),
                )),
                flows: Arc::new(RedisRepository::new(store::redis::FLOW_PREFIX, manager)),
            }
        }
        None => {
            tracing::warn!("REDIS_URL not set, sessions are kept in memory");
            SessionStores::build_with(|| {
                let repo = MemoryRepository::new();
                repo.spawn_sweeper(DEFAULT_SWEEP_PERIOD);
                repo
            })
        }
    };

    let users = UserServiceClient::new(&config.user_service_endpoint, config.user_service_timeout)?;
    let authority = TokenAuthority::new(jwt, Arc::new(users), stores, config.expiration);

    let app = auth_api_router(AuthApiState {
        authority: Arc::new(authority),
        request_timeout: config.request_timeout,
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!("listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
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

    tracing::info!("shutdown signal received");
}
