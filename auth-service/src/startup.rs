//! Application assembly and lifecycle.
//!
//! `Application::build` wires the stores, the signer, the OIDC verifier and the
//! background workers from configuration. `run_until_stopped` serves gRPC and
//! HTTP and runs the workers until the shutdown token fires.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use service_core::context::DEFAULT_REQUEST_TIMEOUT;
use service_core::error::AppError;
use service_core::grpc::{create_health_service, create_reflection_service, GrpcServerBuilder};
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::AuthConfig;
use crate::grpc::proto::auth::{auth_service_server::AuthServiceServer, FILE_DESCRIPTOR_SET};
use crate::grpc::AuthServiceImpl;
use crate::services::outbox::{EventPublisher, LogPublisher, RedisStreamPublisher};
use crate::services::{
    metrics, system_clock, AuthDeps, AuthService, AuthSettings, Clock, Database, EphemeralState,
    JwtService, LockoutEngine, MemoryAttemptCounter, MemoryEphemeralStore, MemoryStore,
    OidcVerifier, OutboxWorker, OutboxWorkerConfig, RedisService, SecretCipher,
    TokenRefreshConfig, TokenRefresher,
};
use crate::utils::CredentialHasher;
use crate::{build_router, db, AppState};

/// Background loops started next to the servers.
pub struct Workers {
    pub outbox: OutboxWorker,
    pub token_refresher: TokenRefresher,
}

pub struct Application {
    state: AppState,
    workers: Workers,
}

impl Application {
    pub async fn build(config: AuthConfig) -> Result<Self, AppError> {
        metrics::init_metrics().map_err(|e| AppError::ConfigError(e.into()))?;

        let clock = system_clock();
        let jwt = JwtService::new(&config.jwt).map_err(AppError::ConfigError)?;
        let hasher =
            CredentialHasher::new(config.security.password_hash_cost).map_err(AppError::ConfigError)?;
        let oidc = OidcVerifier::new(&config.oidc).map_err(AppError::ConfigError)?;
        let cipher = secret_cipher(&config)?;

        tracing::info!(
            key_id = %jwt.key_id(),
            providers = config.oidc.providers.len(),
            in_memory = config.in_memory_backends,
            "Core services initialized"
        );

        if config.in_memory_backends {
            return Ok(Self::in_memory(config, jwt, hasher, oidc, cipher, clock));
        }

        let pool = db::create_pool(&config.database).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            AppError::DatabaseError(e.into())
        })?;
        db::run_migrations(&pool).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            AppError::DatabaseError(e.into())
        })?;
        let database = Database::new(pool);

        let redis = RedisService::new(&config.redis.url, &config.redis.key_prefix)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to Redis");
                AppError::InternalError(e)
            })?;
        tracing::info!("Storage backends connected");

        let store = Arc::new(database.clone());
        let redis_arc = Arc::new(redis.clone());
        let deps = AuthDeps {
            users: store.clone(),
            sessions: store.clone(),
            mfa: store.clone(),
            oauth: store.clone(),
            login_attempts: store.clone(),
            outbox: store.clone(),
            ephemeral: EphemeralState::new(redis_arc.clone()),
            lockout: LockoutEngine::new(redis_arc),
            jwt,
            hasher,
            oidc: oidc.clone(),
            cipher: cipher.clone(),
            clock: clock.clone(),
        };
        let auth = Arc::new(AuthService::new(deps, AuthSettings::from_config(&config)));

        let publisher: Arc<dyn EventPublisher> = Arc::new(RedisStreamPublisher::new(
            redis.connection(),
            config.redis.event_stream.clone(),
        ));
        let workers = Workers {
            outbox: OutboxWorker::new(
                store.clone(),
                publisher,
                OutboxWorkerConfig::from(&config.outbox),
                clock.clone(),
            ),
            token_refresher: TokenRefresher::new(
                store,
                oidc,
                cipher,
                clock,
                TokenRefreshConfig::from(&config.oidc),
            ),
        };

        Ok(Self {
            state: AppState {
                config,
                auth,
                db: Some(database),
                redis: Some(redis),
            },
            workers,
        })
    }

    fn in_memory(
        config: AuthConfig,
        jwt: JwtService,
        hasher: CredentialHasher,
        oidc: OidcVerifier,
        cipher: SecretCipher,
        clock: Clock,
    ) -> Self {
        tracing::warn!("Running on in-memory backends; all state is lost on restart");

        let store = Arc::new(MemoryStore::new());
        let deps = AuthDeps {
            users: store.clone(),
            sessions: store.clone(),
            mfa: store.clone(),
            oauth: store.clone(),
            login_attempts: store.clone(),
            outbox: store.clone(),
            ephemeral: EphemeralState::new(Arc::new(MemoryEphemeralStore::new(clock.clone()))),
            lockout: LockoutEngine::new(Arc::new(MemoryAttemptCounter::new(clock.clone()))),
            jwt,
            hasher,
            oidc: oidc.clone(),
            cipher: cipher.clone(),
            clock: clock.clone(),
        };
        let auth = Arc::new(AuthService::new(deps, AuthSettings::from_config(&config)));

        let workers = Workers {
            outbox: OutboxWorker::new(
                store.clone(),
                Arc::new(LogPublisher),
                OutboxWorkerConfig::from(&config.outbox),
                clock.clone(),
            ),
            token_refresher: TokenRefresher::new(
                store,
                oidc,
                cipher,
                clock,
                TokenRefreshConfig::from(&config.oidc),
            ),
        };

        Self {
            state: AppState {
                config,
                auth,
                db: None,
                redis: None,
            },
            workers,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve gRPC and HTTP and run the workers until `shutdown` fires.
    pub async fn run_until_stopped(self, shutdown: CancellationToken) -> Result<(), AppError> {
        let Self { state, workers } = self;
        let config = state.config.clone();

        let outbox = workers.outbox.spawn(shutdown.child_token());
        let refresher = workers.token_refresher.spawn(shutdown.child_token());

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.common.grpc_port));

        let listener = tokio::net::TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let router = build_router(state.clone());
        let http_shutdown = shutdown.clone();
        let http = async move {
            service_core::axum::serve(listener, router)
                .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
                .await
                .map_err(AppError::from)
        };

        let grpc = serve_grpc(
            state.auth.clone(),
            &config.service_name,
            grpc_addr,
            shutdown.clone(),
        );

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            http_port = config.common.port,
            grpc_port = config.common.grpc_port,
            "Service ready to accept connections"
        );

        let result = tokio::try_join!(http, grpc).map(|_| ());
        if let Err(e) = &result {
            tracing::error!(error = %e, "Server stopped with an error");
        }

        // Either server failing stops everything
        shutdown.cancel();
        let _ = tokio::join!(outbox, refresher);
        result
    }
}

/// The gRPC server with health and reflection, until `shutdown` fires.
pub async fn serve_grpc(
    auth: Arc<AuthService>,
    service_name: &str,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let (_health_reporter, health_service) = create_health_service(service_name).await;
    let reflection_service = create_reflection_service(&[FILE_DESCRIPTOR_SET])
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("reflection service: {}", e)))?;

    let trace_layer = TraceLayer::new_for_grpc()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    GrpcServerBuilder::new(service_name)
        .with_request_timeout(DEFAULT_REQUEST_TIMEOUT + Duration::from_secs(5))
        .build_server()
        .layer(trace_layer)
        .add_service(health_service)
        .add_service(reflection_service)
        .add_service(AuthServiceServer::new(AuthServiceImpl::new(auth)))
        .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "gRPC server error");
            AppError::InternalError(anyhow::anyhow!("gRPC server error: {}", e))
        })
}

/// Encryption key for provider tokens and authenticator secrets.
fn secret_cipher(config: &AuthConfig) -> Result<SecretCipher, AppError> {
    match &config.security.secret_encryption_key {
        Some(key) => SecretCipher::from_base64(key).map_err(AppError::ConfigError),
        None => {
            // validate() has already rejected this in production
            tracing::warn!(
                "SECRET_ENCRYPTION_KEY not set, using a random key; stored provider tokens will not survive a restart"
            );
            Ok(SecretCipher::random())
        }
    }
}
