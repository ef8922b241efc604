//! Application startup and lifecycle management.

use crate::config::{DispatchConfig, StorageBackend, TrustConfig};
use crate::handlers::{health, internal, invoices, quota, reminders, verify};
use crate::middleware::internal_key_middleware;
use crate::models::{Channel, PlanCatalog};
use crate::services::delivery::{
    DeliveryRouter, MockChannel, Msg91SmsChannel, SmtpEmailChannel, WhatsAppCloudChannel,
};
use crate::services::metrics::init_metrics;
use crate::services::{
    Database, InMemoryStore, InvoiceService, MessageRenderer, QuotaGate, ReminderScheduler,
    TrustStore, VerificationEngine,
};
use crate::workers::ReminderDispatchWorker;
use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};
use secrecy::SecretString;
use service_core::error::AppError;
use service_core::middleware::client_ip::TrustedProxies;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::rate_limit::{
    ip_rate_limit_middleware, CounterStore, LocalCounterStore, RateLimiter, RedisCounterStore,
};
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Engine settings that do not depend on the storage backend.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub service_name: String,
    pub verification_secret: SecretString,
    pub public_base_url: String,
    pub catalog: PlanCatalog,
    pub quota_window: chrono::Duration,
    pub dispatch: DispatchConfig,
    pub internal_api_key: Option<SecretString>,
    pub trusted_proxies: TrustedProxies,
}

impl EngineSettings {
    pub fn new(verification_secret: SecretString) -> Self {
        Self {
            service_name: "invoice-trust-service".to_string(),
            verification_secret,
            public_base_url: "http://localhost:8080".to_string(),
            catalog: PlanCatalog::default(),
            quota_window: chrono::Duration::days(30),
            dispatch: DispatchConfig::default(),
            internal_api_key: None,
            trusted_proxies: TrustedProxies::none(),
        }
    }
}

impl From<&TrustConfig> for EngineSettings {
    fn from(config: &TrustConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            verification_secret: config.verification.secret.clone(),
            public_base_url: config.verification.public_base_url.clone(),
            catalog: PlanCatalog::default(),
            quota_window: config.quota.window(),
            dispatch: config.dispatch.clone(),
            internal_api_key: config.internal_api_key.clone(),
            trusted_proxies: config.rate_limit.trusted_proxies.clone(),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub store: Arc<dyn TrustStore>,
    pub engine: Arc<VerificationEngine>,
    pub quota: Arc<QuotaGate>,
    pub scheduler: Arc<ReminderScheduler>,
    pub invoices: Arc<InvoiceService>,
    pub dispatcher: Arc<ReminderDispatchWorker>,
    pub verify_limiter: Arc<RateLimiter>,
    pub internal_api_key: Option<SecretString>,
    pub trusted_proxies: TrustedProxies,
}

impl AppState {
    /// Wire the engine components over one store.
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn TrustStore>,
        router: Arc<DeliveryRouter>,
        verify_limiter: Arc<RateLimiter>,
    ) -> Self {
        let quota = Arc::new(QuotaGate::new(
            store.clone(),
            settings.catalog.clone(),
            settings.quota_window,
        ));
        let engine = Arc::new(VerificationEngine::new(
            store.clone(),
            settings.verification_secret,
        ));
        let dispatcher = Arc::new(ReminderDispatchWorker::new(
            store.clone(),
            router,
            MessageRenderer::new(&settings.public_base_url),
            settings.catalog,
            settings.dispatch,
        ));
        let scheduler = Arc::new(ReminderScheduler::new(
            store.clone(),
            quota.clone(),
            dispatcher.clone(),
        ));
        let invoices = Arc::new(InvoiceService::new(
            store.clone(),
            quota.clone(),
            engine.clone(),
            scheduler.clone(),
        ));

        Self {
            service_name: settings.service_name,
            store,
            engine,
            quota,
            scheduler,
            invoices,
            dispatcher,
            verify_limiter,
            internal_api_key: settings.internal_api_key,
            trusted_proxies: settings.trusted_proxies,
        }
    }
}

/// All HTTP routes with the shared middleware stack.
pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/verify/:code", get(verify::verify_invoice))
        .route_layer(middleware::from_fn_with_state(
            state.verify_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let tenant = Router::new()
        .route("/invoices", post(invoices::issue_invoice))
        .route("/invoices/:invoice_id", get(invoices::get_invoice))
        .route("/invoices/:invoice_id/status", patch(invoices::update_status))
        .route(
            "/invoices/:invoice_id/due-date",
            patch(invoices::change_due_date),
        )
        .route(
            "/invoices/:invoice_id/verifications",
            get(verify::list_verifications),
        )
        .route(
            "/invoices/:invoice_id/reminders",
            get(reminders::list_reminders).post(reminders::create_reminder),
        )
        .route(
            "/invoices/:invoice_id/reminders/default",
            post(reminders::create_default_set),
        )
        .route(
            "/invoices/:invoice_id/reminders/cancel",
            post(reminders::cancel_all),
        )
        .route(
            "/reminders/:reminder_id/cancel",
            post(reminders::cancel_reminder),
        )
        .route("/reminders/:reminder_id/send", post(reminders::send_now))
        .route("/quota", get(quota::usage))
        .route(
            "/quota/templates/:template_id",
            get(quota::can_use_template),
        )
        .route("/quota/:feature", get(quota::check_limit));

    let operator = Router::new()
        .route(
            "/internal/reminders/dispatch",
            post(internal::trigger_dispatch),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            internal_key_middleware,
        ));

    let health_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_handler));

    Router::new()
        .merge(public)
        .merge(tenant)
        .merge(operator)
        .merge(health_routes)
        .with_state(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(request_id_middleware))
}

async fn build_store(
    config: &TrustConfig,
    run_migrations: bool,
) -> Result<Arc<dyn TrustStore>, AppError> {
    match config.storage_backend {
        StorageBackend::Postgres => {
            let db = Database::new(
                &config.database.url,
                config.database.max_connections,
                config.database.min_connections,
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                e
            })?;

            if run_migrations {
                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
            }

            Ok(Arc::new(db))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; data is lost on restart");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

async fn build_counter_store(config: &TrustConfig) -> Result<Arc<dyn CounterStore>, AppError> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisCounterStore::connect(url).await.map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to Redis");
                e
            })?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("REDIS_URL not set, verification rate limits are per process");
            Ok(Arc::new(LocalCounterStore::new()))
        }
    }
}

fn build_delivery_router(config: &TrustConfig) -> Result<DeliveryRouter, AppError> {
    let mut router = DeliveryRouter::new(config.dispatch.delivery_timeout());

    if config.smtp.enabled {
        let smtp = SmtpEmailChannel::new(config.smtp.clone())
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("SMTP channel: {}", e)))?;
        router = router.with_channel(Arc::new(smtp));
    } else if config.environment.is_prod() {
        return Err(AppError::ConfigError(anyhow::anyhow!(
            "SMTP_ENABLED is required in production"
        )));
    } else {
        tracing::warn!("SMTP disabled, email reminders use the mock channel");
        router = router.with_channel(Arc::new(MockChannel::new(Channel::Email)));
    }

    if config.msg91.enabled {
        router = router.with_channel(Arc::new(Msg91SmsChannel::new(config.msg91.clone())));
    }
    if config.whatsapp.enabled {
        router = router.with_channel(Arc::new(WhatsAppCloudChannel::new(
            config.whatsapp.clone(),
        )));
    }

    Ok(router)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    dispatch_enabled: bool,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: TrustConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    pub async fn build_without_migrations(config: TrustConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: TrustConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let store = build_store(&config, run_migrations).await?;
        let counter_store = build_counter_store(&config).await?;
        let verify_limiter = Arc::new(
            RateLimiter::new(
                counter_store,
                "ratelimit:verify",
                config.rate_limit.verify_limit,
                Duration::from_secs(config.rate_limit.verify_window_seconds),
            )
            .with_trusted_proxies(config.rate_limit.trusted_proxies.clone()),
        );
        let router = Arc::new(build_delivery_router(&config)?);
        tracing::info!(channels = ?router.enabled_channels(), "Delivery channels configured");

        let state = AppState::new(EngineSettings::from(&config), store, router, verify_limiter);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::InternalError(anyhow::anyhow!("Failed to bind HTTP listener: {}", e))
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| {
                AppError::InternalError(anyhow::anyhow!("Failed to read local addr: {}", e))
            })?
            .port();

        Ok(Self {
            port,
            listener,
            state,
            dispatch_enabled: config.dispatch.enabled,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve HTTP and run the dispatch worker until `shutdown` is cancelled.
    pub async fn run_until_stopped(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), std::io::Error> {
        let worker = if self.dispatch_enabled {
            Some(self.state.dispatcher.clone().spawn(shutdown.child_token()))
        } else {
            tracing::info!("Reminder dispatch worker disabled");
            None
        };

        let app = build_router(self.state);
        tracing::info!(port = self.port, "HTTP server listening");

        let server_shutdown = shutdown.clone();
        let result = axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await;

        shutdown.cancel();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Dispatch worker task ended abnormally");
            }
        }

        result
    }
}
