pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;

use axum::{
    routing::{get, post},
    Router,
};
use mongodb::{options::ClientOptions, Client};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use config::Config;
use services::metrics::init_metrics;
use services::{
    ChargeOrchestrator, LedgerStore, MongoLedgerStore, Notifier, PaymentGateway, PaypalClient,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub orchestrator: ChargeOrchestrator,
}

pub struct Application {
    port: u16,
    listener: tokio::net::TcpListener,
    router: Router,
}

impl Application {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let mut client_options = ClientOptions::parse(config.database.url.expose_secret()).await?;
        client_options.app_name = Some(config.service_name.clone());

        let client = Client::with_options(client_options)?;
        let db = client.database(&config.database.db_name);

        let store: Arc<dyn LedgerStore> = Arc::new(MongoLedgerStore::new(&db));
        let gateway: Arc<dyn PaymentGateway> = Arc::new(PaypalClient::new(config.gateway.clone()));

        Self::with_backends(config, store, gateway).await
    }

    /// Build the application on injected backends. Used by tests to run the
    /// full HTTP stack against in-memory storage and a scripted gateway.
    pub async fn with_backends(
        config: Config,
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> anyhow::Result<Self> {
        init_metrics();

        let notifier = Notifier::new(&config.notifications);
        let orchestrator = ChargeOrchestrator::new(store, gateway, notifier);

        let state = AppState {
            config: config.clone(),
            orchestrator,
        };

        let router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics))
            .route("/checkout", post(handlers::charges::checkout))
            .route("/charge", post(handlers::charges::charge))
            .route("/link-pay", post(handlers::charges::link_pay))
            .route(
                "/ledger/:reservation_id",
                get(handlers::charges::get_ledger),
            )
            .route(
                "/ledger/:reservation_id/limit",
                post(handlers::charges::revise_limit),
            )
            .route(
                "/ledger/:reservation_id/payment-method",
                post(handlers::charges::attach_payment_method),
            )
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-");

                    tracing::info_span!(
                        "http_request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                }),
            )
            .with_state(state);

        // Bind here so tests asking for port 0 can learn the real port.
        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            port,
            listener,
            router,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        tracing::info!("Listening on port {}", self.port);
        axum::serve(self.listener, self.router).await?;
        Ok(())
    }
}
