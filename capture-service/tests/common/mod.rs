use async_trait::async_trait;
use capture_service::config::{
    Config, DatabaseConfig, GatewayConfig, NotificationConfig, ServerConfig,
};
use capture_service::models::{
    Authorization, AuthorizationStatus, PaymentLedger, VaultedPaymentMethod,
};
use capture_service::services::ledger::{InMemoryLedgerStore, LedgerStore};
use capture_service::services::paypal::{
    GatewayAuthorization, GatewayCapture, GatewayError, OrderSnapshot, PaymentGateway,
};
use capture_service::Application;
use chrono::{Duration, Utc};
use secrecy::Secret;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub store: Arc<InMemoryLedgerStore>,
    pub gateway: Arc<StubGateway>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Random port
            },
            database: DatabaseConfig {
                url: Secret::new("mongodb://localhost:27017".to_string()),
                db_name: "capture_test_unused".to_string(),
            },
            gateway: GatewayConfig {
                client_id: "test-client".to_string(),
                client_secret: Secret::new("test-secret".to_string()),
                api_base_url: "http://127.0.0.1:1".to_string(),
                timeout_seconds: 2,
            },
            notifications: NotificationConfig { webhook_url: None },
            service_name: "capture-service-test".to_string(),
        };

        let store = Arc::new(InMemoryLedgerStore::new());
        let gateway = Arc::new(StubGateway::default());

        let app = Application::with_backends(config, store.clone(), gateway.clone())
            .await
            .expect("Failed to build test application");
        let port = app.port();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        TestApp {
            address: format!("http://127.0.0.1:{port}"),
            client: reqwest::Client::new(),
            store,
            gateway,
        }
    }

    /// Seed a ledger carrying a live checkout authorization.
    pub async fn seed_ledger_with_auth(&self, reservation_id: &str, limit: f64, auth_amount: f64) {
        let mut ledger = PaymentLedger::new(reservation_id, "EUR", limit);
        ledger.initial_authorization = Some(Authorization {
            id: format!("3AUTH-{reservation_id}"),
            order_id: format!("5ORDER-{reservation_id}"),
            status: AuthorizationStatus::Authorized,
            amount: auth_amount,
            currency: "EUR".to_string(),
            expires_at: Utc::now() + Duration::days(25),
            network_reference: None,
        });
        self.store
            .create(ledger)
            .await
            .expect("Failed to seed ledger");
    }

    pub async fn ledger(&self, reservation_id: &str) -> PaymentLedger {
        self.store
            .get(reservation_id)
            .await
            .expect("store error")
            .expect("ledger missing")
    }
}

pub fn completed_capture(id: &str, amount: f64) -> GatewayCapture {
    GatewayCapture {
        id: id.to_string(),
        status: capture_service::services::paypal::CaptureStatus::Completed,
        amount,
        currency: "EUR".to_string(),
        order_id: None,
        invoice_id: None,
    }
}

pub fn approved_order(id: &str, amount: f64) -> OrderSnapshot {
    OrderSnapshot {
        id: id.to_string(),
        status: capture_service::services::paypal::OrderStatus::Approved,
        amount,
        currency: "EUR".to_string(),
        captures: Vec::new(),
    }
}

pub fn authorized(id: &str, amount: f64) -> GatewayAuthorization {
    GatewayAuthorization {
        id: id.to_string(),
        order_id: None,
        status: AuthorizationStatus::Authorized,
        amount,
        currency: "EUR".to_string(),
        expires_at: Utc::now() + Duration::days(29),
        network_reference: Some("NETREF-TEST".to_string()),
    }
}

/// Scripted gateway for HTTP-level tests. Responses are consumed in the
/// order they were pushed.
#[derive(Default)]
pub struct StubGateway {
    pub orders: Mutex<HashMap<String, OrderSnapshot>>,
    pub authorize_results: Mutex<VecDeque<Result<GatewayAuthorization, GatewayError>>>,
    pub capture_auth_results: Mutex<VecDeque<Result<GatewayCapture, GatewayError>>>,
    pub capture_order_results: Mutex<VecDeque<Result<GatewayCapture, GatewayError>>>,
    pub capture_vault_results: Mutex<VecDeque<Result<GatewayCapture, GatewayError>>>,
    pub reauthorize_results: Mutex<VecDeque<Result<GatewayAuthorization, GatewayError>>>,
    pub vault_results: Mutex<VecDeque<Result<VaultedPaymentMethod, GatewayError>>>,
}

impl StubGateway {
    pub fn add_order(&self, order: OrderSnapshot) {
        self.orders.lock().unwrap().insert(order.id.clone(), order);
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, GatewayError> {
        self.orders
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or_else(|| GatewayError::Protocol(format!("no such order {order_id}")))
    }

    async fn authorize_order(
        &self,
        _order_id: &str,
        _request_id: &str,
    ) -> Result<GatewayAuthorization, GatewayError> {
        self.authorize_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::Protocol("no scripted authorize".into())))
    }

    async fn capture_order(
        &self,
        _order_id: &str,
        _invoice_id: &str,
        _request_id: &str,
    ) -> Result<GatewayCapture, GatewayError> {
        self.capture_order_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::Protocol("no scripted order capture".into())))
    }

    async fn capture_authorization(
        &self,
        _authorization_id: &str,
        _amount: f64,
        _currency: &str,
        _invoice_id: &str,
        _final_capture: bool,
        _request_id: &str,
    ) -> Result<GatewayCapture, GatewayError> {
        self.capture_auth_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::Protocol("no scripted auth capture".into())))
    }

    async fn capture_with_vault(
        &self,
        _amount: f64,
        _currency: &str,
        _vault_token_id: &str,
        _previous_capture_ref: Option<&str>,
        _invoice_id: &str,
        _request_id: &str,
    ) -> Result<GatewayCapture, GatewayError> {
        self.capture_vault_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::Protocol("no scripted MIT capture".into())))
    }

    async fn void_authorization(&self, _authorization_id: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn reauthorize(
        &self,
        _authorization_id: &str,
        _amount: f64,
        _currency: &str,
        _request_id: &str,
    ) -> Result<GatewayAuthorization, GatewayError> {
        self.reauthorize_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::Protocol("no scripted reauthorize".into())))
    }

    async fn exchange_setup_token(
        &self,
        _setup_reference: &str,
    ) -> Result<VaultedPaymentMethod, GatewayError> {
        self.vault_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::Protocol("no scripted vault exchange".into())))
    }
}
