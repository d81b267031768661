use anyhow::Result;
use dotenvy::dotenv;
use secrecy::Secret;
use serde::Deserialize;
use std::env;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub notifications: NotificationConfig,
    pub service_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub db_name: String,
}

/// Credentials and tuning for the external payment gateway.
#[derive(Deserialize, Clone, Debug)]
pub struct GatewayConfig {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub api_base_url: String,
    /// Per-request timeout for gateway round trips, in seconds.
    pub timeout_seconds: u64,
}

/// Post-commit capture notifications (fire-and-forget webhook).
#[derive(Deserialize, Clone, Debug)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let host = env::var("CAPTURE_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("CAPTURE_SERVICE_PORT")
            .unwrap_or_else(|_| "3007".to_string())
            .parse()?;

        let db_url = env::var("CAPTURE_DATABASE_URL")
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
        let db_name =
            env::var("CAPTURE_DATABASE_NAME").unwrap_or_else(|_| "capture_db".to_string());

        let gateway_client_id = env::var("GATEWAY_CLIENT_ID").unwrap_or_default();
        let gateway_client_secret = env::var("GATEWAY_CLIENT_SECRET").unwrap_or_default();
        let gateway_base_url = env::var("GATEWAY_API_BASE_URL")
            .unwrap_or_else(|_| "https://api-m.paypal.com".to_string());
        let gateway_timeout = env::var("GATEWAY_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "12".to_string())
            .parse()?;

        let webhook_url = env::var("CAPTURE_NOTIFY_WEBHOOK_URL").ok();

        Ok(Self {
            server: ServerConfig { host, port },
            database: DatabaseConfig {
                url: Secret::new(db_url),
                db_name,
            },
            gateway: GatewayConfig {
                client_id: gateway_client_id,
                client_secret: Secret::new(gateway_client_secret),
                api_base_url: gateway_base_url,
                timeout_seconds: gateway_timeout,
            },
            notifications: NotificationConfig { webhook_url },
            service_name: "capture-service".to_string(),
        })
    }
}
