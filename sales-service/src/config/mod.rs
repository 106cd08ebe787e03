//! Configuration module for sales-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct SalesConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub identity_service: ServiceEndpoint,
    pub catalog_service: ServiceEndpoint,
    pub logistics_service: ServiceEndpoint,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// gRPC endpoint of a collaborating service.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Empty disables capability enforcement (BFF trust model).
    pub auth_service_endpoint: String,
}

impl SalesConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "sales-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            identity_service: endpoint("IDENTITY_SERVICE_URL", "http://identity-service:3001"),
            catalog_service: endpoint("CATALOG_SERVICE_URL", "http://catalog-service:3001"),
            logistics_service: endpoint("LOGISTICS_SERVICE_URL", "http://logistics-service:3001"),
            auth: AuthConfig {
                auth_service_endpoint: env::var("AUTH_SERVICE_ENDPOINT").unwrap_or_default(),
            },
        })
    }
}

fn endpoint(var: &str, default: &str) -> ServiceEndpoint {
    ServiceEndpoint {
        url: env::var(var).unwrap_or_else(|_| default.to_string()),
    }
}
