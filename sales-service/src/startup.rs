//! Application startup and lifecycle management.

use crate::config::SalesConfig;
use crate::grpc::proto::{
    customer_service_server::CustomerServiceServer, order_service_server::OrderServiceServer,
    return_service_server::ReturnServiceServer, salesman_service_server::SalesmanServiceServer,
    FILE_DESCRIPTOR_SET,
};
use crate::grpc::{
    CapabilityChecker, CustomerServiceImpl, OrderServiceImpl, ReturnServiceImpl, SalesmanServiceImpl,
};
use crate::services::ports::SalesRepository;
use crate::services::{
    get_metrics, init_metrics, AccessScopeResolver, CatalogValidator, Database, DeliveryStateGuard,
    OrderTransactionCoordinator, OutstandingLedger, ReturnAllocationEngine,
};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::grpc::{
    create_reflection_service, trace_context_interceptor, CatalogClient, GrpcServerBuilder,
    IdentityClient, LogisticsClient,
};
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: SalesConfig,
    pub db: Arc<Database>,
    pub capability_checker: Arc<CapabilityChecker>,
    pub access: AccessScopeResolver,
    pub orders: OrderTransactionCoordinator,
    pub returns: ReturnAllocationEngine,
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    db: Arc<Database>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "sales-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "sales-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

fn remote_error(service: &'static str) -> impl Fn(tonic::transport::Error) -> AppError {
    move |e| {
        tracing::error!(error = %e, service = service, "Failed to connect");
        AppError::BadGateway(format!("Failed to connect to {}: {}", service, e))
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    grpc_port: u16,
    http_listener: TcpListener,
    grpc_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: SalesConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: SalesConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: SalesConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

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

        let db = Arc::new(db);

        let auth_endpoint = Some(config.auth.auth_service_endpoint.as_str()).filter(|e| !e.is_empty());
        let capability_checker =
            Arc::new(CapabilityChecker::new(auth_endpoint).await.map_err(|e| {
                tracing::error!(error = %e, "Failed to create capability checker");
                AppError::InternalError(anyhow::anyhow!(
                    "Failed to create capability checker: {}",
                    e
                ))
            })?);

        let identity = IdentityClient::connect(&config.identity_service.url)
            .await
            .map_err(remote_error("identity-service"))?;
        let catalog = CatalogClient::connect(&config.catalog_service.url)
            .await
            .map_err(remote_error("catalog-service"))?;
        let logistics = LogisticsClient::connect(&config.logistics_service.url)
            .await
            .map_err(remote_error("logistics-service"))?;
        tracing::info!(
            identity_service_url = %config.identity_service.url,
            catalog_service_url = %config.catalog_service.url,
            logistics_service_url = %config.logistics_service.url,
            "Connected to collaborator services"
        );

        let repo: Arc<dyn SalesRepository> = db.clone();
        let access = AccessScopeResolver::new(Arc::new(identity));
        let delivery = DeliveryStateGuard::new(Arc::new(logistics));
        let orders = OrderTransactionCoordinator::new(
            repo.clone(),
            access.clone(),
            CatalogValidator::new(Arc::new(catalog)),
            delivery.clone(),
        );
        let returns = ReturnAllocationEngine::new(
            repo.clone(),
            orders.clone(),
            access.clone(),
            delivery,
            OutstandingLedger::new(repo),
        );

        let state = AppState {
            config: config.clone(),
            db,
            capability_checker,
            access,
            orders,
            returns,
        };

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.common.grpc_port()));
        let grpc_listener = TcpListener::bind(grpc_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %grpc_addr, "Failed to bind gRPC listener");
            AppError::from(e)
        })?;
        let grpc_port = grpc_listener.local_addr()?.port();

        tracing::info!(
            http_port = http_port,
            grpc_port = grpc_port,
            "Sales service listeners bound"
        );

        Ok(Self {
            http_port,
            grpc_port,
            http_listener,
            grpc_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get the gRPC port the server is listening on.
    pub fn grpc_port(&self) -> u16 {
        self.grpc_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let health_state = HealthState {
            db: self.state.db.clone(),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(metrics_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(health_state);

        let state = self.state;
        let order_service = OrderServiceImpl::new(
            state.db.clone(),
            state.orders.clone(),
            state.access.clone(),
            state.capability_checker.clone(),
        );
        let return_service = ReturnServiceImpl::new(
            state.db.clone(),
            state.returns.clone(),
            state.access.clone(),
            state.capability_checker.clone(),
        );
        let customer_service =
            CustomerServiceImpl::new(state.db.clone(), state.capability_checker.clone());
        let salesman_service =
            SalesmanServiceImpl::new(state.db.clone(), state.capability_checker.clone());

        let (mut health_reporter, grpc_health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<OrderServiceServer<OrderServiceImpl>>()
            .await;
        health_reporter
            .set_serving::<ReturnServiceServer<ReturnServiceImpl>>()
            .await;
        health_reporter
            .set_serving::<CustomerServiceServer<CustomerServiceImpl>>()
            .await;
        health_reporter
            .set_serving::<SalesmanServiceServer<SalesmanServiceImpl>>()
            .await;

        let reflection_service = create_reflection_service(&[FILE_DESCRIPTOR_SET]).map_err(|e| {
            std::io::Error::other(format!("Failed to build reflection service: {}", e))
        })?;

        let grpc_trace_layer = TraceLayer::new_for_grpc()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG));

        let incoming = tokio_stream::wrappers::TcpListenerStream::new(self.grpc_listener);
        let grpc_server = GrpcServerBuilder::new()
            .build_server()
            .layer(grpc_trace_layer)
            .add_service(grpc_health_service)
            .add_service(reflection_service)
            .add_service(OrderServiceServer::with_interceptor(
                order_service,
                trace_context_interceptor,
            ))
            .add_service(ReturnServiceServer::with_interceptor(
                return_service,
                trace_context_interceptor,
            ))
            .add_service(CustomerServiceServer::with_interceptor(
                customer_service,
                trace_context_interceptor,
            ))
            .add_service(SalesmanServiceServer::with_interceptor(
                salesman_service,
                trace_context_interceptor,
            ))
            .serve_with_incoming(incoming);

        tracing::info!(
            service = %state.config.service_name,
            version = %state.config.service_version,
            http_port = self.http_port,
            grpc_port = self.grpc_port,
            "Service ready to accept connections"
        );

        tokio::select! {
            result = axum::serve(self.http_listener, http_router) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "HTTP server error");
                    return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
                }
            }
            result = grpc_server => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "gRPC server error");
                    return Err(std::io::Error::other(format!("gRPC server error: {}", e)));
                }
            }
        }

        Ok(())
    }
}
