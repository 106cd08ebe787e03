//! gRPC utilities for micros microservices.
//!
//! This module provides shared gRPC infrastructure including:
//! - Error conversion between `AppError` and `tonic::Status`
//! - Interceptors for trace context and caller metadata propagation
//! - Server builder and reflection helpers
//! - Retry utilities for service-to-service calls
//! - Capability checking (BFF trust model or identity-service enforcement)
//! - Identity, catalog and logistics clients

pub mod capability_checker;
pub mod catalog_client;
pub mod error;
pub mod identity_client;
pub mod interceptors;
pub mod logistics_client;
pub mod retry;
pub mod server;

// Generated proto code for collaborator services
pub mod proto {
    pub mod identity {
        tonic::include_proto!("micros.identity.v1");
    }
    pub mod catalog {
        tonic::include_proto!("micros.catalog.v1");
    }
    pub mod logistics {
        tonic::include_proto!("micros.logistics.v1");
    }
}

pub use capability_checker::{AuthContext, CapabilityChecker};
pub use catalog_client::{CatalogClient, CatalogClientConfig};
pub use error::{GrpcResult, IntoStatus};
pub use identity_client::{IdentityClient, IdentityClientConfig};
pub use interceptors::{
    CallerMetadata, TENANT_ID_KEY, USER_ID_KEY, extract_authorization, extract_request_id,
    extract_traceparent, inject_caller_metadata, inject_trace_context, trace_context_interceptor,
};
pub use logistics_client::{LogisticsClient, LogisticsClientConfig};
pub use retry::{RetryConfig, is_retryable, retry_grpc_call};
pub use server::{GrpcServerBuilder, create_reflection_service};

// Re-export commonly used tonic types
pub use tonic::{Code, Request, Response, Status};
