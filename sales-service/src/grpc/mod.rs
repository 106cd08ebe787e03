//! gRPC module for sales-service.

pub mod capability_check;
mod customer_service;
mod order_service;
mod return_service;
mod salesman_service;

pub use capability_check::{capabilities, CapabilityChecker};
pub use customer_service::CustomerServiceImpl;
pub use order_service::OrderServiceImpl;
pub use return_service::ReturnServiceImpl;
pub use salesman_service::SalesmanServiceImpl;

use crate::models::CallerContext;
use crate::services::metrics::{record_error, GRPC_REQUESTS_TOTAL};
use futures::Stream;
use service_core::error::AppError;
use service_core::grpc::{AuthContext, IntoStatus};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use uuid::Uuid;

/// Generated protobuf code.
pub mod proto {
    tonic::include_proto!("micros.sales.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("sales_descriptor");
}

pub(crate) type ListStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// Count the outcome of an RPC and convert a failure into its status.
pub(crate) fn finish<T>(method: &str, result: Result<T, AppError>) -> Result<T, Status> {
    match result {
        Ok(value) => {
            GRPC_REQUESTS_TOTAL.with_label_values(&[method, "ok"]).inc();
            Ok(value)
        }
        Err(err) => {
            let (status, error_type) = match &err {
                AppError::ValidationError(_) | AppError::BadRequest(_) => ("invalid_argument", "validation_error"),
                AppError::NotFound(_) => ("not_found", "not_found"),
                AppError::Unauthorized(_) => ("unauthenticated", "unauthorized"),
                AppError::Forbidden(_) => ("permission_denied", "locked"),
                AppError::FailedPrecondition(_) => ("failed_precondition", "locked"),
                AppError::Conflict(_) => ("already_exists", "conflict"),
                AppError::DatabaseError(_) => ("error", "db_error"),
                AppError::BadGateway(_) | AppError::ServiceUnavailable => ("unavailable", "remote_error"),
                _ => ("error", "internal_error"),
            };
            GRPC_REQUESTS_TOTAL.with_label_values(&[method, status]).inc();
            record_error(error_type);
            Err(err.into_status())
        }
    }
}

/// Caller without branch scope, for the tenant-wide master data services.
pub(crate) fn tenant_caller(auth: &AuthContext) -> Result<CallerContext, AppError> {
    let tenant_id = Uuid::parse_str(&auth.tenant_id)
        .map_err(|_| AppError::unauthorized("Invalid tenant context"))?;
    let mut caller = CallerContext::tenant_wide(tenant_id, auth.user_id.clone());
    caller.metadata = caller.metadata.with_authorization(auth.authorization.clone());
    Ok(caller)
}

/// Optional id filter; empty means "not filtered".
pub(crate) fn optional_id(value: &str, what: &str) -> Result<Option<Uuid>, AppError> {
    if value.trim().is_empty() {
        Ok(None)
    } else {
        crate::models::parse_id(value, what).map(Some)
    }
}

/// Forward database rows to the client, pairing each with the pagination
/// summary. Stops when the client goes away.
pub(crate) fn forward_rows<T, R, F>(
    method: &'static str,
    mut rows: mpsc::Receiver<Result<T, AppError>>,
    wrap: F,
) -> ListStream<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + 'static,
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        while let Some(row) = rows.recv().await {
            let item = row.map(&wrap).map_err(|e| {
                tracing::warn!(method = method, error = %e, "List stream failed");
                record_error("db_error");
                e.into_status()
            });
            if tx.send(item).await.is_err() {
                tracing::debug!(method = method, "Client cancelled list stream");
                break;
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

pub(crate) fn pagination_response(
    pagination: Option<proto::Pagination>,
    count: i64,
) -> proto::PaginationResponse {
    proto::PaginationResponse { pagination, count }
}
