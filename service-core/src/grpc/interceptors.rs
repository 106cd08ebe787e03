//! gRPC interceptors and metadata helpers.
//!
//! Incoming requests carry W3C trace context plus the BFF caller headers
//! (`x-tenant-id`, `x-user-id`). Outgoing service-to-service calls forward both
//! so collaborators see the same caller and trace.

use opentelemetry::trace::TraceContextExt;
use tonic::metadata::MetadataValue;
use tonic::{Request, Status};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// gRPC metadata key for W3C traceparent header.
pub const TRACEPARENT_KEY: &str = "traceparent";

/// gRPC metadata key for W3C tracestate header.
pub const TRACESTATE_KEY: &str = "tracestate";

/// gRPC metadata key for request ID.
pub const REQUEST_ID_KEY: &str = "x-request-id";

/// gRPC metadata key for the caller's tenant.
pub const TENANT_ID_KEY: &str = "x-tenant-id";

/// gRPC metadata key for the calling user.
pub const USER_ID_KEY: &str = "x-user-id";

/// gRPC metadata key for the bearer token.
pub const AUTHORIZATION_KEY: &str = "authorization";

/// Caller identity forwarded on outgoing calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerMetadata {
    pub tenant_id: String,
    pub user_id: String,
    pub authorization: Option<String>,
}

impl CallerMetadata {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            authorization: None,
        }
    }

    pub fn with_authorization(mut self, authorization: Option<String>) -> Self {
        self.authorization = authorization;
        self
    }
}

/// Interceptor that records incoming trace context on the current span.
#[allow(clippy::result_large_err)]
pub fn trace_context_interceptor(request: Request<()>) -> Result<Request<()>, Status> {
    if let Some(traceparent) = extract_traceparent(&request) {
        tracing::debug!(traceparent = %traceparent, "Received trace context");
    }

    if let Some(request_id) = extract_request_id(&request) {
        Span::current().record("request_id", request_id.as_str());
    }

    Ok(request)
}

/// Inject current trace context into outgoing gRPC request metadata.
pub fn inject_trace_context<T>(request: &mut Request<T>) {
    let span = Span::current();
    let context = span.context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();

    if span_context.is_valid() {
        let traceparent = format!(
            "00-{}-{}-{:02x}",
            span_context.trace_id(),
            span_context.span_id(),
            span_context.trace_flags().to_u8()
        );

        if let Ok(value) = traceparent.parse() {
            request.metadata_mut().insert(TRACEPARENT_KEY, value);
        }

        let tracestate = span_context.trace_state().header();
        if !tracestate.is_empty()
            && let Ok(value) = tracestate.parse()
        {
            request.metadata_mut().insert(TRACESTATE_KEY, value);
        }
    }
}

/// Forward caller identity and trace context on an outgoing request.
pub fn inject_caller_metadata<T>(request: &mut Request<T>, caller: &CallerMetadata) {
    inject_trace_context(request);

    let metadata = request.metadata_mut();
    if let Ok(value) = MetadataValue::try_from(caller.tenant_id.as_str()) {
        metadata.insert(TENANT_ID_KEY, value);
    }
    if let Ok(value) = MetadataValue::try_from(caller.user_id.as_str()) {
        metadata.insert(USER_ID_KEY, value);
    }
    if let Some(auth) = &caller.authorization
        && let Ok(value) = MetadataValue::try_from(auth.as_str())
    {
        metadata.insert(AUTHORIZATION_KEY, value);
    }
}

fn metadata_str<T>(request: &Request<T>, key: &str) -> Option<String> {
    request
        .metadata()
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Extract trace context from incoming gRPC request metadata.
pub fn extract_traceparent<T>(request: &Request<T>) -> Option<String> {
    metadata_str(request, TRACEPARENT_KEY)
}

/// Extract request ID from incoming gRPC request metadata.
pub fn extract_request_id<T>(request: &Request<T>) -> Option<String> {
    metadata_str(request, REQUEST_ID_KEY)
}

/// Extract the raw `authorization` header so it can be forwarded.
pub fn extract_authorization<T>(request: &Request<T>) -> Option<String> {
    metadata_str(request, AUTHORIZATION_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interceptor_passes_through() {
        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert(REQUEST_ID_KEY, "req-1".parse().unwrap());
        let result = trace_context_interceptor(request);
        assert!(result.is_ok());
    }

    #[test]
    fn test_inject_caller_metadata() {
        let caller = CallerMetadata::new("tenant-1", "user-9")
            .with_authorization(Some("Bearer abc".to_string()));
        let mut request = Request::new(());
        inject_caller_metadata(&mut request, &caller);

        assert_eq!(metadata_str(&request, TENANT_ID_KEY).as_deref(), Some("tenant-1"));
        assert_eq!(metadata_str(&request, USER_ID_KEY).as_deref(), Some("user-9"));
        assert_eq!(extract_authorization(&request).as_deref(), Some("Bearer abc"));
    }

    #[test]
    fn test_missing_authorization_is_not_forwarded() {
        let caller = CallerMetadata::new("tenant-1", "user-9");
        let mut request = Request::new(());
        inject_caller_metadata(&mut request, &caller);
        assert!(extract_authorization(&request).is_none());
    }
}
