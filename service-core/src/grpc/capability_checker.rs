//! Shared capability checking for services sitting behind the BFF.
//!
//! By default services trust the upstream BFF: the caller's tenant and user are
//! taken from the `x-tenant-id` / `x-user-id` metadata. When an identity
//! endpoint is configured, bearer tokens are validated and capabilities checked
//! against the identity service before the handler runs.

use super::interceptors::{TENANT_ID_KEY, USER_ID_KEY, extract_authorization};
use super::{IdentityClient, IdentityClientConfig};
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Status};

/// Authenticated caller returned after a successful capability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub tenant_id: String,
    /// Raw `authorization` header, forwarded on outgoing calls.
    pub authorization: Option<String>,
}

/// Capability checker that delegates to the identity service when enabled.
#[derive(Clone)]
pub struct CapabilityChecker {
    identity: Option<Arc<IdentityClient>>,
}

impl CapabilityChecker {
    /// Enabled when `identity_endpoint` is a non-empty endpoint, otherwise the
    /// BFF trust model is used.
    pub async fn new(identity_endpoint: Option<&str>) -> Result<Self, tonic::transport::Error> {
        match identity_endpoint {
            Some(endpoint) if !endpoint.is_empty() => {
                let client = IdentityClient::new(IdentityClientConfig {
                    endpoint: endpoint.to_string(),
                    connect_timeout: Duration::from_secs(5),
                    request_timeout: Duration::from_secs(10),
                    ..Default::default()
                })
                .await?;

                tracing::info!(
                    identity_endpoint = endpoint,
                    "Capability enforcement enabled via identity-service"
                );

                Ok(Self {
                    identity: Some(Arc::new(client)),
                })
            }
            _ => {
                tracing::info!("Capability enforcement disabled (BFF trust model)");
                Ok(Self::disabled())
            }
        }
    }

    pub fn disabled() -> Self {
        Self { identity: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.identity.is_some()
    }

    /// Resolve the caller and require `capability`.
    ///
    /// With enforcement disabled the BFF headers are trusted as-is; a missing
    /// tenant is still rejected since every operation is tenant-scoped.
    #[allow(clippy::result_large_err)]
    pub async fn require_capability<T>(
        &self,
        request: &Request<T>,
        capability: &str,
    ) -> Result<AuthContext, Status> {
        let authorization = extract_authorization(request);

        let Some(identity) = &self.identity else {
            let context = extract_auth_context_from_headers(request);
            if context.tenant_id.is_empty() {
                return Err(Status::unauthenticated("Missing tenant context"));
            }
            return Ok(context);
        };

        let token = bearer_token(authorization.as_deref())?;
        let validated = identity
            .validate_token(&token)
            .await
            .map_err(|e| Status::internal(format!("Failed to validate token: {}", e)))?;

        if !validated.valid {
            return Err(Status::unauthenticated("Invalid or expired token"));
        }

        let claims = validated
            .claims
            .ok_or_else(|| Status::internal("Token valid but missing claims"))?;

        let allowed = identity
            .check_capability(&claims.sub, &claims.tenant_id, "", capability)
            .await
            .map_err(|e| {
                tracing::warn!(
                    user_id = %claims.sub,
                    capability = capability,
                    error = %e,
                    "Capability check failed"
                );
                Status::internal(format!("Failed to check capability: {}", e))
            })?;

        if !allowed {
            tracing::warn!(
                user_id = %claims.sub,
                capability = capability,
                "Permission denied: missing capability"
            );
            return Err(Status::permission_denied(format!(
                "Missing capability: {}",
                capability
            )));
        }

        Ok(AuthContext {
            user_id: claims.sub,
            tenant_id: claims.tenant_id,
            authorization,
        })
    }
}

#[allow(clippy::result_large_err)]
fn bearer_token(authorization: Option<&str>) -> Result<String, Status> {
    authorization
        .ok_or_else(|| Status::unauthenticated("Missing authorization header"))?
        .strip_prefix("Bearer ")
        .map(|s| s.to_string())
        .ok_or_else(|| Status::unauthenticated("Invalid Bearer token format"))
}

fn extract_auth_context_from_headers<T>(request: &Request<T>) -> AuthContext {
    let header = |key: &str| {
        request
            .metadata()
            .get(key)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };

    AuthContext {
        user_id: header(USER_ID_KEY).unwrap_or_else(|| "system".to_string()),
        tenant_id: header(TENANT_ID_KEY).unwrap_or_default(),
        authorization: extract_authorization(request),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_checker_reads_bff_headers() {
        let checker = CapabilityChecker::disabled();
        assert!(!checker.is_enabled());

        let mut request: Request<()> = Request::new(());
        request
            .metadata_mut()
            .insert("x-user-id", "user-123".parse().unwrap());
        request
            .metadata_mut()
            .insert("x-tenant-id", "tenant-456".parse().unwrap());

        let context = checker
            .require_capability(&request, "sales.order:create")
            .await
            .unwrap();
        assert_eq!(context.user_id, "user-123");
        assert_eq!(context.tenant_id, "tenant-456");
        assert!(context.authorization.is_none());
    }

    #[tokio::test]
    async fn test_disabled_checker_requires_tenant() {
        let checker = CapabilityChecker::disabled();
        let request: Request<()> = Request::new(());

        let err = checker
            .require_capability(&request, "sales.order:read")
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(Some("Bearer abc")).unwrap(), "abc");
        assert!(
            bearer_token(Some("Basic abc"))
                .unwrap_err()
                .message()
                .contains("Invalid Bearer token format")
        );
        assert!(
            bearer_token(None)
                .unwrap_err()
                .message()
                .contains("Missing authorization header")
        );
    }
}
