//! Identity service gRPC client for service-to-service communication.
//!
//! Covers the user / region / branch lookups used for branch scoping and the
//! token and capability checks used by [`CapabilityChecker`](super::CapabilityChecker).

use futures::StreamExt;
use std::time::Duration;
use tonic::Request;
use tonic::transport::{Channel, Endpoint};

use super::interceptors::{CallerMetadata, inject_caller_metadata};
use super::proto::identity::identity_service_client::IdentityServiceClient;
use super::proto::identity::{
    Branch, CheckCapabilityRequest, ListBranchesRequest, Region, User, ValidateTokenRequest,
    ValidateTokenResponse, ViewBranchRequest, ViewRegionRequest, ViewUserRequest,
};
use super::retry::{RetryConfig, retry_grpc_call};

/// Configuration for the identity service client.
#[derive(Clone, Debug)]
pub struct IdentityClientConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry_config: RetryConfig,
}

impl Default for IdentityClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://identity-service:3001".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            retry_config: RetryConfig::default(),
        }
    }
}

/// Identity service client with retry support.
#[derive(Clone)]
pub struct IdentityClient {
    client: IdentityServiceClient<Channel>,
    retry_config: RetryConfig,
}

impl IdentityClient {
    pub async fn new(config: IdentityClientConfig) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(config.endpoint)?
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .connect()
            .await?;

        Ok(Self {
            client: IdentityServiceClient::new(channel),
            retry_config: config.retry_config,
        })
    }

    pub async fn connect(endpoint: &str) -> Result<Self, tonic::transport::Error> {
        Self::new(IdentityClientConfig {
            endpoint: endpoint.to_string(),
            ..Default::default()
        })
        .await
    }

    /// Fetch the profile of a user, including its branch / region assignment.
    pub async fn view_user(
        &self,
        caller: &CallerMetadata,
        user_id: &str,
    ) -> Result<User, tonic::Status> {
        let client = self.client.clone();
        let request = ViewUserRequest {
            user_id: user_id.to_string(),
        };

        retry_grpc_call(&self.retry_config, "view_user", || {
            let mut c = client.clone();
            let mut req = Request::new(request.clone());
            inject_caller_metadata(&mut req, caller);
            async move {
                let response = c.view_user(req).await?.into_inner();
                response
                    .user
                    .ok_or_else(|| tonic::Status::not_found("User not found"))
            }
        })
        .await
    }

    /// Fetch a region with its member branches.
    pub async fn view_region(
        &self,
        caller: &CallerMetadata,
        region_id: &str,
    ) -> Result<Region, tonic::Status> {
        let client = self.client.clone();
        let request = ViewRegionRequest {
            region_id: region_id.to_string(),
        };

        retry_grpc_call(&self.retry_config, "view_region", || {
            let mut c = client.clone();
            let mut req = Request::new(request.clone());
            inject_caller_metadata(&mut req, caller);
            async move {
                let response = c.view_region(req).await?.into_inner();
                response
                    .region
                    .ok_or_else(|| tonic::Status::not_found("Region not found"))
            }
        })
        .await
    }

    pub async fn view_branch(
        &self,
        caller: &CallerMetadata,
        branch_id: &str,
    ) -> Result<Branch, tonic::Status> {
        let client = self.client.clone();
        let request = ViewBranchRequest {
            branch_id: branch_id.to_string(),
        };

        retry_grpc_call(&self.retry_config, "view_branch", || {
            let mut c = client.clone();
            let mut req = Request::new(request.clone());
            inject_caller_metadata(&mut req, caller);
            async move {
                let response = c.view_branch(req).await?.into_inner();
                response
                    .branch
                    .ok_or_else(|| tonic::Status::not_found("Branch not found"))
            }
        })
        .await
    }

    /// Drain the branch listing visible to the caller.
    pub async fn list_branches(
        &self,
        caller: &CallerMetadata,
    ) -> Result<Vec<Branch>, tonic::Status> {
        let client = self.client.clone();

        retry_grpc_call(&self.retry_config, "list_branches", || {
            let mut c = client.clone();
            let mut req = Request::new(ListBranchesRequest::default());
            inject_caller_metadata(&mut req, caller);
            async move {
                let mut stream = c.list_branches(req).await?.into_inner();
                let mut branches = Vec::new();
                while let Some(item) = stream.next().await {
                    if let Some(branch) = item?.branch {
                        branches.push(branch);
                    }
                }
                Ok(branches)
            }
        })
        .await
    }

    pub async fn validate_token(
        &self,
        access_token: &str,
    ) -> Result<ValidateTokenResponse, tonic::Status> {
        let client = self.client.clone();
        let request = ValidateTokenRequest {
            access_token: access_token.to_string(),
        };

        retry_grpc_call(&self.retry_config, "validate_token", || {
            let mut c = client.clone();
            let req = request.clone();
            async move { Ok(c.validate_token(Request::new(req)).await?.into_inner()) }
        })
        .await
    }

    pub async fn check_capability(
        &self,
        user_id: &str,
        tenant_id: &str,
        branch_id: &str,
        capability: &str,
    ) -> Result<bool, tonic::Status> {
        let client = self.client.clone();
        let request = CheckCapabilityRequest {
            user_id: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            branch_id: branch_id.to_string(),
            capability: capability.to_string(),
        };

        retry_grpc_call(&self.retry_config, "check_capability", || {
            let mut c = client.clone();
            let req = request.clone();
            async move {
                let response = c.check_capability(Request::new(req)).await?.into_inner();
                Ok(response.allowed)
            }
        })
        .await
    }
}
