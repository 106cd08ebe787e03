//! Branch authorization.
//!
//! A caller may act on a branch when, in order of precedence:
//! 1. their profile assigns them that branch directly,
//! 2. their profile assigns a region containing the branch,
//! 3. they have no assignment and the branch is in the full branch listing.
//!
//! The first tier present in the profile decides; lower tiers are not consulted.

use crate::models::CallerContext;
use crate::services::ports::{BranchRecord, IdentityDirectory, UserScope};
use async_trait::async_trait;
use service_core::error::AppError;
use service_core::grpc::{AuthContext, CallerMetadata, IdentityClient};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const NOT_YOUR_BRANCH: &str = "its not your branch";

#[derive(Clone)]
pub struct AccessScopeResolver {
    directory: Arc<dyn IdentityDirectory>,
}

impl AccessScopeResolver {
    pub fn new(directory: Arc<dyn IdentityDirectory>) -> Self {
        Self { directory }
    }

    /// Build the caller context for an authenticated request, loading the
    /// caller's branch/region assignment from the identity service.
    #[instrument(skip(self, auth), fields(tenant_id = %auth.tenant_id, user_id = %auth.user_id))]
    pub async fn caller_context(&self, auth: &AuthContext) -> Result<CallerContext, AppError> {
        let tenant_id = Uuid::parse_str(&auth.tenant_id)
            .map_err(|_| AppError::unauthorized("Invalid tenant context"))?;

        let mut caller = CallerContext::tenant_wide(tenant_id, auth.user_id.clone());
        caller.metadata = CallerMetadata::new(auth.tenant_id.clone(), auth.user_id.clone())
            .with_authorization(auth.authorization.clone());

        let scope = self
            .directory
            .user_scope(&caller.metadata, &auth.user_id)
            .await?;

        Ok(caller.with_scope(scope.branch_id, scope.region_id))
    }

    /// Require that `caller` may act on `branch_id`.
    #[instrument(skip(self, caller), fields(tenant_id = %caller.tenant_id, branch_id = %branch_id))]
    pub async fn authorize(&self, caller: &CallerContext, branch_id: &Uuid) -> Result<(), AppError> {
        let allowed = if let Some(own) = &caller.branch_id {
            debug!("Authorizing by direct branch assignment");
            same_id(own, branch_id)
        } else if let Some(region_id) = &caller.region_id {
            debug!(region_id = %region_id, "Authorizing by region membership");
            self.directory
                .region_branch_ids(&caller.metadata, region_id)
                .await?
                .iter()
                .any(|id| same_id(id, branch_id))
        } else {
            debug!("Authorizing against full branch listing");
            self.directory
                .all_branch_ids(&caller.metadata)
                .await?
                .iter()
                .any(|id| same_id(id, branch_id))
        };

        if allowed {
            Ok(())
        } else {
            warn!(caller_id = %caller.caller_id, "Branch outside caller scope");
            Err(AppError::unauthorized(NOT_YOUR_BRANCH))
        }
    }

    /// Branch record, used for the denormalized branch name on documents.
    pub async fn branch(&self, caller: &CallerContext, branch_id: &Uuid) -> Result<BranchRecord, AppError> {
        self.directory
            .branch(&caller.metadata, &branch_id.to_string())
            .await
    }
}

fn same_id(candidate: &str, branch_id: &Uuid) -> bool {
    Uuid::parse_str(candidate.trim())
        .map(|id| id == *branch_id)
        .unwrap_or(false)
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

#[async_trait]
impl IdentityDirectory for IdentityClient {
    async fn user_scope(&self, caller: &CallerMetadata, user_id: &str) -> Result<UserScope, AppError> {
        let user = self.view_user(caller, user_id).await?;
        Ok(UserScope {
            branch_id: non_empty(user.branch_id),
            region_id: non_empty(user.region_id),
        })
    }

    async fn region_branch_ids(
        &self,
        caller: &CallerMetadata,
        region_id: &str,
    ) -> Result<Vec<String>, AppError> {
        let region = self.view_region(caller, region_id).await?;
        Ok(region.branches.into_iter().map(|b| b.branch_id).collect())
    }

    async fn all_branch_ids(&self, caller: &CallerMetadata) -> Result<Vec<String>, AppError> {
        let branches = self.list_branches(caller).await?;
        Ok(branches.into_iter().map(|b| b.branch_id).collect())
    }

    async fn branch(&self, caller: &CallerMetadata, branch_id: &str) -> Result<BranchRecord, AppError> {
        let branch = self.view_branch(caller, branch_id).await?;
        Ok(BranchRecord {
            branch_id: branch.branch_id,
            name: branch.name,
        })
    }
}
