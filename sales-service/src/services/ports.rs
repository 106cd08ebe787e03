//! Seams between the sales engine and its collaborators.
//!
//! Identity, catalog and logistics are remote gRPC services; the repository is
//! Postgres. Each sits behind a trait so the coordinators can run against
//! in-memory doubles.

use crate::models::{LineBalance, LineDiff, Order, OrderLine, ReturnLine, SalesReturn};
use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::grpc::CallerMetadata;
use uuid::Uuid;

/// Branch and region assignment of a user profile. Empty values mean the
/// user is not restricted at that tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserScope {
    pub branch_id: Option<String>,
    pub region_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRecord {
    pub branch_id: String,
    pub name: String,
}

/// Canonical catalog data for one product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductSnapshot {
    pub product_id: Uuid,
    pub code: String,
    pub name: String,
    pub unit_price: Decimal,
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn user_scope(&self, caller: &CallerMetadata, user_id: &str) -> Result<UserScope, AppError>;

    /// Branch ids belonging to a region.
    async fn region_branch_ids(
        &self,
        caller: &CallerMetadata,
        region_id: &str,
    ) -> Result<Vec<String>, AppError>;

    /// Every branch visible to the caller.
    async fn all_branch_ids(&self, caller: &CallerMetadata) -> Result<Vec<String>, AppError>;

    async fn branch(&self, caller: &CallerMetadata, branch_id: &str) -> Result<BranchRecord, AppError>;
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Products matching `product_ids`; unknown ids are absent from the result.
    async fn list_products(
        &self,
        caller: &CallerMetadata,
        product_ids: &[Uuid],
    ) -> Result<Vec<ProductSnapshot>, AppError>;
}

#[async_trait]
pub trait FulfillmentLog: Send + Sync {
    async fn has_fulfillment(&self, caller: &CallerMetadata, order_id: Uuid) -> Result<bool, AppError>;
}

/// Persistence used by the order and return coordinators.
///
/// Lookups by document id are not tenant-filtered; callers compare the
/// tenant themselves so a foreign document is reported as unauthorized rather
/// than missing.
#[async_trait]
pub trait SalesRepository: Send + Sync {
    async fn customer_exists(&self, tenant_id: Uuid, customer_id: Uuid) -> Result<bool, AppError>;

    async fn salesman_exists(&self, tenant_id: Uuid, salesman_id: Uuid) -> Result<bool, AppError>;

    /// Order header with its lines.
    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>, AppError>;

    async fn has_return(&self, tenant_id: Uuid, order_id: Uuid) -> Result<bool, AppError>;

    /// Insert a priced order; the code and audit timestamps are assigned here.
    async fn create_order(&self, order: &Order) -> Result<Order, AppError>;

    /// Write the merged header and the line diff in one transaction.
    async fn apply_order_changes(
        &self,
        order: &Order,
        lines: &LineDiff<OrderLine>,
    ) -> Result<Order, AppError>;

    /// Return header with its lines.
    async fn find_return(&self, return_id: Uuid) -> Result<Option<SalesReturn>, AppError>;

    /// Ordered and returned quantity per order line, ignoring `exclude_return`.
    async fn line_balances(
        &self,
        tenant_id: Uuid,
        order_id: Uuid,
        exclude_return: Option<Uuid>,
    ) -> Result<Vec<LineBalance>, AppError>;

    /// Header discount already stored on the order's returns, ignoring
    /// `exclude_return`.
    async fn allocated_discount(
        &self,
        tenant_id: Uuid,
        order_id: Uuid,
        exclude_return: Option<Uuid>,
    ) -> Result<Decimal, AppError>;

    /// Insert a priced return after re-checking outstanding quantities under
    /// a lock on the order.
    async fn create_return(&self, sales_return: &SalesReturn) -> Result<SalesReturn, AppError>;

    /// Write the merged return header and line diff under the same lock and
    /// re-check. `sales_return.lines` holds the final line set.
    async fn apply_return_changes(
        &self,
        sales_return: &SalesReturn,
        lines: &LineDiff<ReturnLine>,
    ) -> Result<SalesReturn, AppError>;
}
