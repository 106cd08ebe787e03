//! Capability definitions for sales-service.
//!
//! Re-exports shared capability infrastructure from service-core and
//! provides service-specific capability constants.

pub use service_core::grpc::{AuthContext, CapabilityChecker};

/// Sales service capabilities.
pub mod capabilities {
    /// Create sales orders.
    pub const SALES_ORDER_CREATE: &str = "sales.order:create";

    /// View sales orders.
    pub const SALES_ORDER_READ: &str = "sales.order:read";

    /// Update sales orders without return or delivery.
    pub const SALES_ORDER_UPDATE: &str = "sales.order:update";

    /// Create sales returns.
    pub const SALES_RETURN_CREATE: &str = "sales.return:create";

    /// View sales returns.
    pub const SALES_RETURN_READ: &str = "sales.return:read";

    /// Update sales returns.
    pub const SALES_RETURN_UPDATE: &str = "sales.return:update";

    pub const SALES_CUSTOMER_CREATE: &str = "sales.customer:create";
    pub const SALES_CUSTOMER_READ: &str = "sales.customer:read";
    pub const SALES_CUSTOMER_UPDATE: &str = "sales.customer:update";
    pub const SALES_CUSTOMER_DELETE: &str = "sales.customer:delete";

    pub const SALES_SALESMAN_CREATE: &str = "sales.salesman:create";
    pub const SALES_SALESMAN_READ: &str = "sales.salesman:read";
    pub const SALES_SALESMAN_UPDATE: &str = "sales.salesman:update";
    pub const SALES_SALESMAN_DELETE: &str = "sales.salesman:delete";
}
