//! Services module for sales-service.

pub mod access;
pub mod catalog;
pub mod database;
pub mod delivery;
pub mod ledger;
pub mod metrics;
pub mod orders;
pub mod ports;
pub mod pricing;
pub mod query;
pub mod returns;

#[cfg(test)]
pub(crate) mod fakes;

pub use access::AccessScopeResolver;
pub use catalog::CatalogValidator;
pub use database::Database;
pub use delivery::DeliveryStateGuard;
pub use ledger::OutstandingLedger;
pub use metrics::{get_metrics, init_metrics, record_document, record_error};
pub use orders::OrderTransactionCoordinator;
pub use returns::ReturnAllocationEngine;
