//! Sales Service - Sales orders and returns with outstanding-quantity reconciliation.

pub mod config;
pub mod grpc;
pub mod models;
pub mod services;
pub mod startup;
