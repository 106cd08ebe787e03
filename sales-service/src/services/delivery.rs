//! Edit locks driven by fulfillment activity in the logistics service.

use crate::models::CallerContext;
use crate::services::ports::FulfillmentLog;
use async_trait::async_trait;
use service_core::error::AppError;
use service_core::grpc::{CallerMetadata, LogisticsClient};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct DeliveryStateGuard {
    log: Arc<dyn FulfillmentLog>,
}

impl DeliveryStateGuard {
    pub fn new(log: Arc<dyn FulfillmentLog>) -> Self {
        Self { log }
    }

    /// Any fulfillment record for the order counts, whatever its status.
    #[instrument(skip(self, caller), fields(order_id = %order_id))]
    pub async fn has_fulfillment(&self, caller: &CallerContext, order_id: Uuid) -> Result<bool, AppError> {
        self.log.has_fulfillment(&caller.metadata, order_id).await
    }

    /// Orders with fulfillment can no longer be edited.
    pub async fn ensure_order_editable(&self, caller: &CallerContext, order_id: Uuid) -> Result<(), AppError> {
        if self.has_fulfillment(caller, order_id).await? {
            info!(order_id = %order_id, "Order locked by fulfillment");
            return Err(AppError::forbidden(
                "Can not updated because the sales has delivery transaction",
            ));
        }
        Ok(())
    }

    /// Returns can only be written while the order has no fulfillment.
    pub async fn ensure_returnable(&self, caller: &CallerContext, order_id: Uuid) -> Result<(), AppError> {
        if self.has_fulfillment(caller, order_id).await? {
            info!(order_id = %order_id, "Return blocked by fulfillment");
            return Err(AppError::failed_precondition(
                "Sales has delivery transaction",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl FulfillmentLog for LogisticsClient {
    async fn has_fulfillment(&self, caller: &CallerMetadata, order_id: Uuid) -> Result<bool, AppError> {
        Ok(LogisticsClient::has_fulfillment(self, caller, &order_id.to_string()).await?)
    }
}
