//! Logistics (delivery) service gRPC client.

use futures::StreamExt;
use std::time::Duration;
use tonic::Request;
use tonic::transport::{Channel, Endpoint};

use super::interceptors::{CallerMetadata, inject_caller_metadata};
use super::proto::logistics::ListFulfillmentByOrderRequest;
use super::proto::logistics::delivery_service_client::DeliveryServiceClient;
use super::retry::{RetryConfig, retry_grpc_call};

#[derive(Clone, Debug)]
pub struct LogisticsClientConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry_config: RetryConfig,
}

impl Default for LogisticsClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://logistics-service:3001".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            retry_config: RetryConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct LogisticsClient {
    client: DeliveryServiceClient<Channel>,
    retry_config: RetryConfig,
}

impl LogisticsClient {
    pub async fn new(config: LogisticsClientConfig) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(config.endpoint)?
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .connect()
            .await?;

        Ok(Self {
            client: DeliveryServiceClient::new(channel),
            retry_config: config.retry_config,
        })
    }

    pub async fn connect(endpoint: &str) -> Result<Self, tonic::transport::Error> {
        Self::new(LogisticsClientConfig {
            endpoint: endpoint.to_string(),
            ..Default::default()
        })
        .await
    }

    /// Returns true as soon as the first fulfillment record for the order
    /// arrives; the rest of the stream is not read.
    pub async fn has_fulfillment(
        &self,
        caller: &CallerMetadata,
        order_id: &str,
    ) -> Result<bool, tonic::Status> {
        let client = self.client.clone();
        let request = ListFulfillmentByOrderRequest {
            order_id: order_id.to_string(),
        };

        retry_grpc_call(&self.retry_config, "list_fulfillment_by_order", || {
            let mut c = client.clone();
            let mut req = Request::new(request.clone());
            inject_caller_metadata(&mut req, caller);
            async move {
                let mut stream = c.list_fulfillment_by_order(req).await?.into_inner();
                match stream.next().await {
                    Some(item) => item.map(|_| true),
                    None => Ok(false),
                }
            }
        })
        .await
    }
}
