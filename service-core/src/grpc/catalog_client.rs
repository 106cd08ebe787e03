//! Catalog (product) service gRPC client.

use futures::StreamExt;
use std::time::Duration;
use tonic::Request;
use tonic::transport::{Channel, Endpoint};

use super::interceptors::{CallerMetadata, inject_caller_metadata};
use super::proto::catalog::product_service_client::ProductServiceClient;
use super::proto::catalog::{ListProductsRequest, Product};
use super::retry::{RetryConfig, retry_grpc_call};

#[derive(Clone, Debug)]
pub struct CatalogClientConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry_config: RetryConfig,
}

impl Default for CatalogClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://catalog-service:3001".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            retry_config: RetryConfig::default(),
        }
    }
}

/// Product catalog client with retry support.
#[derive(Clone)]
pub struct CatalogClient {
    client: ProductServiceClient<Channel>,
    retry_config: RetryConfig,
}

impl CatalogClient {
    pub async fn new(config: CatalogClientConfig) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(config.endpoint)?
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .connect()
            .await?;

        Ok(Self {
            client: ProductServiceClient::new(channel),
            retry_config: config.retry_config,
        })
    }

    pub async fn connect(endpoint: &str) -> Result<Self, tonic::transport::Error> {
        Self::new(CatalogClientConfig {
            endpoint: endpoint.to_string(),
            ..Default::default()
        })
        .await
    }

    /// List the products matching an id set. Unknown ids are simply absent
    /// from the result.
    pub async fn list_products(
        &self,
        caller: &CallerMetadata,
        product_ids: &[String],
    ) -> Result<Vec<Product>, tonic::Status> {
        let client = self.client.clone();
        let request = ListProductsRequest {
            product_ids: product_ids.to_vec(),
        };

        retry_grpc_call(&self.retry_config, "list_products", || {
            let mut c = client.clone();
            let mut req = Request::new(request.clone());
            inject_caller_metadata(&mut req, caller);
            async move {
                let mut stream = c.list_products(req).await?.into_inner();
                let mut products = Vec::new();
                while let Some(item) = stream.next().await {
                    if let Some(product) = item?.product {
                        products.push(product);
                    }
                }
                Ok(products)
            }
        })
        .await
    }
}
