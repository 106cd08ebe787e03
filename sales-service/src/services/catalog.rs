//! Product resolution against the catalog service.

use crate::services::ports::{ProductCatalog, ProductSnapshot};
use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::grpc::{CallerMetadata, CatalogClient};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

const INVALID_PRODUCT: &str = "Please supply valid product";

#[derive(Clone)]
pub struct CatalogValidator {
    catalog: Arc<dyn ProductCatalog>,
}

impl CatalogValidator {
    pub fn new(catalog: Arc<dyn ProductCatalog>) -> Self {
        Self { catalog }
    }

    /// Resolve every id in `product_ids` to its catalog snapshot.
    ///
    /// The catalog must return exactly one product per requested id: a
    /// duplicate id in the input or a product the catalog does not know both
    /// fail the whole set.
    #[instrument(skip(self, caller, product_ids), fields(products = product_ids.len()))]
    pub async fn resolve(
        &self,
        caller: &CallerMetadata,
        product_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, ProductSnapshot>, AppError> {
        if product_ids.is_empty() {
            return Err(AppError::bad_request(INVALID_PRODUCT));
        }

        let products = self.catalog.list_products(caller, product_ids).await?;

        let mut resolved = HashMap::with_capacity(products.len());
        for product in products {
            if product_ids.contains(&product.product_id) {
                resolved.insert(product.product_id, product);
            }
        }

        if resolved.len() != product_ids.len() {
            warn!(
                requested = product_ids.len(),
                resolved = resolved.len(),
                "Product set did not resolve"
            );
            return Err(AppError::bad_request(INVALID_PRODUCT));
        }

        Ok(resolved)
    }
}

#[async_trait]
impl ProductCatalog for CatalogClient {
    async fn list_products(
        &self,
        caller: &CallerMetadata,
        product_ids: &[Uuid],
    ) -> Result<Vec<ProductSnapshot>, AppError> {
        let ids: Vec<String> = product_ids.iter().map(Uuid::to_string).collect();
        let products = CatalogClient::list_products(self, caller, &ids).await?;

        products
            .into_iter()
            .map(|p| {
                let product_id = Uuid::parse_str(&p.product_id).map_err(|_| {
                    AppError::InternalError(anyhow::anyhow!(
                        "Catalog returned invalid product id: {}",
                        p.product_id
                    ))
                })?;
                let unit_price = Decimal::from_str(&p.unit_price).map_err(|_| {
                    AppError::InternalError(anyhow::anyhow!(
                        "Catalog returned invalid price for product {}",
                        p.product_id
                    ))
                })?;
                Ok(ProductSnapshot {
                    product_id,
                    code: p.code,
                    name: p.name,
                    unit_price,
                })
            })
            .collect()
    }
}
