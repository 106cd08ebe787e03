//! Outstanding (still returnable) quantities of an order.
//!
//! Outstanding per product is the ordered quantity minus everything returned
//! by the order's return documents, optionally ignoring the return being
//! edited. Products with nothing left are omitted, so an empty map means the
//! order is fully returned.

use crate::models::LineBalance;
use crate::services::ports::SalesRepository;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

pub const INVALID_OUTSTANDING: &str = "Please supply valid outstanding product";

#[derive(Clone)]
pub struct OutstandingLedger {
    repo: Arc<dyn SalesRepository>,
}

impl OutstandingLedger {
    pub fn new(repo: Arc<dyn SalesRepository>) -> Self {
        Self { repo }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, order_id = %order_id))]
    pub async fn outstanding(
        &self,
        tenant_id: Uuid,
        order_id: Uuid,
        exclude_return: Option<Uuid>,
    ) -> Result<HashMap<Uuid, i32>, AppError> {
        let balances = self
            .repo
            .line_balances(tenant_id, order_id, exclude_return)
            .await?;
        Ok(remaining(&balances))
    }

    /// Header discount already consumed by the order's other returns.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, order_id = %order_id))]
    pub async fn allocated_discount(
        &self,
        tenant_id: Uuid,
        order_id: Uuid,
        exclude_return: Option<Uuid>,
    ) -> Result<Decimal, AppError> {
        self.repo
            .allocated_discount(tenant_id, order_id, exclude_return)
            .await
    }
}

/// Remaining quantity per product, dropping products with nothing left.
pub fn remaining(balances: &[LineBalance]) -> HashMap<Uuid, i32> {
    balances
        .iter()
        .filter_map(|b| {
            let left = b.ordered - b.returned;
            (left > 0).then(|| (b.product_id, i32::try_from(left).unwrap_or(i32::MAX)))
        })
        .collect()
}

/// Check a complete set of return lines against the outstanding map: each
/// product at most once, each quantity positive and within what is left.
pub fn check_allocation<I>(outstanding: &HashMap<Uuid, i32>, lines: I) -> Result<(), AppError>
where
    I: IntoIterator<Item = (Uuid, i32)>,
{
    let mut seen = HashMap::new();
    for (product_id, quantity) in lines {
        if seen.insert(product_id, quantity).is_some() {
            return Err(AppError::bad_request(INVALID_OUTSTANDING));
        }
        match outstanding.get(&product_id) {
            Some(left) if quantity > 0 && quantity <= *left => {}
            _ => return Err(AppError::bad_request(INVALID_OUTSTANDING)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(product_id: Uuid, ordered: i64, returned: i64) -> LineBalance {
        LineBalance {
            product_id,
            ordered,
            returned,
        }
    }

    #[test]
    fn test_remaining_omits_fully_returned_products() {
        let p = Uuid::new_v4();
        let q = Uuid::new_v4();
        let r = Uuid::new_v4();
        let left = remaining(&[balance(p, 10, 4), balance(q, 5, 5), balance(r, 3, 0)]);

        assert_eq!(left.len(), 2);
        assert_eq!(left[&p], 6);
        assert_eq!(left[&r], 3);
        assert!(!left.contains_key(&q));
    }

    #[test]
    fn test_check_allocation_bounds() {
        let p = Uuid::new_v4();
        let outstanding = HashMap::from([(p, 6)]);

        assert!(check_allocation(&outstanding, [(p, 6)]).is_ok());
        assert!(check_allocation(&outstanding, [(p, 7)]).is_err());
        assert!(check_allocation(&outstanding, [(p, 0)]).is_err());
        assert!(check_allocation(&outstanding, [(Uuid::new_v4(), 1)]).is_err());
    }

    #[test]
    fn test_check_allocation_rejects_duplicate_product() {
        let p = Uuid::new_v4();
        let outstanding = HashMap::from([(p, 6)]);
        let err = check_allocation(&outstanding, [(p, 1), (p, 2)]).unwrap_err();
        assert_eq!(err.to_string(), format!("Bad request: {}", INVALID_OUTSTANDING));
    }
}
