//! Sales order orchestration.
//!
//! Every remote check (catalog, identity, logistics) runs before the local
//! write; the repository then persists header and lines in one transaction.

use crate::models::{validate_input, CallerContext, LineDiff, Order, OrderLine};
use crate::services::access::AccessScopeResolver;
use crate::services::catalog::CatalogValidator;
use crate::services::delivery::DeliveryStateGuard;
use crate::services::metrics::record_document;
use crate::services::ports::{ProductSnapshot, SalesRepository};
use crate::services::pricing::{
    header_totals, is_storable, validate_money, validate_percentage, HeaderTotals, LinePrice,
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

const INVALID_PRODUCT: &str = "Please supply valid product";
const INVALID_QUANTITY: &str = "Please supply valid quantity";
const INVALID_PRICE: &str = "Please supply valid price";

/// A line of a new order.
#[derive(Debug, Clone, Serialize, Validate)]
pub struct NewOrderLine {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Please supply valid quantity"))]
    pub quantity: i32,
    /// Catalog price is used when absent.
    #[validate(custom(function = "validate_money", message = "Please supply valid price"))]
    pub unit_price: Option<Decimal>,
    #[validate(custom(function = "validate_money", message = "Please supply valid discount"))]
    pub discount_amount: Decimal,
    #[validate(custom(function = "validate_percentage", message = "Please supply valid discount"))]
    pub discount_percentage: Decimal,
}

#[derive(Debug, Clone, Validate)]
pub struct CreateOrderInput {
    pub branch_id: Uuid,
    pub customer_id: Uuid,
    pub salesman_id: Uuid,
    pub order_date: NaiveDate,
    pub remark: String,
    #[validate(custom(function = "validate_money", message = "Please supply valid discount"))]
    pub discount_amount: Decimal,
    #[validate(custom(function = "validate_percentage", message = "Please supply valid discount"))]
    pub discount_percentage: Decimal,
    #[validate(length(min = 1, message = "Please supply valid product"), nested)]
    pub lines: Vec<NewOrderLine>,
}

/// A line of an order update. With `line_id` it edits that persisted line,
/// merging only the fields present; without it a new line is added.
#[derive(Debug, Clone, Serialize, Validate)]
pub struct OrderLineChange {
    pub line_id: Option<Uuid>,
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Please supply valid quantity"))]
    pub quantity: Option<i32>,
    #[validate(custom(function = "validate_money", message = "Please supply valid price"))]
    pub unit_price: Option<Decimal>,
    #[validate(custom(function = "validate_money", message = "Please supply valid discount"))]
    pub discount_amount: Option<Decimal>,
    #[validate(custom(function = "validate_percentage", message = "Please supply valid discount"))]
    pub discount_percentage: Option<Decimal>,
}

#[derive(Debug, Clone, Validate)]
pub struct UpdateOrderInput {
    pub order_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub salesman_id: Option<Uuid>,
    pub order_date: Option<NaiveDate>,
    pub remark: Option<String>,
    #[validate(custom(function = "validate_money", message = "Please supply valid discount"))]
    pub discount_amount: Option<Decimal>,
    #[validate(custom(function = "validate_percentage", message = "Please supply valid discount"))]
    pub discount_percentage: Option<Decimal>,
    /// Final line set; empty leaves the persisted lines untouched.
    #[validate(nested)]
    pub lines: Vec<OrderLineChange>,
}

#[derive(Clone)]
pub struct OrderTransactionCoordinator {
    repo: Arc<dyn SalesRepository>,
    access: AccessScopeResolver,
    catalog: CatalogValidator,
    delivery: DeliveryStateGuard,
}

impl OrderTransactionCoordinator {
    pub fn new(
        repo: Arc<dyn SalesRepository>,
        access: AccessScopeResolver,
        catalog: CatalogValidator,
        delivery: DeliveryStateGuard,
    ) -> Self {
        Self {
            repo,
            access,
            catalog,
            delivery,
        }
    }

    #[instrument(skip(self, caller, input), fields(tenant_id = %caller.tenant_id, branch_id = %input.branch_id))]
    pub async fn create(&self, caller: &CallerContext, input: CreateOrderInput) -> Result<Order, AppError> {
        validate_input(&input)?;

        let product_ids: Vec<Uuid> = input.lines.iter().map(|l| l.product_id).collect();
        let products = self.catalog.resolve(&caller.metadata, &product_ids).await?;

        self.access.authorize(caller, &input.branch_id).await?;
        self.ensure_parties(caller, Some(input.customer_id), Some(input.salesman_id))
            .await?;
        let branch = self.access.branch(caller, &input.branch_id).await?;

        let order_id = Uuid::new_v4();
        let lines = input
            .lines
            .iter()
            .map(|line| {
                let product = snapshot(&products, line.product_id)?;
                let price = LinePrice::new(
                    line.unit_price.unwrap_or(product.unit_price),
                    line.discount_amount,
                    line.discount_percentage,
                );
                let total = price.order_total(line.quantity);
                Ok(priced_line(Uuid::new_v4(), order_id, product, price, line.quantity, total))
            })
            .collect::<Result<Vec<_>, AppError>>()?;

        ensure_storable(lines.iter().map(|l| l.total_price))?;
        let totals = header_totals(
            line_sum(&lines)?,
            input.discount_amount,
            input.discount_percentage,
        );
        ensure_storable(header_amounts(&totals))?;
        let now = Utc::now();

        let order = Order {
            order_id,
            tenant_id: caller.tenant_id,
            branch_id: input.branch_id,
            branch_name: branch.name,
            customer_id: input.customer_id,
            salesman_id: input.salesman_id,
            code: String::new(),
            order_date: input.order_date,
            remark: input.remark,
            price: totals.price,
            discount_amount: totals.discount_amount,
            discount_percentage: totals.discount_percentage,
            total_price: totals.total_price,
            created_by: caller.caller_id.clone(),
            updated_by: caller.caller_id.clone(),
            created_utc: now,
            updated_utc: now,
            lines,
        };

        let created = self.repo.create_order(&order).await?;
        record_document("order", "create");
        info!(order_id = %created.order_id, code = %created.code, total = %created.total_price, "Sales order created");

        Ok(created)
    }

    #[instrument(skip(self, caller, input), fields(tenant_id = %caller.tenant_id, order_id = %input.order_id))]
    pub async fn update(&self, caller: &CallerContext, input: UpdateOrderInput) -> Result<Order, AppError> {
        if self.repo.has_return(caller.tenant_id, input.order_id).await? {
            info!("Order locked by return");
            return Err(AppError::forbidden(
                "Can not updated because the sales has return transaction",
            ));
        }
        self.delivery
            .ensure_order_editable(caller, input.order_id)
            .await?;
        validate_input(&input)?;

        let mut order = self.get(caller, input.order_id).await?;
        self.access.authorize(caller, &order.branch_id).await?;
        self.ensure_parties(caller, input.customer_id, input.salesman_id)
            .await?;

        if let Some(customer_id) = input.customer_id {
            order.customer_id = customer_id;
        }
        if let Some(salesman_id) = input.salesman_id {
            order.salesman_id = salesman_id;
        }
        if let Some(order_date) = input.order_date {
            order.order_date = order_date;
        }
        if let Some(remark) = input.remark {
            order.remark = remark;
        }

        let (lines, diff) = if input.lines.is_empty() {
            (order.lines.clone(), LineDiff::default())
        } else {
            let product_ids: Vec<Uuid> = input.lines.iter().map(|l| l.product_id).collect();
            let products = self.catalog.resolve(&caller.metadata, &product_ids).await?;
            plan_line_changes(order.order_id, &order.lines, &input.lines, &products)?
        };

        ensure_storable(lines.iter().map(|l| l.total_price))?;
        let totals = header_totals(
            line_sum(&lines)?,
            input.discount_amount.unwrap_or(order.discount_amount),
            input
                .discount_percentage
                .unwrap_or(order.discount_percentage),
        );
        ensure_storable(header_amounts(&totals))?;
        order.price = totals.price;
        order.discount_amount = totals.discount_amount;
        order.discount_percentage = totals.discount_percentage;
        order.total_price = totals.total_price;
        order.updated_by = caller.caller_id.clone();
        order.lines = lines;

        let updated = self.repo.apply_order_changes(&order, &diff).await?;
        record_document("order", "update");
        info!(order_id = %updated.order_id, total = %updated.total_price, "Sales order updated");

        Ok(updated)
    }

    /// Order with lines. A document of another tenant is an authorization
    /// failure, not a missing row.
    #[instrument(skip(self, caller), fields(tenant_id = %caller.tenant_id))]
    pub async fn get(&self, caller: &CallerContext, order_id: Uuid) -> Result<Order, AppError> {
        let order = self
            .repo
            .find_order(order_id)
            .await?
            .ok_or_else(|| AppError::not_found("Sales not found"))?;

        if order.tenant_id != caller.tenant_id {
            return Err(AppError::unauthorized("its not your company"));
        }
        Ok(order)
    }

    async fn ensure_parties(
        &self,
        caller: &CallerContext,
        customer_id: Option<Uuid>,
        salesman_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        if let Some(customer_id) = customer_id {
            if !self.repo.customer_exists(caller.tenant_id, customer_id).await? {
                return Err(AppError::bad_request("Please supply valid customer"));
            }
        }
        if let Some(salesman_id) = salesman_id {
            if !self.repo.salesman_exists(caller.tenant_id, salesman_id).await? {
                return Err(AppError::bad_request("Please supply valid salesman"));
            }
        }
        Ok(())
    }
}

/// Reconcile the requested line set against the persisted lines.
///
/// First pass walks the request: lines with an id must match a persisted line
/// and merge the fields present, lines without one are new. Second pass marks
/// every persisted line the request did not mention for deletion. Returns the
/// final line set alongside the diff.
///
/// Lines priced here total `(price - discount) * qty`, unlike lines priced at
/// creation.
pub fn plan_line_changes(
    order_id: Uuid,
    persisted: &[OrderLine],
    changes: &[OrderLineChange],
    products: &HashMap<Uuid, ProductSnapshot>,
) -> Result<(Vec<OrderLine>, LineDiff<OrderLine>), AppError> {
    let mut unmatched: HashMap<Uuid, &OrderLine> =
        persisted.iter().map(|l| (l.line_id, l)).collect();
    let mut seen_products = HashSet::new();
    let mut diff = LineDiff::default();
    let mut lines = Vec::with_capacity(changes.len());

    for change in changes {
        if !seen_products.insert(change.product_id) {
            return Err(AppError::bad_request(INVALID_PRODUCT));
        }
        let product = snapshot(products, change.product_id)?;

        match change.line_id {
            Some(line_id) => {
                let current = unmatched
                    .remove(&line_id)
                    .ok_or_else(|| AppError::bad_request("Please supply valid sales line"))?;

                let price = LinePrice::new(
                    change.unit_price.unwrap_or(current.unit_price),
                    change.discount_amount.unwrap_or(current.discount_amount),
                    change
                        .discount_percentage
                        .unwrap_or(current.discount_percentage),
                );
                let quantity = change.quantity.unwrap_or(current.quantity);
                let total = price.net_total(quantity);
                let line = priced_line(line_id, order_id, product, price, quantity, total);
                diff.updated.push(line.clone());
                lines.push(line);
            }
            None => {
                let quantity = change
                    .quantity
                    .ok_or_else(|| AppError::bad_request(INVALID_QUANTITY))?;
                let price = LinePrice::new(
                    change.unit_price.unwrap_or(product.unit_price),
                    change.discount_amount.unwrap_or_default(),
                    change.discount_percentage.unwrap_or_default(),
                );
                let total = price.net_total(quantity);
                let line = priced_line(Uuid::new_v4(), order_id, product, price, quantity, total);
                diff.inserted.push(line.clone());
                lines.push(line);
            }
        }
    }

    diff.deleted = persisted
        .iter()
        .filter(|l| unmatched.contains_key(&l.line_id))
        .map(|l| l.line_id)
        .collect();

    Ok((lines, diff))
}

fn snapshot(products: &HashMap<Uuid, ProductSnapshot>, product_id: Uuid) -> Result<&ProductSnapshot, AppError> {
    products
        .get(&product_id)
        .ok_or_else(|| AppError::bad_request(INVALID_PRODUCT))
}

fn priced_line(
    line_id: Uuid,
    order_id: Uuid,
    product: &ProductSnapshot,
    price: LinePrice,
    quantity: i32,
    total_price: Decimal,
) -> OrderLine {
    OrderLine {
        line_id,
        order_id,
        product_id: product.product_id,
        product_code: product.code.clone(),
        product_name: product.name.clone(),
        unit_price: price.unit_price,
        discount_amount: price.discount_amount,
        discount_percentage: price.discount_percentage,
        quantity,
        total_price,
    }
}

fn line_sum(lines: &[OrderLine]) -> Result<Decimal, AppError> {
    lines.iter().try_fold(Decimal::ZERO, |sum, l| {
        sum.checked_add(l.total_price)
            .ok_or_else(|| AppError::bad_request(INVALID_PRICE))
    })
}

/// Every amount must fit its `NUMERIC(20, 4)` column. Line totals are checked
/// before the header is priced from their sum.
fn ensure_storable(amounts: impl IntoIterator<Item = Decimal>) -> Result<(), AppError> {
    if amounts.into_iter().all(is_storable) {
        Ok(())
    } else {
        Err(AppError::bad_request(INVALID_PRICE))
    }
}

fn header_amounts(totals: &HeaderTotals) -> [Decimal; 3] {
    [totals.price, totals.discount_amount, totals.total_price]
}
