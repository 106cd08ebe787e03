//! Sales return orchestration and discount allocation.
//!
//! Return lines never carry caller pricing: unit price and discount are
//! derived from the originating order line. The header discount follows the
//! order: a percentage discount applies the same percentage, a flat discount
//! is spread over the ordered quantity and capped by what earlier returns
//! already took.

use crate::models::{validate_input, CallerContext, LineDiff, Order, OrderLine, ReturnLine, SalesReturn};
use crate::services::access::AccessScopeResolver;
use crate::services::delivery::DeliveryStateGuard;
use crate::services::ledger::{check_allocation, OutstandingLedger, INVALID_OUTSTANDING};
use crate::services::metrics::record_document;
use crate::services::orders::OrderTransactionCoordinator;
use crate::services::ports::SalesRepository;
use crate::services::pricing::{
    header_totals, proportional_return_discount, net_line_total, HeaderTotals, LinePrice,
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use serde::Serialize;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Validate)]
pub struct ReturnLineChange {
    pub line_id: Option<Uuid>,
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Please supply valid outstanding product"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Validate)]
pub struct CreateReturnInput {
    pub branch_id: Uuid,
    pub order_id: Uuid,
    pub return_date: NaiveDate,
    pub remark: String,
    #[validate(length(min = 1, message = "Please supply valid product"), nested)]
    pub lines: Vec<ReturnLineChange>,
}

#[derive(Debug, Clone, Validate)]
pub struct UpdateReturnInput {
    pub return_id: Uuid,
    pub return_date: Option<NaiveDate>,
    pub remark: Option<String>,
    /// Final line set; empty leaves the persisted lines untouched.
    #[validate(nested)]
    pub lines: Vec<ReturnLineChange>,
}

#[derive(Clone)]
pub struct ReturnAllocationEngine {
    repo: Arc<dyn SalesRepository>,
    orders: OrderTransactionCoordinator,
    access: AccessScopeResolver,
    delivery: DeliveryStateGuard,
    ledger: OutstandingLedger,
}

impl ReturnAllocationEngine {
    pub fn new(
        repo: Arc<dyn SalesRepository>,
        orders: OrderTransactionCoordinator,
        access: AccessScopeResolver,
        delivery: DeliveryStateGuard,
        ledger: OutstandingLedger,
    ) -> Self {
        Self {
            repo,
            orders,
            access,
            delivery,
            ledger,
        }
    }

    #[instrument(skip(self, caller, input), fields(tenant_id = %caller.tenant_id, order_id = %input.order_id))]
    pub async fn create(&self, caller: &CallerContext, input: CreateReturnInput) -> Result<SalesReturn, AppError> {
        validate_input(&input)?;

        let order = self.orders.get(caller, input.order_id).await?;
        self.access.authorize(caller, &input.branch_id).await?;
        self.delivery
            .ensure_returnable(caller, order.order_id)
            .await?;

        let outstanding = self
            .ledger
            .outstanding(caller.tenant_id, order.order_id, None)
            .await?;
        if outstanding.is_empty() {
            return Err(AppError::failed_precondition("Sales has been returned"));
        }
        check_allocation(
            &outstanding,
            input.lines.iter().map(|l| (l.product_id, l.quantity)),
        )?;

        let allocated = self
            .ledger
            .allocated_discount(caller.tenant_id, order.order_id, None)
            .await?;
        let branch = self.access.branch(caller, &input.branch_id).await?;

        let return_id = Uuid::new_v4();
        let lines = input
            .lines
            .iter()
            .map(|line| derived_line(&order, return_id, line.product_id, line.quantity))
            .collect::<Result<Vec<_>, AppError>>()?;

        let totals = return_totals(&order, &lines, allocated);
        let now = Utc::now();

        let sales_return = SalesReturn {
            return_id,
            tenant_id: caller.tenant_id,
            branch_id: input.branch_id,
            branch_name: branch.name,
            order_id: order.order_id,
            code: String::new(),
            return_date: input.return_date,
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

        let created = self.repo.create_return(&sales_return).await?;
        record_document("return", "create");
        info!(return_id = %created.return_id, code = %created.code, total = %created.total_price, "Sales return created");

        Ok(created)
    }

    #[instrument(skip(self, caller, input), fields(tenant_id = %caller.tenant_id, return_id = %input.return_id))]
    pub async fn update(&self, caller: &CallerContext, input: UpdateReturnInput) -> Result<SalesReturn, AppError> {
        validate_input(&input)?;

        let mut sales_return = self.get(caller, input.return_id).await?;
        let order = self.orders.get(caller, sales_return.order_id).await?;
        self.access
            .authorize(caller, &sales_return.branch_id)
            .await?;
        self.delivery
            .ensure_returnable(caller, order.order_id)
            .await?;

        let outstanding = self
            .ledger
            .outstanding(caller.tenant_id, order.order_id, Some(sales_return.return_id))
            .await?;
        let allocated = self
            .ledger
            .allocated_discount(caller.tenant_id, order.order_id, Some(sales_return.return_id))
            .await?;

        let (lines, diff) = if input.lines.is_empty() {
            (sales_return.lines.clone(), LineDiff::default())
        } else {
            plan_line_changes(&order, &sales_return, &input.lines)?
        };
        check_allocation(&outstanding, lines.iter().map(|l| (l.product_id, l.quantity)))?;

        if let Some(return_date) = input.return_date {
            sales_return.return_date = return_date;
        }
        if let Some(remark) = input.remark {
            sales_return.remark = remark;
        }

        let totals = return_totals(&order, &lines, allocated);
        sales_return.price = totals.price;
        sales_return.discount_amount = totals.discount_amount;
        sales_return.discount_percentage = totals.discount_percentage;
        sales_return.total_price = totals.total_price;
        sales_return.updated_by = caller.caller_id.clone();
        sales_return.lines = lines;

        let updated = self.repo.apply_return_changes(&sales_return, &diff).await?;
        record_document("return", "update");
        info!(return_id = %updated.return_id, total = %updated.total_price, "Sales return updated");

        Ok(updated)
    }

    #[instrument(skip(self, caller), fields(tenant_id = %caller.tenant_id))]
    pub async fn get(&self, caller: &CallerContext, return_id: Uuid) -> Result<SalesReturn, AppError> {
        let sales_return = self
            .repo
            .find_return(return_id)
            .await?
            .ok_or_else(|| AppError::not_found("Sales return not found"))?;

        if sales_return.tenant_id != caller.tenant_id {
            return Err(AppError::unauthorized("its not your company"));
        }
        Ok(sales_return)
    }
}

/// Header totals of a return against its order.
pub fn return_totals(order: &Order, lines: &[ReturnLine], allocated: Decimal) -> HeaderTotals {
    let sum: Decimal = lines.iter().map(|l| l.total_price).sum();

    if order.discount_percentage > Decimal::ZERO {
        return header_totals(sum, Decimal::ZERO, order.discount_percentage);
    }

    let ordered: i64 = order.lines.iter().map(|l| i64::from(l.quantity)).sum();
    let returned: i64 = lines.iter().map(|l| i64::from(l.quantity)).sum();
    let discount = proportional_return_discount(order.discount_amount, ordered, returned, allocated);

    header_totals(sum, discount, Decimal::ZERO)
}

/// Return line priced from the order line of the same product.
fn derived_line(order: &Order, return_id: Uuid, product_id: Uuid, quantity: i32) -> Result<ReturnLine, AppError> {
    let order_line = order_line(order, product_id)?;
    let price = LinePrice::new(
        order_line.unit_price,
        order_line.discount_amount,
        order_line.discount_percentage,
    );

    Ok(ReturnLine {
        line_id: Uuid::new_v4(),
        return_id,
        product_id,
        product_code: order_line.product_code.clone(),
        product_name: order_line.product_name.clone(),
        unit_price: price.unit_price,
        discount_amount: price.discount_amount,
        discount_percentage: price.discount_percentage,
        quantity,
        total_price: price.net_total(quantity),
    })
}

fn order_line(order: &Order, product_id: Uuid) -> Result<&OrderLine, AppError> {
    order
        .lines
        .iter()
        .find(|l| l.product_id == product_id)
        .ok_or_else(|| AppError::bad_request(INVALID_OUTSTANDING))
}

/// Two-pass reconciliation of return lines. Matched lines keep their product
/// and stored pricing and change quantity only; new lines are priced from the
/// order; persisted lines not mentioned are deleted.
pub fn plan_line_changes(
    order: &Order,
    sales_return: &SalesReturn,
    changes: &[ReturnLineChange],
) -> Result<(Vec<ReturnLine>, LineDiff<ReturnLine>), AppError> {
    let mut unmatched: HashMap<Uuid, &ReturnLine> = sales_return
        .lines
        .iter()
        .map(|l| (l.line_id, l))
        .collect();
    let mut diff = LineDiff::default();
    let mut lines = Vec::with_capacity(changes.len());

    for change in changes {
        match change.line_id {
            Some(line_id) => {
                let current = unmatched
                    .remove(&line_id)
                    .ok_or_else(|| AppError::bad_request("Please supply valid sales return line"))?;
                if current.product_id != change.product_id {
                    return Err(AppError::bad_request("Please supply valid product"));
                }

                let line = ReturnLine {
                    quantity: change.quantity,
                    total_price: net_line_total(current.unit_price, current.discount_amount, change.quantity),
                    ..current.clone()
                };
                diff.updated.push(line.clone());
                lines.push(line);
            }
            None => {
                let line = derived_line(order, sales_return.return_id, change.product_id, change.quantity)?;
                diff.inserted.push(line.clone());
                lines.push(line);
            }
        }
    }

    diff.deleted = sales_return
        .lines
        .iter()
        .filter(|l| unmatched.contains_key(&l.line_id))
        .map(|l| l.line_id)
        .collect();

    Ok((lines, diff))
}
