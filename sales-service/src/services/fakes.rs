//! In-memory collaborators for exercising the coordinators without Postgres
//! or remote services.

use crate::models::{CallerContext, LineBalance, LineDiff, Order, OrderLine, ReturnLine, SalesReturn};
use crate::services::access::tests::FakeDirectory;
use crate::services::access::AccessScopeResolver;
use crate::services::catalog::tests::FakeCatalog;
use crate::services::catalog::CatalogValidator;
use crate::services::delivery::tests::FakeFulfillment;
use crate::services::delivery::DeliveryStateGuard;
use crate::services::ledger::{check_allocation, remaining, OutstandingLedger};
use crate::services::orders::{CreateOrderInput, NewOrderLine, OrderTransactionCoordinator};
use crate::services::ports::SalesRepository;
use crate::services::returns::{CreateReturnInput, ReturnAllocationEngine, ReturnLineChange};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Repository double keeping documents in maps. Codes use a single counter
/// per prefix.
#[derive(Default)]
pub(crate) struct FakeRepository {
    pub orders: Mutex<HashMap<Uuid, Order>>,
    pub returns: Mutex<HashMap<Uuid, SalesReturn>>,
    pub customers: HashSet<(Uuid, Uuid)>,
    pub salesmen: HashSet<(Uuid, Uuid)>,
    sequence: Mutex<i64>,
}

impl FakeRepository {
    pub(crate) fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    pub(crate) fn return_count(&self) -> usize {
        self.returns.lock().unwrap().len()
    }

    fn next_code(&self, prefix: &str) -> String {
        let mut sequence = self.sequence.lock().unwrap();
        *sequence += 1;
        format!("{}{}{}", prefix, Utc::now().format("%Y%m"), *sequence)
    }

    fn balances(&self, order_id: Uuid, exclude_return: Option<Uuid>) -> Vec<LineBalance> {
        let orders = self.orders.lock().unwrap();
        let returns = self.returns.lock().unwrap();
        let Some(order) = orders.get(&order_id) else {
            return Vec::new();
        };

        order
            .lines
            .iter()
            .map(|line| LineBalance {
                product_id: line.product_id,
                ordered: i64::from(line.quantity),
                returned: returns
                    .values()
                    .filter(|r| r.order_id == order_id && Some(r.return_id) != exclude_return)
                    .flat_map(|r| r.lines.iter())
                    .filter(|l| l.product_id == line.product_id)
                    .map(|l| i64::from(l.quantity))
                    .sum(),
            })
            .collect()
    }
}

fn apply_diff<L: Clone>(lines: &mut Vec<L>, diff: &LineDiff<L>, id: impl Fn(&L) -> Uuid) {
    lines.retain(|l| !diff.deleted.contains(&id(l)));
    for updated in &diff.updated {
        if let Some(slot) = lines.iter_mut().find(|l| id(l) == id(updated)) {
            *slot = updated.clone();
        }
    }
    lines.extend(diff.inserted.iter().cloned());
}

#[async_trait]
impl SalesRepository for FakeRepository {
    async fn customer_exists(&self, tenant_id: Uuid, customer_id: Uuid) -> Result<bool, AppError> {
        Ok(self.customers.contains(&(tenant_id, customer_id)))
    }

    async fn salesman_exists(&self, tenant_id: Uuid, salesman_id: Uuid) -> Result<bool, AppError> {
        Ok(self.salesmen.contains(&(tenant_id, salesman_id)))
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>, AppError> {
        Ok(self.orders.lock().unwrap().get(&order_id).cloned())
    }

    async fn has_return(&self, tenant_id: Uuid, order_id: Uuid) -> Result<bool, AppError> {
        Ok(self
            .returns
            .lock()
            .unwrap()
            .values()
            .any(|r| r.tenant_id == tenant_id && r.order_id == order_id))
    }

    async fn create_order(&self, order: &Order) -> Result<Order, AppError> {
        let mut created = order.clone();
        created.code = self.next_code("DO");
        self.orders
            .lock()
            .unwrap()
            .insert(created.order_id, created.clone());
        Ok(created)
    }

    async fn apply_order_changes(
        &self,
        order: &Order,
        lines: &LineDiff<OrderLine>,
    ) -> Result<Order, AppError> {
        let mut orders = self.orders.lock().unwrap();
        let stored = orders
            .get_mut(&order.order_id)
            .ok_or_else(|| AppError::not_found("Sales not found"))?;

        let mut current = stored.lines.clone();
        apply_diff(&mut current, lines, |l| l.line_id);
        *stored = Order {
            lines: current,
            updated_utc: Utc::now(),
            ..order.clone()
        };
        Ok(stored.clone())
    }

    async fn find_return(&self, return_id: Uuid) -> Result<Option<SalesReturn>, AppError> {
        Ok(self.returns.lock().unwrap().get(&return_id).cloned())
    }

    async fn line_balances(
        &self,
        _tenant_id: Uuid,
        order_id: Uuid,
        exclude_return: Option<Uuid>,
    ) -> Result<Vec<LineBalance>, AppError> {
        Ok(self.balances(order_id, exclude_return))
    }

    async fn allocated_discount(
        &self,
        tenant_id: Uuid,
        order_id: Uuid,
        exclude_return: Option<Uuid>,
    ) -> Result<Decimal, AppError> {
        Ok(self
            .returns
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.order_id == order_id)
            .filter(|r| Some(r.return_id) != exclude_return)
            .map(|r| r.discount_amount)
            .sum())
    }

    async fn create_return(&self, sales_return: &SalesReturn) -> Result<SalesReturn, AppError> {
        let outstanding = remaining(&self.balances(sales_return.order_id, None));
        check_allocation(
            &outstanding,
            sales_return.lines.iter().map(|l| (l.product_id, l.quantity)),
        )?;

        let mut created = sales_return.clone();
        created.code = self.next_code("DR");
        self.returns
            .lock()
            .unwrap()
            .insert(created.return_id, created.clone());
        Ok(created)
    }

    async fn apply_return_changes(
        &self,
        sales_return: &SalesReturn,
        lines: &LineDiff<ReturnLine>,
    ) -> Result<SalesReturn, AppError> {
        let outstanding = remaining(&self.balances(sales_return.order_id, Some(sales_return.return_id)));
        check_allocation(
            &outstanding,
            sales_return.lines.iter().map(|l| (l.product_id, l.quantity)),
        )?;

        let mut returns = self.returns.lock().unwrap();
        let stored = returns
            .get_mut(&sales_return.return_id)
            .ok_or_else(|| AppError::not_found("Sales return not found"))?;

        let mut current = stored.lines.clone();
        apply_diff(&mut current, lines, |l| l.line_id);
        *stored = SalesReturn {
            lines: current,
            updated_utc: Utc::now(),
            ..sales_return.clone()
        };
        Ok(stored.clone())
    }
}

/// Wires the coordinators over in-memory doubles for one tenant with one
/// branch, one customer, one salesman and three products priced 100, 25
/// and 10.
pub(crate) struct Harness {
    pub tenant_id: Uuid,
    pub branch_id: Uuid,
    pub customer_id: Uuid,
    pub salesman_id: Uuid,
    pub product_a: Uuid,
    pub product_b: Uuid,
    pub product_c: Uuid,
    pub caller: CallerContext,
    pub repo: Arc<FakeRepository>,
    pub directory: Arc<FakeDirectory>,
    pub catalog: Arc<FakeCatalog>,
    pub fulfillment: Arc<FakeFulfillment>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let tenant_id = Uuid::new_v4();
        let branch_id = Uuid::new_v4();
        let customer_id = Uuid::new_v4();
        let salesman_id = Uuid::new_v4();
        let (product_a, product_b, product_c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let repo = FakeRepository {
            customers: HashSet::from([(tenant_id, customer_id)]),
            salesmen: HashSet::from([(tenant_id, salesman_id)]),
            ..Default::default()
        };

        Self {
            tenant_id,
            branch_id,
            customer_id,
            salesman_id,
            product_a,
            product_b,
            product_c,
            caller: CallerContext::tenant_wide(tenant_id, "user-1"),
            repo: Arc::new(repo),
            directory: Arc::new(FakeDirectory::with_branches(&[branch_id])),
            catalog: Arc::new(FakeCatalog::with(&[
                (product_a, dec!(100)),
                (product_b, dec!(25)),
                (product_c, dec!(10)),
            ])),
            fulfillment: Arc::new(FakeFulfillment::default()),
        }
    }

    pub(crate) fn branch_name(&self) -> String {
        format!("Branch {}", &self.branch_id.to_string()[..4])
    }

    fn access(&self) -> AccessScopeResolver {
        AccessScopeResolver::new(self.directory.clone())
    }

    fn delivery(&self) -> DeliveryStateGuard {
        DeliveryStateGuard::new(self.fulfillment.clone())
    }

    pub(crate) fn ledger(&self) -> OutstandingLedger {
        OutstandingLedger::new(self.repo.clone())
    }

    pub(crate) fn orders(&self) -> OrderTransactionCoordinator {
        OrderTransactionCoordinator::new(
            self.repo.clone(),
            self.access(),
            CatalogValidator::new(self.catalog.clone()),
            self.delivery(),
        )
    }

    pub(crate) fn returns(&self) -> ReturnAllocationEngine {
        ReturnAllocationEngine::new(
            self.repo.clone(),
            self.orders(),
            self.access(),
            self.delivery(),
            self.ledger(),
        )
    }

    pub(crate) fn order_input(&self, lines: Vec<NewOrderLine>) -> CreateOrderInput {
        CreateOrderInput {
            branch_id: self.branch_id,
            customer_id: self.customer_id,
            salesman_id: self.salesman_id,
            order_date: NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
            remark: "counter sale".to_string(),
            discount_amount: Decimal::ZERO,
            discount_percentage: Decimal::ZERO,
            lines,
        }
    }

    pub(crate) async fn order_with(&self, items: &[(Uuid, i32)]) -> Order {
        self.order_with_discount(items, Decimal::ZERO, Decimal::ZERO)
            .await
    }

    pub(crate) async fn order_with_discount(
        &self,
        items: &[(Uuid, i32)],
        discount_amount: Decimal,
        discount_percentage: Decimal,
    ) -> Order {
        let lines = items
            .iter()
            .map(|(product_id, quantity)| NewOrderLine {
                product_id: *product_id,
                quantity: *quantity,
                unit_price: None,
                discount_amount: Decimal::ZERO,
                discount_percentage: Decimal::ZERO,
            })
            .collect();
        let mut input = self.order_input(lines);
        input.discount_amount = discount_amount;
        input.discount_percentage = discount_percentage;

        self.orders().create(&self.caller, input).await.unwrap()
    }

    pub(crate) fn return_input(&self, order: &Order, lines: Vec<ReturnLineChange>) -> CreateReturnInput {
        CreateReturnInput {
            branch_id: order.branch_id,
            order_id: order.order_id,
            return_date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            remark: "damaged".to_string(),
            lines,
        }
    }

    pub(crate) async fn return_of(&self, order: &Order, items: &[(Uuid, i32)]) -> SalesReturn {
        let lines = items
            .iter()
            .map(|(product_id, quantity)| ReturnLineChange {
                line_id: None,
                product_id: *product_id,
                quantity: *quantity,
            })
            .collect();
        self.returns()
            .create(&self.caller, self.return_input(order, lines))
            .await
            .unwrap()
    }
}
