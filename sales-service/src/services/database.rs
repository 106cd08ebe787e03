//! Database service for sales-service.

use crate::models::{
    Customer, LineBalance, LineDiff, NewParty, Order, OrderLine, PartyPatch, ReturnLine,
    SalesReturn, Salesman,
};
use crate::services::ledger::{check_allocation, remaining};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::ports::SalesRepository;
use crate::services::query::{
    ListQuery, CUSTOMER_COLUMNS, ORDER_COLUMNS, RETURN_COLUMNS, SALESMAN_COLUMNS,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgExecutor};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const ORDER_PREFIX: &str = "DO";
const RETURN_PREFIX: &str = "DR";

const ORDER_LINE_COLUMNS: &str = "line_id, order_id, product_id, product_code, product_name, unit_price, discount_amount, discount_percentage, quantity, total_price";
const RETURN_LINE_COLUMNS: &str = "line_id, return_id, product_id, product_code, product_name, unit_price, discount_amount, discount_percentage, quantity, total_price";

/// Document kinds sharing the monthly code scheme.
#[derive(Debug, Clone, Copy)]
enum DocumentKind {
    Order,
    Return,
}

impl DocumentKind {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Order => ORDER_PREFIX,
            Self::Return => RETURN_PREFIX,
        }
    }

    fn table(&self) -> &'static str {
        match self {
            Self::Order => "orders",
            Self::Return => "sales_returns",
        }
    }

    fn code_constraint(&self) -> &'static str {
        match self {
            Self::Order => "uq_orders_tenant_code",
            Self::Return => "uq_sales_returns_tenant_code",
        }
    }
}

/// Error from a document insert attempt: either the generated code was
/// already taken, or anything else.
enum InsertError {
    CodeTaken,
    App(AppError),
}

impl From<AppError> for InsertError {
    fn from(e: AppError) -> Self {
        InsertError::App(e)
    }
}

/// `<prefix><yyyy><mm><sequence>`; the month is zero padded so codes of
/// different months never collide.
pub fn document_code(prefix: &str, period: &str, sequence: i64) -> String {
    format!("{}{}{}", prefix, period, sequence)
}

fn current_period() -> String {
    Utc::now().format("%Y%m").to_string()
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "sales-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// Count the matching rows, then stream them through a bounded channel.
    ///
    /// The producer stops as soon as the receiver is dropped, so a cancelled
    /// client does not drain the whole result set.
    #[instrument(skip(self, query))]
    pub async fn list<T>(
        &self,
        query: ListQuery,
        operation: &'static str,
    ) -> Result<(i64, mpsc::Receiver<Result<T, AppError>>), AppError>
    where
        T: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin + 'static,
    {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let count = query
            .count_query()
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to count {}: {}", operation, e)))?;

        timer.observe_duration();

        let (tx, rx) = mpsc::channel(32);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let mut builder = query.rows_query();
            let mut rows = builder.build_query_as::<T>().fetch(&pool);

            while let Some(row) = rows.next().await {
                let item = row.map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to read {}: {}", operation, e))
                });
                let failed = item.is_err();
                if tx.send(item).await.is_err() {
                    debug!(operation = operation, "List receiver dropped, stopping");
                    break;
                }
                if failed {
                    break;
                }
            }
        });

        Ok((count, rx))
    }

    // =========================================================================
    // Customers
    // =========================================================================

    #[instrument(skip(self, party), fields(tenant_id = %tenant_id, code = %party.code))]
    pub async fn create_customer(
        &self,
        tenant_id: Uuid,
        party: &NewParty,
        actor: &str,
    ) -> Result<Customer, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_customer"])
            .start_timer();

        let sql = format!(
            r#"
            INSERT INTO customers (customer_id, tenant_id, code, name, address, phone, created_by, updated_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING {}
            "#,
            CUSTOMER_COLUMNS
        );

        let customer = sqlx::query_as::<_, Customer>(&sql)
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(&party.code)
            .bind(&party.name)
            .bind(&party.address)
            .bind(&party.phone)
            .bind(actor)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    AppError::Conflict(anyhow::anyhow!("Customer code '{}' already exists", party.code))
                }
                _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create customer: {}", e)),
            })?;

        timer.observe_duration();
        info!(customer_id = %customer.customer_id, code = %customer.code, "Customer created");

        Ok(customer)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, customer_id = %customer_id))]
    pub async fn get_customer(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_customer"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM customers WHERE tenant_id = $1 AND customer_id = $2",
            CUSTOMER_COLUMNS
        );
        let customer = sqlx::query_as::<_, Customer>(&sql)
            .bind(tenant_id)
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get customer: {}", e)))?;

        timer.observe_duration();
        Ok(customer)
    }

    #[instrument(skip(self, patch), fields(tenant_id = %tenant_id, customer_id = %customer_id))]
    pub async fn update_customer(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        patch: &PartyPatch,
        actor: &str,
    ) -> Result<Option<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_customer"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE customers
            SET name = COALESCE($3, name),
                address = COALESCE($4, address),
                phone = COALESCE($5, phone),
                updated_by = $6,
                updated_utc = NOW()
            WHERE tenant_id = $1 AND customer_id = $2
            RETURNING {}
            "#,
            CUSTOMER_COLUMNS
        );
        let customer = sqlx::query_as::<_, Customer>(&sql)
            .bind(tenant_id)
            .bind(customer_id)
            .bind(patch.name.as_deref())
            .bind(patch.address.as_deref())
            .bind(patch.phone.as_deref())
            .bind(actor)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update customer: {}", e)))?;

        timer.observe_duration();
        Ok(customer)
    }

    /// Delete a customer. Customers referenced by orders cannot be deleted.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, customer_id = %customer_id))]
    pub async fn delete_customer(&self, tenant_id: Uuid, customer_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_customer"])
            .start_timer();

        let result = sqlx::query("DELETE FROM customers WHERE tenant_id = $1 AND customer_id = $2")
            .bind(tenant_id)
            .bind(customer_id)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                    AppError::failed_precondition("Customer has sales transaction")
                }
                _ => AppError::DatabaseError(anyhow::anyhow!("Failed to delete customer: {}", e)),
            })?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Salesmen
    // =========================================================================

    #[instrument(skip(self, party), fields(tenant_id = %tenant_id, code = %party.code))]
    pub async fn create_salesman(
        &self,
        tenant_id: Uuid,
        party: &NewParty,
        actor: &str,
    ) -> Result<Salesman, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_salesman"])
            .start_timer();

        let sql = format!(
            r#"
            INSERT INTO salesmen (salesman_id, tenant_id, code, name, email, address, phone, created_by, updated_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING {}
            "#,
            SALESMAN_COLUMNS
        );

        let salesman = sqlx::query_as::<_, Salesman>(&sql)
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(&party.code)
            .bind(&party.name)
            .bind(&party.email)
            .bind(&party.address)
            .bind(&party.phone)
            .bind(actor)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    AppError::Conflict(anyhow::anyhow!("Salesman code '{}' already exists", party.code))
                }
                _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create salesman: {}", e)),
            })?;

        timer.observe_duration();
        info!(salesman_id = %salesman.salesman_id, code = %salesman.code, "Salesman created");

        Ok(salesman)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, salesman_id = %salesman_id))]
    pub async fn get_salesman(
        &self,
        tenant_id: Uuid,
        salesman_id: Uuid,
    ) -> Result<Option<Salesman>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_salesman"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM salesmen WHERE tenant_id = $1 AND salesman_id = $2",
            SALESMAN_COLUMNS
        );
        let salesman = sqlx::query_as::<_, Salesman>(&sql)
            .bind(tenant_id)
            .bind(salesman_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get salesman: {}", e)))?;

        timer.observe_duration();
        Ok(salesman)
    }

    #[instrument(skip(self, patch), fields(tenant_id = %tenant_id, salesman_id = %salesman_id))]
    pub async fn update_salesman(
        &self,
        tenant_id: Uuid,
        salesman_id: Uuid,
        patch: &PartyPatch,
        actor: &str,
    ) -> Result<Option<Salesman>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_salesman"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE salesmen
            SET name = COALESCE($3, name),
                email = COALESCE($4, email),
                address = COALESCE($5, address),
                phone = COALESCE($6, phone),
                updated_by = $7,
                updated_utc = NOW()
            WHERE tenant_id = $1 AND salesman_id = $2
            RETURNING {}
            "#,
            SALESMAN_COLUMNS
        );
        let salesman = sqlx::query_as::<_, Salesman>(&sql)
            .bind(tenant_id)
            .bind(salesman_id)
            .bind(patch.name.as_deref())
            .bind(patch.email.as_deref())
            .bind(patch.address.as_deref())
            .bind(patch.phone.as_deref())
            .bind(actor)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update salesman: {}", e)))?;

        timer.observe_duration();
        Ok(salesman)
    }

    /// Delete a salesman. Salesmen referenced by orders cannot be deleted.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, salesman_id = %salesman_id))]
    pub async fn delete_salesman(&self, tenant_id: Uuid, salesman_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_salesman"])
            .start_timer();

        let result = sqlx::query("DELETE FROM salesmen WHERE tenant_id = $1 AND salesman_id = $2")
            .bind(tenant_id)
            .bind(salesman_id)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                    AppError::failed_precondition("Salesman has sales transaction")
                }
                _ => AppError::DatabaseError(anyhow::anyhow!("Failed to delete salesman: {}", e)),
            })?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Document codes
    // =========================================================================

    /// Next sequence number for `(tenant, prefix, period)`, at least `floor`.
    async fn next_sequence(
        conn: &mut PgConnection,
        tenant_id: Uuid,
        kind: DocumentKind,
        period: &str,
        floor: i64,
    ) -> Result<i64, AppError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO document_sequences (tenant_id, prefix, period, last_value)
            VALUES ($1, $2, $3, GREATEST(1, $4))
            ON CONFLICT (tenant_id, prefix, period)
            DO UPDATE SET last_value = GREATEST(document_sequences.last_value + 1, $4)
            RETURNING last_value
            "#,
        )
        .bind(tenant_id)
        .bind(kind.prefix())
        .bind(period)
        .bind(floor)
        .fetch_one(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to allocate document code: {}", e)))
    }

    /// Highest sequence already used by a stored code of the period, plus one.
    /// Used to move the counter past codes it did not hand out itself.
    async fn sequence_floor(
        &self,
        tenant_id: Uuid,
        kind: DocumentKind,
        period: &str,
    ) -> Result<i64, AppError> {
        let stem = format!("{}{}", kind.prefix(), period);
        let sql = format!(
            "SELECT COALESCE(MAX(CAST(SUBSTRING(code FROM $3) AS BIGINT)), 0) FROM {} WHERE tenant_id = $1 AND code LIKE $2",
            kind.table()
        );

        let max = sqlx::query_scalar::<_, i64>(&sql)
            .bind(tenant_id)
            .bind(format!("{}%", stem))
            .bind(stem.len() as i32 + 1)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to read document codes: {}", e)))?;

        Ok(max + 1)
    }

    // =========================================================================
    // Orders
    // =========================================================================

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_order"])
            .start_timer();

        let sql = format!("SELECT {} FROM orders WHERE order_id = $1", ORDER_COLUMNS);
        let order = sqlx::query_as::<_, Order>(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get order: {}", e)))?;

        let order = match order {
            Some(mut order) => {
                order.lines = fetch_order_lines(&self.pool, order_id).await?;
                Some(order)
            }
            None => None,
        };

        timer.observe_duration();
        Ok(order)
    }

    #[instrument(skip(self, order), fields(tenant_id = %order.tenant_id, order_id = %order.order_id))]
    pub async fn create_order(&self, order: &Order) -> Result<Order, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_order"])
            .start_timer();

        let period = current_period();
        let mut floor = 0;
        let mut retried = false;

        let created = loop {
            match self.insert_order(order, &period, floor).await {
                Ok(created) => break created,
                Err(InsertError::CodeTaken) if !retried => {
                    retried = true;
                    floor = self
                        .sequence_floor(order.tenant_id, DocumentKind::Order, &period)
                        .await?;
                    warn!(period = %period, floor = floor, "Order code collision, retrying");
                }
                Err(InsertError::CodeTaken) => {
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Order code already exists"
                    )));
                }
                Err(InsertError::App(e)) => return Err(e),
            }
        };

        timer.observe_duration();
        info!(order_id = %created.order_id, code = %created.code, lines = created.lines.len(), "Order created");

        Ok(created)
    }

    async fn insert_order(&self, order: &Order, period: &str, floor: i64) -> Result<Order, InsertError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let sequence =
            Self::next_sequence(&mut tx, order.tenant_id, DocumentKind::Order, period, floor).await?;
        let code = document_code(ORDER_PREFIX, period, sequence);

        let sql = format!(
            r#"
            INSERT INTO orders (order_id, tenant_id, branch_id, branch_name, customer_id, salesman_id, code, order_date, remark,
                                price, discount_amount, discount_percentage, total_price, created_by, updated_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );

        let result = sqlx::query_as::<_, Order>(&sql)
            .bind(order.order_id)
            .bind(order.tenant_id)
            .bind(order.branch_id)
            .bind(&order.branch_name)
            .bind(order.customer_id)
            .bind(order.salesman_id)
            .bind(&code)
            .bind(order.order_date)
            .bind(&order.remark)
            .bind(order.price)
            .bind(order.discount_amount)
            .bind(order.discount_percentage)
            .bind(order.total_price)
            .bind(&order.created_by)
            .fetch_one(&mut *tx)
            .await;

        let mut created = match result {
            Ok(created) => created,
            Err(sqlx::Error::Database(ref db_err))
                if db_err.constraint() == Some(DocumentKind::Order.code_constraint()) =>
            {
                tx.rollback().await.ok();
                return Err(InsertError::CodeTaken);
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!("Failed to create order: {}", e)).into());
            }
        };

        for line in &order.lines {
            insert_order_line(&mut tx, created.order_id, line).await?;
        }

        created.lines = fetch_order_lines(&mut *tx, created.order_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        Ok(created)
    }

    #[instrument(skip(self, order, lines), fields(tenant_id = %order.tenant_id, order_id = %order.order_id))]
    pub async fn apply_order_changes(
        &self,
        order: &Order,
        lines: &LineDiff<OrderLine>,
    ) -> Result<Order, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_order"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        lock_order(&mut tx, order.tenant_id, order.order_id).await?;

        // A return may have been written since the gate was checked.
        let has_return = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM sales_returns WHERE order_id = $1)",
        )
        .bind(order.order_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check returns: {}", e)))?;

        if has_return {
            return Err(AppError::forbidden(
                "Can not updated because the sales has return transaction",
            ));
        }

        if !lines.deleted.is_empty() {
            sqlx::query("DELETE FROM order_lines WHERE order_id = $1 AND line_id = ANY($2)")
                .bind(order.order_id)
                .bind(&lines.deleted)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to delete order lines: {}", e)))?;
        }

        for line in &lines.updated {
            sqlx::query(
                r#"
                UPDATE order_lines
                SET product_id = $3, product_code = $4, product_name = $5,
                    unit_price = $6, discount_amount = $7, discount_percentage = $8, quantity = $9, total_price = $10
                WHERE order_id = $1 AND line_id = $2
                "#,
            )
            .bind(order.order_id)
            .bind(line.line_id)
            .bind(line.product_id)
            .bind(&line.product_code)
            .bind(&line.product_name)
            .bind(line.unit_price)
            .bind(line.discount_amount)
            .bind(line.discount_percentage)
            .bind(line.quantity)
            .bind(line.total_price)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update order line: {}", e)))?;
        }

        for line in &lines.inserted {
            insert_order_line(&mut tx, order.order_id, line).await?;
        }

        let sql = format!(
            r#"
            UPDATE orders
            SET customer_id = $3, salesman_id = $4, order_date = $5, remark = $6,
                price = $7, discount_amount = $8, discount_percentage = $9, total_price = $10,
                updated_by = $11, updated_utc = NOW()
            WHERE tenant_id = $1 AND order_id = $2
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );

        let mut updated = sqlx::query_as::<_, Order>(&sql)
            .bind(order.tenant_id)
            .bind(order.order_id)
            .bind(order.customer_id)
            .bind(order.salesman_id)
            .bind(order.order_date)
            .bind(&order.remark)
            .bind(order.price)
            .bind(order.discount_amount)
            .bind(order.discount_percentage)
            .bind(order.total_price)
            .bind(&order.updated_by)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update order: {}", e)))?;

        updated.lines = fetch_order_lines(&mut *tx, order.order_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            order_id = %updated.order_id,
            updated_lines = lines.updated.len(),
            inserted_lines = lines.inserted.len(),
            deleted_lines = lines.deleted.len(),
            "Order updated"
        );

        Ok(updated)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, order_id = %order_id))]
    pub async fn has_return(&self, tenant_id: Uuid, order_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["has_return"])
            .start_timer();

        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM sales_returns WHERE tenant_id = $1 AND order_id = $2)",
        )
        .bind(tenant_id)
        .bind(order_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check returns: {}", e)))?;

        timer.observe_duration();
        Ok(exists)
    }

    async fn party_exists(&self, table: &str, id_column: &str, tenant_id: Uuid, id: Uuid) -> Result<bool, AppError> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE tenant_id = $1 AND {} = $2)",
            table, id_column
        );
        sqlx::query_scalar::<_, bool>(&sql)
            .bind(tenant_id)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to look up {}: {}", table, e)))
    }

    // =========================================================================
    // Returns
    // =========================================================================

    #[instrument(skip(self), fields(return_id = %return_id))]
    pub async fn find_return(&self, return_id: Uuid) -> Result<Option<SalesReturn>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_return"])
            .start_timer();

        let sql = format!("SELECT {} FROM sales_returns WHERE return_id = $1", RETURN_COLUMNS);
        let found = sqlx::query_as::<_, SalesReturn>(&sql)
            .bind(return_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get return: {}", e)))?;

        let found = match found {
            Some(mut sales_return) => {
                sales_return.lines = fetch_return_lines(&self.pool, return_id).await?;
                Some(sales_return)
            }
            None => None,
        };

        timer.observe_duration();
        Ok(found)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, order_id = %order_id))]
    pub async fn line_balances(
        &self,
        tenant_id: Uuid,
        order_id: Uuid,
        exclude_return: Option<Uuid>,
    ) -> Result<Vec<LineBalance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["line_balances"])
            .start_timer();

        let balances = fetch_line_balances(&self.pool, tenant_id, order_id, exclude_return).await?;

        timer.observe_duration();
        Ok(balances)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, order_id = %order_id))]
    pub async fn allocated_discount(
        &self,
        tenant_id: Uuid,
        order_id: Uuid,
        exclude_return: Option<Uuid>,
    ) -> Result<Decimal, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["allocated_discount"])
            .start_timer();

        let allocated = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(SUM(discount_amount), 0)
            FROM sales_returns
            WHERE tenant_id = $1 AND order_id = $2 AND ($3::UUID IS NULL OR return_id <> $3)
            "#,
        )
        .bind(tenant_id)
        .bind(order_id)
        .bind(exclude_return)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to sum allocated discount: {}", e)))?;

        timer.observe_duration();
        Ok(allocated)
    }

    #[instrument(skip(self, sales_return), fields(tenant_id = %sales_return.tenant_id, order_id = %sales_return.order_id))]
    pub async fn create_return(&self, sales_return: &SalesReturn) -> Result<SalesReturn, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_return"])
            .start_timer();

        let period = current_period();
        let mut floor = 0;
        let mut retried = false;

        let created = loop {
            match self.insert_return(sales_return, &period, floor).await {
                Ok(created) => break created,
                Err(InsertError::CodeTaken) if !retried => {
                    retried = true;
                    floor = self
                        .sequence_floor(sales_return.tenant_id, DocumentKind::Return, &period)
                        .await?;
                    warn!(period = %period, floor = floor, "Return code collision, retrying");
                }
                Err(InsertError::CodeTaken) => {
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Return code already exists"
                    )));
                }
                Err(InsertError::App(e)) => return Err(e),
            }
        };

        timer.observe_duration();
        info!(return_id = %created.return_id, code = %created.code, lines = created.lines.len(), "Return created");

        Ok(created)
    }

    async fn insert_return(
        &self,
        sales_return: &SalesReturn,
        period: &str,
        floor: i64,
    ) -> Result<SalesReturn, InsertError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        lock_order(&mut tx, sales_return.tenant_id, sales_return.order_id).await?;
        recheck_outstanding(&mut tx, sales_return, None).await?;

        let sequence = Self::next_sequence(
            &mut tx,
            sales_return.tenant_id,
            DocumentKind::Return,
            period,
            floor,
        )
        .await?;
        let code = document_code(RETURN_PREFIX, period, sequence);

        let sql = format!(
            r#"
            INSERT INTO sales_returns (return_id, tenant_id, branch_id, branch_name, order_id, code, return_date, remark,
                                       price, discount_amount, discount_percentage, total_price, created_by, updated_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            RETURNING {}
            "#,
            RETURN_COLUMNS
        );

        let result = sqlx::query_as::<_, SalesReturn>(&sql)
            .bind(sales_return.return_id)
            .bind(sales_return.tenant_id)
            .bind(sales_return.branch_id)
            .bind(&sales_return.branch_name)
            .bind(sales_return.order_id)
            .bind(&code)
            .bind(sales_return.return_date)
            .bind(&sales_return.remark)
            .bind(sales_return.price)
            .bind(sales_return.discount_amount)
            .bind(sales_return.discount_percentage)
            .bind(sales_return.total_price)
            .bind(&sales_return.created_by)
            .fetch_one(&mut *tx)
            .await;

        let mut created = match result {
            Ok(created) => created,
            Err(sqlx::Error::Database(ref db_err))
                if db_err.constraint() == Some(DocumentKind::Return.code_constraint()) =>
            {
                tx.rollback().await.ok();
                return Err(InsertError::CodeTaken);
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!("Failed to create return: {}", e)).into());
            }
        };

        for line in &sales_return.lines {
            insert_return_line(&mut tx, created.return_id, line).await?;
        }

        created.lines = fetch_return_lines(&mut *tx, created.return_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        Ok(created)
    }

    #[instrument(skip(self, sales_return, lines), fields(tenant_id = %sales_return.tenant_id, return_id = %sales_return.return_id))]
    pub async fn apply_return_changes(
        &self,
        sales_return: &SalesReturn,
        lines: &LineDiff<ReturnLine>,
    ) -> Result<SalesReturn, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_return"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        lock_order(&mut tx, sales_return.tenant_id, sales_return.order_id).await?;
        recheck_outstanding(&mut tx, sales_return, Some(sales_return.return_id)).await?;

        if !lines.deleted.is_empty() {
            sqlx::query("DELETE FROM return_lines WHERE return_id = $1 AND line_id = ANY($2)")
                .bind(sales_return.return_id)
                .bind(&lines.deleted)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to delete return lines: {}", e)))?;
        }

        for line in &lines.updated {
            sqlx::query(
                "UPDATE return_lines SET quantity = $3, total_price = $4 WHERE return_id = $1 AND line_id = $2",
            )
            .bind(sales_return.return_id)
            .bind(line.line_id)
            .bind(line.quantity)
            .bind(line.total_price)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update return line: {}", e)))?;
        }

        for line in &lines.inserted {
            insert_return_line(&mut tx, sales_return.return_id, line).await?;
        }

        let sql = format!(
            r#"
            UPDATE sales_returns
            SET return_date = $3, remark = $4,
                price = $5, discount_amount = $6, discount_percentage = $7, total_price = $8,
                updated_by = $9, updated_utc = NOW()
            WHERE tenant_id = $1 AND return_id = $2
            RETURNING {}
            "#,
            RETURN_COLUMNS
        );

        let mut updated = sqlx::query_as::<_, SalesReturn>(&sql)
            .bind(sales_return.tenant_id)
            .bind(sales_return.return_id)
            .bind(sales_return.return_date)
            .bind(&sales_return.remark)
            .bind(sales_return.price)
            .bind(sales_return.discount_amount)
            .bind(sales_return.discount_percentage)
            .bind(sales_return.total_price)
            .bind(&sales_return.updated_by)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update return: {}", e)))?;

        updated.lines = fetch_return_lines(&mut *tx, sales_return.return_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            return_id = %updated.return_id,
            updated_lines = lines.updated.len(),
            inserted_lines = lines.inserted.len(),
            deleted_lines = lines.deleted.len(),
            "Return updated"
        );

        Ok(updated)
    }
}

// =============================================================================
// Statement helpers shared by pool and transaction callers
// =============================================================================

/// Take the row lock that serializes return writes and order edits.
async fn lock_order(conn: &mut PgConnection, tenant_id: Uuid, order_id: Uuid) -> Result<(), AppError> {
    sqlx::query_scalar::<_, Uuid>(
        "SELECT order_id FROM orders WHERE tenant_id = $1 AND order_id = $2 FOR UPDATE",
    )
    .bind(tenant_id)
    .bind(order_id)
    .fetch_optional(conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock order: {}", e)))?
    .map(|_| ())
    .ok_or_else(|| AppError::not_found("Sales not found"))
}

/// Validate the final return lines against quantities read under the lock.
async fn recheck_outstanding(
    conn: &mut PgConnection,
    sales_return: &SalesReturn,
    exclude_return: Option<Uuid>,
) -> Result<(), AppError> {
    let balances = fetch_line_balances(
        &mut *conn,
        sales_return.tenant_id,
        sales_return.order_id,
        exclude_return,
    )
    .await?;
    let outstanding = remaining(&balances);

    if exclude_return.is_none() && outstanding.is_empty() {
        return Err(AppError::failed_precondition("Sales has been returned"));
    }

    check_allocation(
        &outstanding,
        sales_return.lines.iter().map(|l| (l.product_id, l.quantity)),
    )
}

async fn fetch_line_balances<'e, E: PgExecutor<'e>>(
    executor: E,
    tenant_id: Uuid,
    order_id: Uuid,
    exclude_return: Option<Uuid>,
) -> Result<Vec<LineBalance>, AppError> {
    sqlx::query_as::<_, LineBalance>(
        r#"
        SELECT ol.product_id,
               ol.quantity::BIGINT AS ordered,
               COALESCE(SUM(rl.quantity), 0)::BIGINT AS returned
        FROM order_lines ol
        JOIN orders o ON o.order_id = ol.order_id
        LEFT JOIN sales_returns sr
               ON sr.order_id = ol.order_id AND ($3::UUID IS NULL OR sr.return_id <> $3)
        LEFT JOIN return_lines rl
               ON rl.return_id = sr.return_id AND rl.product_id = ol.product_id
        WHERE ol.order_id = $2 AND o.tenant_id = $1
        GROUP BY ol.product_id, ol.quantity
        "#,
    )
    .bind(tenant_id)
    .bind(order_id)
    .bind(exclude_return)
    .fetch_all(executor)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to compute outstanding: {}", e)))
}

async fn fetch_order_lines<'e, E: PgExecutor<'e>>(executor: E, order_id: Uuid) -> Result<Vec<OrderLine>, AppError> {
    let sql = format!(
        "SELECT {} FROM order_lines WHERE order_id = $1 ORDER BY created_utc, line_id",
        ORDER_LINE_COLUMNS
    );
    sqlx::query_as::<_, OrderLine>(&sql)
        .bind(order_id)
        .fetch_all(executor)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get order lines: {}", e)))
}

async fn fetch_return_lines<'e, E: PgExecutor<'e>>(
    executor: E,
    return_id: Uuid,
) -> Result<Vec<ReturnLine>, AppError> {
    let sql = format!(
        "SELECT {} FROM return_lines WHERE return_id = $1 ORDER BY created_utc, line_id",
        RETURN_LINE_COLUMNS
    );
    sqlx::query_as::<_, ReturnLine>(&sql)
        .bind(return_id)
        .fetch_all(executor)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get return lines: {}", e)))
}

async fn insert_order_line(conn: &mut PgConnection, order_id: Uuid, line: &OrderLine) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO order_lines (line_id, order_id, product_id, product_code, product_name,
                                 unit_price, discount_amount, discount_percentage, quantity, total_price)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(line.line_id)
    .bind(order_id)
    .bind(line.product_id)
    .bind(&line.product_code)
    .bind(&line.product_name)
    .bind(line.unit_price)
    .bind(line.discount_amount)
    .bind(line.discount_percentage)
    .bind(line.quantity)
    .bind(line.total_price)
    .execute(conn)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            AppError::bad_request("Please supply valid product")
        }
        _ => AppError::DatabaseError(anyhow::anyhow!("Failed to insert order line: {}", e)),
    })?;
    Ok(())
}

async fn insert_return_line(conn: &mut PgConnection, return_id: Uuid, line: &ReturnLine) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO return_lines (line_id, return_id, product_id, product_code, product_name,
                                  unit_price, discount_amount, discount_percentage, quantity, total_price)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(line.line_id)
    .bind(return_id)
    .bind(line.product_id)
    .bind(&line.product_code)
    .bind(&line.product_name)
    .bind(line.unit_price)
    .bind(line.discount_amount)
    .bind(line.discount_percentage)
    .bind(line.quantity)
    .bind(line.total_price)
    .execute(conn)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            AppError::bad_request("Please supply valid outstanding product")
        }
        _ => AppError::DatabaseError(anyhow::anyhow!("Failed to insert return line: {}", e)),
    })?;
    Ok(())
}

#[async_trait]
impl SalesRepository for Database {
    async fn customer_exists(&self, tenant_id: Uuid, customer_id: Uuid) -> Result<bool, AppError> {
        self.party_exists("customers", "customer_id", tenant_id, customer_id)
            .await
    }

    async fn salesman_exists(&self, tenant_id: Uuid, salesman_id: Uuid) -> Result<bool, AppError> {
        self.party_exists("salesmen", "salesman_id", tenant_id, salesman_id)
            .await
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>, AppError> {
        Database::find_order(self, order_id).await
    }

    async fn has_return(&self, tenant_id: Uuid, order_id: Uuid) -> Result<bool, AppError> {
        Database::has_return(self, tenant_id, order_id).await
    }

    async fn create_order(&self, order: &Order) -> Result<Order, AppError> {
        Database::create_order(self, order).await
    }

    async fn apply_order_changes(
        &self,
        order: &Order,
        lines: &LineDiff<OrderLine>,
    ) -> Result<Order, AppError> {
        Database::apply_order_changes(self, order, lines).await
    }

    async fn find_return(&self, return_id: Uuid) -> Result<Option<SalesReturn>, AppError> {
        Database::find_return(self, return_id).await
    }

    async fn line_balances(
        &self,
        tenant_id: Uuid,
        order_id: Uuid,
        exclude_return: Option<Uuid>,
    ) -> Result<Vec<LineBalance>, AppError> {
        Database::line_balances(self, tenant_id, order_id, exclude_return).await
    }

    async fn allocated_discount(
        &self,
        tenant_id: Uuid,
        order_id: Uuid,
        exclude_return: Option<Uuid>,
    ) -> Result<Decimal, AppError> {
        Database::allocated_discount(self, tenant_id, order_id, exclude_return).await
    }

    async fn create_return(&self, sales_return: &SalesReturn) -> Result<SalesReturn, AppError> {
        Database::create_return(self, sales_return).await
    }

    async fn apply_return_changes(
        &self,
        sales_return: &SalesReturn,
        lines: &LineDiff<ReturnLine>,
    ) -> Result<SalesReturn, AppError> {
        Database::apply_return_changes(self, sales_return, lines).await
    }
}
