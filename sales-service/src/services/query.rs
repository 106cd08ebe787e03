//! Tenant-scoped list queries.
//!
//! Every list is a count query plus a rows query sharing one filter set. The
//! tenant filter always comes first; optional filters are appended only when
//! supplied. Sort columns come from a fixed allowlist, never from the caller.

use crate::grpc::proto;
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

pub const ORDER_COLUMNS: &str = "order_id, tenant_id, branch_id, branch_name, customer_id, salesman_id, code, order_date, remark, price, discount_amount, discount_percentage, total_price, created_by, updated_by, created_utc, updated_utc";

pub const RETURN_COLUMNS: &str = "return_id, tenant_id, branch_id, branch_name, order_id, code, return_date, remark, price, discount_amount, discount_percentage, total_price, created_by, updated_by, created_utc, updated_utc";

pub const CUSTOMER_COLUMNS: &str =
    "customer_id, tenant_id, code, name, address, phone, created_by, updated_by, created_utc, updated_utc";

pub const SALESMAN_COLUMNS: &str = "salesman_id, tenant_id, code, name, email, address, phone, created_by, updated_by, created_utc, updated_utc";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortColumn {
    #[default]
    CreatedAt,
    Code,
}

impl SortColumn {
    /// Unknown names fall back to creation time.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "code" => Self::Code,
            _ => Self::CreatedAt,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_utc",
            Self::Code => "code",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    fn keyword(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Paging, search and ordering requested by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    pub limit: i64,
    pub offset: i64,
    pub search: Option<String>,
    pub sort: SortColumn,
    pub direction: SortDirection,
}

impl ListParams {
    pub fn from_proto(pagination: Option<&proto::Pagination>) -> Self {
        let Some(p) = pagination else {
            return Self::default();
        };

        let direction = match proto::SortDirection::try_from(p.direction) {
            Ok(proto::SortDirection::Asc) => SortDirection::Asc,
            _ => SortDirection::Desc,
        };

        Self {
            limit: i64::from(p.limit.max(0)),
            offset: i64::from(p.offset.max(0)),
            search: Some(p.search.trim().to_string()).filter(|s| !s.is_empty()),
            sort: SortColumn::parse(&p.sort_by),
            direction,
        }
    }
}

/// A list over one table: which columns to return, which to search, and the
/// equality filters in effect.
#[derive(Debug, Clone)]
pub struct ListQuery {
    table: &'static str,
    columns: &'static str,
    search_columns: &'static [&'static str],
    tenant_id: Uuid,
    filters: Vec<(&'static str, Uuid)>,
    params: ListParams,
}

impl ListQuery {
    fn new(
        table: &'static str,
        columns: &'static str,
        search_columns: &'static [&'static str],
        tenant_id: Uuid,
        params: ListParams,
    ) -> Self {
        Self {
            table,
            columns,
            search_columns,
            tenant_id,
            filters: Vec::new(),
            params,
        }
    }

    pub fn orders(tenant_id: Uuid, params: ListParams) -> Self {
        Self::new("orders", ORDER_COLUMNS, &["code", "remark"], tenant_id, params)
    }

    pub fn returns(tenant_id: Uuid, params: ListParams) -> Self {
        Self::new("sales_returns", RETURN_COLUMNS, &["code", "remark"], tenant_id, params)
    }

    pub fn customers(tenant_id: Uuid, params: ListParams) -> Self {
        Self::new(
            "customers",
            CUSTOMER_COLUMNS,
            &["code", "name", "address", "phone"],
            tenant_id,
            params,
        )
    }

    pub fn salesmen(tenant_id: Uuid, params: ListParams) -> Self {
        Self::new(
            "salesmen",
            SALESMAN_COLUMNS,
            &["code", "name", "email", "address", "phone"],
            tenant_id,
            params,
        )
    }

    /// Add `column = value` when a value is supplied.
    pub fn filter(mut self, column: &'static str, value: Option<Uuid>) -> Self {
        if let Some(value) = value {
            self.filters.push((column, value));
        }
        self
    }

    pub fn params(&self) -> &ListParams {
        &self.params
    }

    fn push_filters(&self, builder: &mut QueryBuilder<'static, Postgres>) {
        builder.push(" WHERE tenant_id = ");
        builder.push_bind(self.tenant_id);

        for (column, value) in &self.filters {
            builder.push(" AND ");
            builder.push(*column);
            builder.push(" = ");
            builder.push_bind(*value);
        }

        if let Some(search) = &self.params.search {
            let pattern = format!("%{}%", search);
            builder.push(" AND (");
            for (i, column) in self.search_columns.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                builder.push(*column);
                builder.push(" ILIKE ");
                builder.push_bind(pattern.clone());
            }
            builder.push(")");
        }
    }

    /// Total matching rows, independent of paging.
    pub fn count_query(&self) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM ");
        builder.push(self.table);
        self.push_filters(&mut builder);
        builder
    }

    pub fn rows_query(&self) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new("SELECT ");
        builder.push(self.columns);
        builder.push(" FROM ");
        builder.push(self.table);
        self.push_filters(&mut builder);

        builder.push(" ORDER BY ");
        builder.push(self.params.sort.column());
        builder.push(" ");
        builder.push(self.params.direction.keyword());

        if self.params.limit > 0 {
            builder.push(" LIMIT ");
            builder.push_bind(self.params.limit);
            builder.push(" OFFSET ");
            builder.push_bind(self.params.offset);
        }
        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(limit: i32, search: &str, sort_by: &str, direction: proto::SortDirection) -> ListParams {
        ListParams::from_proto(Some(&proto::Pagination {
            limit,
            offset: 20,
            search: search.to_string(),
            sort_by: sort_by.to_string(),
            direction: direction as i32,
        }))
    }

    #[test]
    fn test_defaults_without_pagination() {
        let p = ListParams::from_proto(None);
        assert_eq!(p.limit, 0);
        assert_eq!(p.sort, SortColumn::CreatedAt);
        assert_eq!(p.direction, SortDirection::Desc);
    }

    #[test]
    fn test_orders_minimal_query() {
        let query = ListQuery::orders(Uuid::new_v4(), ListParams::default());
        assert_eq!(
            query.count_query().sql(),
            "SELECT COUNT(*) FROM orders WHERE tenant_id = $1"
        );
        assert_eq!(
            query.rows_query().sql(),
            format!(
                "SELECT {} FROM orders WHERE tenant_id = $1 ORDER BY created_utc DESC",
                ORDER_COLUMNS
            )
        );
    }

    #[test]
    fn test_orders_all_filters() {
        let query = ListQuery::orders(
            Uuid::new_v4(),
            params(10, "DO2024", "code", proto::SortDirection::Asc),
        )
        .filter("branch_id", Some(Uuid::new_v4()))
        .filter("customer_id", Some(Uuid::new_v4()))
        .filter("salesman_id", None);

        assert_eq!(
            query.count_query().sql(),
            "SELECT COUNT(*) FROM orders WHERE tenant_id = $1 AND branch_id = $2 AND customer_id = $3 AND (code ILIKE $4 OR remark ILIKE $5)"
        );
        assert!(query
            .rows_query()
            .sql()
            .ends_with("AND (code ILIKE $4 OR remark ILIKE $5) ORDER BY code ASC LIMIT $6 OFFSET $7"));
    }

    #[test]
    fn test_count_ignores_paging() {
        let query = ListQuery::returns(
            Uuid::new_v4(),
            params(5, "", "", proto::SortDirection::Unspecified),
        )
        .filter("order_id", Some(Uuid::new_v4()));

        let count = query.count_query().sql().to_string();
        assert!(!count.contains("LIMIT"));
        assert!(!count.contains("ORDER BY"));
        assert!(query.rows_query().sql().ends_with("ORDER BY created_utc DESC LIMIT $3 OFFSET $4"));
    }

    #[test]
    fn test_unknown_sort_column_is_not_injected() {
        let query = ListQuery::customers(
            Uuid::new_v4(),
            params(0, "", "name; DROP TABLE customers", proto::SortDirection::Asc),
        );
        let sql = query.rows_query().sql().to_string();
        assert!(sql.ends_with("ORDER BY created_utc ASC"));
        assert!(!sql.contains("DROP"));
    }

    #[test]
    fn test_salesmen_search_columns() {
        let query = ListQuery::salesmen(
            Uuid::new_v4(),
            params(0, "  jo ", "", proto::SortDirection::Desc),
        );
        assert_eq!(query.params().search.as_deref(), Some("jo"));
        assert_eq!(
            query.count_query().sql(),
            "SELECT COUNT(*) FROM salesmen WHERE tenant_id = $1 AND (code ILIKE $2 OR name ILIKE $3 OR email ILIKE $4 OR address ILIKE $5 OR phone ILIKE $6)"
        );
    }
}
