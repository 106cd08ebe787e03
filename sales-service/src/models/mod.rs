//! Domain models for sales-service.

use crate::grpc::proto;
use chrono::{DateTime, NaiveDate, Utc};
use prost_types::Timestamp;
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::grpc::CallerMetadata;
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

// ============================================================================
// Caller
// ============================================================================

/// Authenticated caller, resolved once per request and passed explicitly into
/// every orchestration entry point.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub tenant_id: Uuid,
    pub caller_id: String,
    /// Direct branch assignment from the caller's profile.
    pub branch_id: Option<String>,
    /// Region assignment, consulted only when no branch is assigned.
    pub region_id: Option<String>,
    /// Metadata forwarded on calls to identity, catalog and logistics.
    pub metadata: CallerMetadata,
}

impl CallerContext {
    /// Caller without any branch scope; used by the customer and salesman
    /// services which are tenant-wide.
    pub fn tenant_wide(tenant_id: Uuid, caller_id: impl Into<String>) -> Self {
        let caller_id = caller_id.into();
        Self {
            tenant_id,
            metadata: CallerMetadata::new(tenant_id.to_string(), caller_id.clone()),
            caller_id,
            branch_id: None,
            region_id: None,
        }
    }

    pub fn with_scope(mut self, branch_id: Option<String>, region_id: Option<String>) -> Self {
        self.branch_id = branch_id.filter(|b| !b.is_empty());
        self.region_id = region_id.filter(|r| !r.is_empty());
        self
    }
}

// ============================================================================
// Orders
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Order {
    pub order_id: Uuid,
    pub tenant_id: Uuid,
    pub branch_id: Uuid,
    pub branch_name: String,
    pub customer_id: Uuid,
    pub salesman_id: Uuid,
    pub code: String,
    pub order_date: NaiveDate,
    pub remark: String,
    pub price: Decimal,
    pub discount_amount: Decimal,
    pub discount_percentage: Decimal,
    pub total_price: Decimal,
    pub created_by: String,
    pub updated_by: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    #[sqlx(skip)]
    pub lines: Vec<OrderLine>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct OrderLine {
    pub line_id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub product_code: String,
    pub product_name: String,
    pub unit_price: Decimal,
    pub discount_amount: Decimal,
    pub discount_percentage: Decimal,
    pub quantity: i32,
    pub total_price: Decimal,
}

impl From<OrderLine> for proto::OrderLine {
    fn from(l: OrderLine) -> Self {
        Self {
            line_id: l.line_id.to_string(),
            order_id: l.order_id.to_string(),
            product_id: l.product_id.to_string(),
            product_code: l.product_code,
            product_name: l.product_name,
            unit_price: format_decimal(&l.unit_price),
            discount_amount: format_decimal(&l.discount_amount),
            discount_percentage: format_decimal(&l.discount_percentage),
            quantity: l.quantity,
            total_price: format_decimal(&l.total_price),
        }
    }
}

impl From<Order> for proto::Order {
    fn from(o: Order) -> Self {
        Self {
            order_id: o.order_id.to_string(),
            tenant_id: o.tenant_id.to_string(),
            branch_id: o.branch_id.to_string(),
            branch_name: o.branch_name,
            customer_id: o.customer_id.to_string(),
            salesman_id: o.salesman_id.to_string(),
            code: o.code,
            order_date: o.order_date.format("%Y-%m-%d").to_string(),
            remark: o.remark,
            price: format_decimal(&o.price),
            discount_amount: format_decimal(&o.discount_amount),
            discount_percentage: format_decimal(&o.discount_percentage),
            total_price: format_decimal(&o.total_price),
            lines: o.lines.into_iter().map(Into::into).collect(),
            created_by: o.created_by,
            updated_by: o.updated_by,
            created_utc: Some(datetime_to_timestamp(o.created_utc)),
            updated_utc: Some(datetime_to_timestamp(o.updated_utc)),
        }
    }
}

// ============================================================================
// Returns
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct SalesReturn {
    pub return_id: Uuid,
    pub tenant_id: Uuid,
    pub branch_id: Uuid,
    pub branch_name: String,
    pub order_id: Uuid,
    pub code: String,
    pub return_date: NaiveDate,
    pub remark: String,
    pub price: Decimal,
    pub discount_amount: Decimal,
    pub discount_percentage: Decimal,
    pub total_price: Decimal,
    pub created_by: String,
    pub updated_by: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    #[sqlx(skip)]
    pub lines: Vec<ReturnLine>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ReturnLine {
    pub line_id: Uuid,
    pub return_id: Uuid,
    pub product_id: Uuid,
    pub product_code: String,
    pub product_name: String,
    pub unit_price: Decimal,
    pub discount_amount: Decimal,
    pub discount_percentage: Decimal,
    pub quantity: i32,
    pub total_price: Decimal,
}

impl From<ReturnLine> for proto::ReturnLine {
    fn from(l: ReturnLine) -> Self {
        Self {
            line_id: l.line_id.to_string(),
            return_id: l.return_id.to_string(),
            product_id: l.product_id.to_string(),
            product_code: l.product_code,
            product_name: l.product_name,
            unit_price: format_decimal(&l.unit_price),
            discount_amount: format_decimal(&l.discount_amount),
            discount_percentage: format_decimal(&l.discount_percentage),
            quantity: l.quantity,
            total_price: format_decimal(&l.total_price),
        }
    }
}

impl From<SalesReturn> for proto::SalesReturn {
    fn from(r: SalesReturn) -> Self {
        Self {
            return_id: r.return_id.to_string(),
            tenant_id: r.tenant_id.to_string(),
            branch_id: r.branch_id.to_string(),
            branch_name: r.branch_name,
            order_id: r.order_id.to_string(),
            code: r.code,
            return_date: r.return_date.format("%Y-%m-%d").to_string(),
            remark: r.remark,
            price: format_decimal(&r.price),
            discount_amount: format_decimal(&r.discount_amount),
            discount_percentage: format_decimal(&r.discount_percentage),
            total_price: format_decimal(&r.total_price),
            lines: r.lines.into_iter().map(Into::into).collect(),
            created_by: r.created_by,
            updated_by: r.updated_by,
            created_utc: Some(datetime_to_timestamp(r.created_utc)),
            updated_utc: Some(datetime_to_timestamp(r.updated_utc)),
        }
    }
}

/// Line changes computed by a header update. Persisted lines neither updated
/// nor deleted are left as they are.
#[derive(Debug, Clone)]
pub struct LineDiff<L> {
    pub updated: Vec<L>,
    pub inserted: Vec<L>,
    pub deleted: Vec<Uuid>,
}

impl<L> Default for LineDiff<L> {
    fn default() -> Self {
        Self {
            updated: Vec::new(),
            inserted: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<L> LineDiff<L> {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.inserted.is_empty() && self.deleted.is_empty()
    }
}

/// Ordered and already returned quantity of one order line.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct LineBalance {
    pub product_id: Uuid,
    pub ordered: i64,
    pub returned: i64,
}

// ============================================================================
// Customers and salesmen
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Customer {
    pub customer_id: Uuid,
    pub tenant_id: Uuid,
    pub code: String,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub created_by: String,
    pub updated_by: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl From<Customer> for proto::Customer {
    fn from(c: Customer) -> Self {
        Self {
            customer_id: c.customer_id.to_string(),
            tenant_id: c.tenant_id.to_string(),
            code: c.code,
            name: c.name,
            address: c.address,
            phone: c.phone,
            created_by: c.created_by,
            updated_by: c.updated_by,
            created_utc: Some(datetime_to_timestamp(c.created_utc)),
            updated_utc: Some(datetime_to_timestamp(c.updated_utc)),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Salesman {
    pub salesman_id: Uuid,
    pub tenant_id: Uuid,
    pub code: String,
    pub name: String,
    pub email: String,
    pub address: String,
    pub phone: String,
    pub created_by: String,
    pub updated_by: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl From<Salesman> for proto::Salesman {
    fn from(s: Salesman) -> Self {
        Self {
            salesman_id: s.salesman_id.to_string(),
            tenant_id: s.tenant_id.to_string(),
            code: s.code,
            name: s.name,
            email: s.email,
            address: s.address,
            phone: s.phone,
            created_by: s.created_by,
            updated_by: s.updated_by,
            created_utc: Some(datetime_to_timestamp(s.created_utc)),
            updated_utc: Some(datetime_to_timestamp(s.updated_utc)),
        }
    }
}

/// A new customer or salesman. `email` is only stored for salesmen.
#[derive(Debug, Clone, Validate)]
pub struct NewParty {
    #[validate(length(min = 1, max = 50, message = "Please supply valid code"))]
    pub code: String,
    #[validate(length(min = 1, message = "Please supply valid name"))]
    pub name: String,
    pub email: String,
    pub address: String,
    pub phone: String,
}

/// Fields of a customer or salesman; `None` leaves the stored value unchanged
/// on update.
#[derive(Debug, Clone, Default)]
pub struct PartyPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
}

impl PartyPatch {
    /// A present name must not be blank.
    pub fn check(&self) -> Result<(), AppError> {
        match &self.name {
            Some(name) if name.trim().is_empty() => Err(AppError::bad_request("Please supply valid name")),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Parsing helpers
// ============================================================================

/// Format decimal for API output, trimming trailing zeros.
pub fn format_decimal(d: &Decimal) -> String {
    d.normalize().to_string()
}

/// Parse a required id, reporting `what` on failure ("Please supply valid branch").
pub fn parse_id(value: &str, what: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(value.trim()).map_err(|_| AppError::bad_request(format!("Please supply valid {}", what)))
}

/// Parse a decimal string; empty strings are treated as zero.
pub fn parse_decimal(value: &str, what: &str) -> Result<Decimal, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(value).map_err(|_| AppError::bad_request(format!("Invalid {} format", what)))
}

/// Parse a document date. Accepts a plain ISO date, the millisecond UTC form
/// sent by the frontend (`2024-05-31T00:00:00.000Z`) and any RFC 3339 timestamp.
pub fn parse_date(value: &str, what: &str) -> Result<NaiveDate, AppError> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.3fZ") {
        return Ok(dt.date());
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc).date_naive())
        .map_err(|_| AppError::bad_request(format!("Please supply valid {}", what)))
}

/// Run derive validation, surfacing the first rule message as a bad request so
/// callers see the same text as for hand-written checks.
pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input.validate().map_err(|errors| {
        let message = first_message(&errors).unwrap_or_else(|| errors.to_string());
        AppError::bad_request(message)
    })
}

/// Fields are visited in name order so the reported rule does not depend on
/// map iteration.
fn first_message(errors: &ValidationErrors) -> Option<String> {
    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by_key(|(field, _)| **field);
    fields.into_iter().find_map(|(_, kind)| match kind {
        ValidationErrorsKind::Field(field) => field
            .iter()
            .find_map(|e| e.message.as_ref().map(|m| m.to_string())),
        ValidationErrorsKind::Struct(inner) => first_message(inner),
        ValidationErrorsKind::List(items) => items.values().find_map(|inner| first_message(inner)),
    })
}

fn datetime_to_timestamp(dt: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde::Serialize;

    #[test]
    fn test_format_decimal_trims_trailing_zeros() {
        assert_eq!(format_decimal(&dec!(1000.0000)), "1000");
        assert_eq!(format_decimal(&dec!(12.5000)), "12.5");
        assert_eq!(format_decimal(&Decimal::ZERO), "0");
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 5, 31).unwrap();
        assert_eq!(parse_date("2024-05-31", "date").unwrap(), expected);
        assert_eq!(parse_date("2024-05-31T00:00:00.000Z", "date").unwrap(), expected);
        assert_eq!(parse_date("2024-05-31T10:15:00+00:00", "date").unwrap(), expected);
        assert!(matches!(
            parse_date("31/05/2024", "sales date"),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_parse_id_reports_field() {
        let err = parse_id("not-a-uuid", "branch").unwrap_err();
        assert_eq!(err.to_string(), "Bad request: Please supply valid branch");
    }

    #[test]
    fn test_parse_decimal_empty_is_zero() {
        assert_eq!(parse_decimal("", "discount").unwrap(), Decimal::ZERO);
        assert_eq!(parse_decimal(" 10.5 ", "discount").unwrap(), dec!(10.5));
        assert!(parse_decimal("ten", "discount").is_err());
    }

    #[derive(Serialize, Validate)]
    struct Line {
        #[validate(range(min = 1, message = "Please supply valid quantity"))]
        quantity: i32,
    }

    #[derive(Validate)]
    struct Doc {
        #[validate(length(min = 1, message = "Please supply valid product"), nested)]
        lines: Vec<Line>,
    }

    #[test]
    fn test_validate_input_surfaces_rule_message() {
        let err = validate_input(&Doc { lines: vec![] }).unwrap_err();
        assert_eq!(err.to_string(), "Bad request: Please supply valid product");

        let err = validate_input(&Doc {
            lines: vec![Line { quantity: 2 }, Line { quantity: 0 }],
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "Bad request: Please supply valid quantity");

        assert!(validate_input(&Doc { lines: vec![Line { quantity: 1 }] }).is_ok());
    }

    #[derive(Validate)]
    struct Header {
        #[validate(length(min = 1, message = "Please supply valid remark"))]
        remark: String,
        #[validate(range(min = 1, message = "Please supply valid branch"))]
        branch: i32,
        #[validate(range(min = 1, message = "Please supply valid customer"))]
        customer: i32,
    }

    #[test]
    fn test_validate_input_reports_fields_in_name_order() {
        for _ in 0..32 {
            let err = validate_input(&Header {
                remark: String::new(),
                branch: 0,
                customer: 0,
            })
            .unwrap_err();
            assert_eq!(err.to_string(), "Bad request: Please supply valid branch");
        }
    }

    #[test]
    fn test_tenant_wide_caller_has_no_scope() {
        let tenant = Uuid::new_v4();
        let caller = CallerContext::tenant_wide(tenant, "user-1")
            .with_scope(Some(String::new()), Some("region-1".to_string()));
        assert!(caller.branch_id.is_none());
        assert_eq!(caller.region_id.as_deref(), Some("region-1"));
        assert_eq!(caller.metadata.tenant_id, tenant.to_string());
    }
}
