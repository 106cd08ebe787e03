//! Integration tests for sales return allocation.

mod common;

use common::{spawn_app, with_tenant, TestApp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sales_service::grpc::proto::*;
use std::str::FromStr;
use tokio_stream::StreamExt;
use uuid::Uuid;

fn money(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

fn return_line(product_id: &Uuid, quantity: i32) -> ReturnLineInput {
    ReturnLineInput {
        line_id: None,
        product_id: product_id.to_string(),
        quantity,
    }
}

fn return_request(app: &TestApp, order: &Order, lines: Vec<ReturnLineInput>) -> CreateReturnRequest {
    CreateReturnRequest {
        branch_id: app.branch_id.to_string(),
        order_id: order.order_id.clone(),
        return_date: "2024-06-03".to_string(),
        remark: "damaged".to_string(),
        lines,
    }
}

async fn create_return(
    app: &TestApp,
    order: &Order,
    lines: Vec<ReturnLineInput>,
) -> Result<SalesReturn, tonic::Status> {
    app.returns
        .clone()
        .create_return(with_tenant(return_request(app, order, lines), &app.tenant_id))
        .await
        .map(|r| r.into_inner().sales_return.unwrap())
}

async fn flat_discount_order(app: &TestApp, product: &Uuid) -> Order {
    let mut request = app.order_request(&[(*product, 10)]).await;
    request.discount_amount = Some("100".to_string());
    app.orders
        .clone()
        .create_order(with_tenant(request, &app.tenant_id))
        .await
        .unwrap()
        .into_inner()
        .order
        .unwrap()
}

#[tokio::test]
async fn create_return_prices_from_order_line() {
    let app = spawn_app().await;
    let product = app.catalog.add_product("A", "100");
    let order = app.create_order(&[(product, 4)]).await;

    // Catalog price moves after the sale; the return keeps the sold price.
    app.catalog
        .products
        .lock()
        .unwrap()
        .get_mut(&product.to_string())
        .unwrap()
        .unit_price = "999".to_string();

    let sales_return = create_return(&app, &order, vec![return_line(&product, 2)])
        .await
        .unwrap();

    assert!(sales_return.code.starts_with("DR"));
    assert_eq!(sales_return.order_id, order.order_id);
    assert_eq!(sales_return.branch_name, "Jakarta Pusat");
    assert_eq!(sales_return.lines.len(), 1);
    assert_eq!(money(&sales_return.lines[0].unit_price), dec!(100));
    assert_eq!(money(&sales_return.price), dec!(200));
    assert_eq!(money(&sales_return.total_price), dec!(200));
}

#[tokio::test]
async fn flat_order_discount_is_shared_across_returns() {
    let app = spawn_app().await;
    let product = app.catalog.add_product("A", "100");
    let order = flat_discount_order(&app, &product).await;
    assert_eq!(money(&order.total_price), dec!(900));

    let first = create_return(&app, &order, vec![return_line(&product, 3)])
        .await
        .unwrap();
    assert_eq!(money(&first.price), dec!(300));
    assert_eq!(money(&first.discount_amount), dec!(30));
    assert_eq!(money(&first.total_price), dec!(270));

    let second = create_return(&app, &order, vec![return_line(&product, 7)])
        .await
        .unwrap();
    assert_eq!(money(&second.discount_amount), dec!(70));
    assert_eq!(money(&second.total_price), dec!(630));

    let status = create_return(&app, &order, vec![return_line(&product, 1)])
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    assert_eq!(status.message(), "Sales has been returned");
}

#[tokio::test]
async fn return_beyond_outstanding_is_rejected() {
    let app = spawn_app().await;
    let product_a = app.catalog.add_product("A", "10");
    let product_b = app.catalog.add_product("B", "10");
    let order = app.create_order(&[(product_a, 5)]).await;

    create_return(&app, &order, vec![return_line(&product_a, 3)])
        .await
        .unwrap();

    let status = create_return(&app, &order, vec![return_line(&product_a, 3)])
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert_eq!(status.message(), "Please supply valid outstanding product");

    let status = create_return(&app, &order, vec![return_line(&product_b, 1)])
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert_eq!(status.message(), "Please supply valid outstanding product");
}

#[tokio::test]
async fn return_blocked_by_fulfillment() {
    let app = spawn_app().await;
    let product = app.catalog.add_product("A", "10");
    let order = app.create_order(&[(product, 5)]).await;
    app.logistics.fulfil(&order.order_id);

    let status = create_return(&app, &order, vec![return_line(&product, 1)])
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    assert_eq!(status.message(), "Sales has delivery transaction");
}

#[tokio::test]
async fn update_return_excludes_its_own_quantity() {
    let app = spawn_app().await;
    let product = app.catalog.add_product("A", "10");
    let order = app.create_order(&[(product, 5)]).await;
    let sales_return = create_return(&app, &order, vec![return_line(&product, 4)])
        .await
        .unwrap();

    // 4 -> 5 fits once the return's own 4 units are excluded.
    let request = UpdateReturnRequest {
        return_id: sales_return.return_id.clone(),
        return_date: None,
        remark: Some("all of it".to_string()),
        lines: vec![ReturnLineInput {
            line_id: Some(sales_return.lines[0].line_id.clone()),
            product_id: product.to_string(),
            quantity: 5,
        }],
    };
    let updated = app
        .returns
        .clone()
        .update_return(with_tenant(request, &app.tenant_id))
        .await
        .unwrap()
        .into_inner()
        .sales_return
        .unwrap();
    assert_eq!(updated.code, sales_return.code);
    assert_eq!(updated.lines[0].line_id, sales_return.lines[0].line_id);
    assert_eq!(updated.lines[0].quantity, 5);
    assert_eq!(money(&updated.total_price), dec!(50));
    assert_eq!(updated.remark, "all of it");

    let request = UpdateReturnRequest {
        return_id: sales_return.return_id.clone(),
        return_date: None,
        remark: None,
        lines: vec![ReturnLineInput {
            line_id: Some(sales_return.lines[0].line_id.clone()),
            product_id: product.to_string(),
            quantity: 6,
        }],
    };
    let status = app
        .returns
        .clone()
        .update_return(with_tenant(request, &app.tenant_id))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn concurrent_returns_never_exceed_ordered_quantity() {
    let app = spawn_app().await;
    let product = app.catalog.add_product("A", "10");
    let order = app.create_order(&[(product, 5)]).await;

    let attempts = (0..4).map(|_| create_return(&app, &order, vec![return_line(&product, 2)]));
    let results = futures::future::join_all(attempts).await;

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 2, "only two returns of 2 fit into 5 units");

    let mut stream = app
        .returns
        .clone()
        .list_returns(with_tenant(
            ListReturnsRequest {
                pagination: None,
                branch_id: String::new(),
                order_id: order.order_id.clone(),
            },
            &app.tenant_id,
        ))
        .await
        .unwrap()
        .into_inner();

    let mut listed = 0;
    while let Some(item) = stream.next().await {
        let item = item.unwrap();
        assert_eq!(item.pagination.unwrap().count, 2);
        assert_eq!(item.sales_return.unwrap().order_id, order.order_id);
        listed += 1;
    }
    assert_eq!(listed, 2);
}

#[tokio::test]
async fn get_return_of_other_tenant_is_rejected() {
    let app = spawn_app().await;
    let product = app.catalog.add_product("A", "10");
    let order = app.create_order(&[(product, 5)]).await;
    let sales_return = create_return(&app, &order, vec![return_line(&product, 1)])
        .await
        .unwrap();

    let status = app
        .returns
        .clone()
        .get_return(with_tenant(
            GetReturnRequest {
                return_id: sales_return.return_id.clone(),
            },
            &Uuid::new_v4(),
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);
    assert_eq!(status.message(), "its not your company");
}
