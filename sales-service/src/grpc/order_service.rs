//! OrderService gRPC implementation.

use crate::grpc::capability_check::{capabilities, CapabilityChecker};
use crate::grpc::proto::{
    order_service_server::OrderService, CreateOrderRequest, CreateOrderResponse, GetOrderRequest,
    GetOrderResponse, ListOrdersRequest, ListOrdersResponse, OrderLineInput, UpdateOrderRequest,
    UpdateOrderResponse,
};
use crate::grpc::{finish, forward_rows, optional_id, pagination_response, tenant_caller, ListStream};
use crate::models::{parse_date, parse_decimal, parse_id, Order};
use crate::services::metrics::GRPC_REQUEST_DURATION;
use crate::services::orders::{CreateOrderInput, NewOrderLine, OrderLineChange, UpdateOrderInput};
use crate::services::query::{ListParams, ListQuery};
use crate::services::{AccessScopeResolver, Database, OrderTransactionCoordinator};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{instrument, Span};

/// OrderService implementation.
pub struct OrderServiceImpl {
    db: Arc<Database>,
    orders: OrderTransactionCoordinator,
    access: AccessScopeResolver,
    capability_checker: Arc<CapabilityChecker>,
}

impl OrderServiceImpl {
    pub fn new(
        db: Arc<Database>,
        orders: OrderTransactionCoordinator,
        access: AccessScopeResolver,
        capability_checker: Arc<CapabilityChecker>,
    ) -> Self {
        Self {
            db,
            orders,
            access,
            capability_checker,
        }
    }
}

#[tonic::async_trait]
impl OrderService for OrderServiceImpl {
    type ListOrdersStream = ListStream<ListOrdersResponse>;

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "CreateOrder", tenant_id, order_id)
    )]
    async fn create_order(
        &self,
        request: Request<CreateOrderRequest>,
    ) -> Result<Response<CreateOrderResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["CreateOrder"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_ORDER_CREATE)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();

        let result = async {
            let input = create_input(req)?;
            let caller = self.access.caller_context(&auth).await?;
            self.orders.create(&caller, input).await
        }
        .await;
        let order = finish("CreateOrder", result)?;

        Span::current().record("order_id", order.order_id.to_string());
        timer.observe_duration();

        Ok(Response::new(CreateOrderResponse {
            order: Some(order.into()),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "UpdateOrder", tenant_id, order_id)
    )]
    async fn update_order(
        &self,
        request: Request<UpdateOrderRequest>,
    ) -> Result<Response<UpdateOrderResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["UpdateOrder"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_ORDER_UPDATE)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();
        Span::current().record("order_id", req.order_id.as_str());

        let result = async {
            let input = update_input(req)?;
            let caller = self.access.caller_context(&auth).await?;
            self.orders.update(&caller, input).await
        }
        .await;
        let order = finish("UpdateOrder", result)?;
        timer.observe_duration();

        Ok(Response::new(UpdateOrderResponse {
            order: Some(order.into()),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "GetOrder", tenant_id)
    )]
    async fn get_order(
        &self,
        request: Request<GetOrderRequest>,
    ) -> Result<Response<GetOrderResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["GetOrder"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_ORDER_READ)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();

        let result = async {
            let caller = tenant_caller(&auth)?;
            let order_id = parse_id(&req.order_id, "sales")?;
            self.orders.get(&caller, order_id).await
        }
        .await;
        let order = finish("GetOrder", result)?;
        timer.observe_duration();

        Ok(Response::new(GetOrderResponse {
            order: Some(order.into()),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "ListOrders", tenant_id)
    )]
    async fn list_orders(
        &self,
        request: Request<ListOrdersRequest>,
    ) -> Result<Response<Self::ListOrdersStream>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["ListOrders"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_ORDER_READ)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();

        let result = async {
            let caller = tenant_caller(&auth)?;
            let query = ListQuery::orders(caller.tenant_id, ListParams::from_proto(req.pagination.as_ref()))
                .filter("branch_id", optional_id(&req.branch_id, "branch")?)
                .filter("customer_id", optional_id(&req.customer_id, "customer")?)
                .filter("salesman_id", optional_id(&req.salesman_id, "salesman")?);
            self.db.list::<Order>(query, "list_orders").await
        }
        .await;
        let (count, rows) = finish("ListOrders", result)?;
        let pagination = pagination_response(req.pagination, count);
        timer.observe_duration();

        Ok(Response::new(forward_rows("ListOrders", rows, move |order: Order| {
            ListOrdersResponse {
                order: Some(order.into()),
                pagination: Some(pagination.clone()),
            }
        })))
    }
}

fn optional_decimal(value: Option<&str>, what: &str) -> Result<Option<Decimal>, AppError> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| parse_decimal(v, what))
        .transpose()
}

fn create_input(req: CreateOrderRequest) -> Result<CreateOrderInput, AppError> {
    let lines = req
        .lines
        .iter()
        .map(|line| {
            Ok(NewOrderLine {
                product_id: parse_id(&line.product_id, "product")?,
                quantity: line.quantity.unwrap_or_default(),
                unit_price: optional_decimal(line.unit_price.as_deref(), "unit price")?,
                discount_amount: optional_decimal(line.discount_amount.as_deref(), "discount")?
                    .unwrap_or_default(),
                discount_percentage: optional_decimal(line.discount_percentage.as_deref(), "discount percentage")?
                    .unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>, AppError>>()?;

    Ok(CreateOrderInput {
        branch_id: parse_id(&req.branch_id, "branch")?,
        customer_id: parse_id(&req.customer_id, "customer")?,
        salesman_id: parse_id(&req.salesman_id, "salesman")?,
        order_date: parse_date(&req.order_date, "sales date")?,
        remark: req.remark,
        discount_amount: optional_decimal(req.discount_amount.as_deref(), "discount")?.unwrap_or_default(),
        discount_percentage: optional_decimal(req.discount_percentage.as_deref(), "discount percentage")?
            .unwrap_or_default(),
        lines,
    })
}

fn line_change(line: &OrderLineInput) -> Result<OrderLineChange, AppError> {
    Ok(OrderLineChange {
        line_id: line
            .line_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(|id| parse_id(id, "sales line"))
            .transpose()?,
        product_id: parse_id(&line.product_id, "product")?,
        quantity: line.quantity,
        unit_price: optional_decimal(line.unit_price.as_deref(), "unit price")?,
        discount_amount: optional_decimal(line.discount_amount.as_deref(), "discount")?,
        discount_percentage: optional_decimal(line.discount_percentage.as_deref(), "discount percentage")?,
    })
}

fn update_input(req: UpdateOrderRequest) -> Result<UpdateOrderInput, AppError> {
    Ok(UpdateOrderInput {
        order_id: parse_id(&req.order_id, "sales")?,
        customer_id: req
            .customer_id
            .as_deref()
            .map(|id| parse_id(id, "customer"))
            .transpose()?,
        salesman_id: req
            .salesman_id
            .as_deref()
            .map(|id| parse_id(id, "salesman"))
            .transpose()?,
        order_date: req
            .order_date
            .as_deref()
            .map(|d| parse_date(d, "sales date"))
            .transpose()?,
        remark: req.remark,
        discount_amount: optional_decimal(req.discount_amount.as_deref(), "discount")?,
        discount_percentage: optional_decimal(req.discount_percentage.as_deref(), "discount percentage")?,
        lines: req.lines.iter().map(line_change).collect::<Result<_, _>>()?,
    })
}
