//! ReturnService gRPC implementation.

use crate::grpc::capability_check::{capabilities, CapabilityChecker};
use crate::grpc::proto::{
    return_service_server::ReturnService, CreateReturnRequest, CreateReturnResponse,
    GetReturnRequest, GetReturnResponse, ListReturnsRequest, ListReturnsResponse, ReturnLineInput,
    UpdateReturnRequest, UpdateReturnResponse,
};
use crate::grpc::{finish, forward_rows, optional_id, pagination_response, tenant_caller, ListStream};
use crate::models::{parse_date, parse_id, SalesReturn};
use crate::services::metrics::GRPC_REQUEST_DURATION;
use crate::services::query::{ListParams, ListQuery};
use crate::services::returns::{CreateReturnInput, ReturnLineChange, UpdateReturnInput};
use crate::services::{AccessScopeResolver, Database, ReturnAllocationEngine};
use service_core::error::AppError;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{instrument, Span};

/// ReturnService implementation.
pub struct ReturnServiceImpl {
    db: Arc<Database>,
    returns: ReturnAllocationEngine,
    access: AccessScopeResolver,
    capability_checker: Arc<CapabilityChecker>,
}

impl ReturnServiceImpl {
    pub fn new(
        db: Arc<Database>,
        returns: ReturnAllocationEngine,
        access: AccessScopeResolver,
        capability_checker: Arc<CapabilityChecker>,
    ) -> Self {
        Self {
            db,
            returns,
            access,
            capability_checker,
        }
    }
}

#[tonic::async_trait]
impl ReturnService for ReturnServiceImpl {
    type ListReturnsStream = ListStream<ListReturnsResponse>;

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "CreateReturn", tenant_id, return_id)
    )]
    async fn create_return(
        &self,
        request: Request<CreateReturnRequest>,
    ) -> Result<Response<CreateReturnResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["CreateReturn"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_RETURN_CREATE)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();

        let result = async {
            let input = create_input(req)?;
            let caller = self.access.caller_context(&auth).await?;
            self.returns.create(&caller, input).await
        }
        .await;
        let sales_return = finish("CreateReturn", result)?;

        Span::current().record("return_id", sales_return.return_id.to_string());
        timer.observe_duration();

        Ok(Response::new(CreateReturnResponse {
            sales_return: Some(sales_return.into()),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "UpdateReturn", tenant_id, return_id)
    )]
    async fn update_return(
        &self,
        request: Request<UpdateReturnRequest>,
    ) -> Result<Response<UpdateReturnResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["UpdateReturn"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_RETURN_UPDATE)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();
        Span::current().record("return_id", req.return_id.as_str());

        let result = async {
            let input = update_input(req)?;
            let caller = self.access.caller_context(&auth).await?;
            self.returns.update(&caller, input).await
        }
        .await;
        let sales_return = finish("UpdateReturn", result)?;
        timer.observe_duration();

        Ok(Response::new(UpdateReturnResponse {
            sales_return: Some(sales_return.into()),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "GetReturn", tenant_id)
    )]
    async fn get_return(
        &self,
        request: Request<GetReturnRequest>,
    ) -> Result<Response<GetReturnResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["GetReturn"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_RETURN_READ)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();

        let result = async {
            let caller = tenant_caller(&auth)?;
            let return_id = parse_id(&req.return_id, "sales return")?;
            self.returns.get(&caller, return_id).await
        }
        .await;
        let sales_return = finish("GetReturn", result)?;
        timer.observe_duration();

        Ok(Response::new(GetReturnResponse {
            sales_return: Some(sales_return.into()),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "ListReturns", tenant_id)
    )]
    async fn list_returns(
        &self,
        request: Request<ListReturnsRequest>,
    ) -> Result<Response<Self::ListReturnsStream>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["ListReturns"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_RETURN_READ)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();

        let result = async {
            let caller = tenant_caller(&auth)?;
            let query = ListQuery::returns(caller.tenant_id, ListParams::from_proto(req.pagination.as_ref()))
                .filter("branch_id", optional_id(&req.branch_id, "branch")?)
                .filter("order_id", optional_id(&req.order_id, "sales")?);
            self.db.list::<SalesReturn>(query, "list_returns").await
        }
        .await;
        let (count, rows) = finish("ListReturns", result)?;
        let pagination = pagination_response(req.pagination, count);
        timer.observe_duration();

        Ok(Response::new(forward_rows(
            "ListReturns",
            rows,
            move |sales_return: SalesReturn| ListReturnsResponse {
                sales_return: Some(sales_return.into()),
                pagination: Some(pagination.clone()),
            },
        )))
    }
}

fn line_change(line: &ReturnLineInput) -> Result<ReturnLineChange, AppError> {
    Ok(ReturnLineChange {
        line_id: line
            .line_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(|id| parse_id(id, "sales return line"))
            .transpose()?,
        product_id: parse_id(&line.product_id, "product")?,
        quantity: line.quantity,
    })
}

fn create_input(req: CreateReturnRequest) -> Result<CreateReturnInput, AppError> {
    Ok(CreateReturnInput {
        branch_id: parse_id(&req.branch_id, "branch")?,
        order_id: parse_id(&req.order_id, "sales")?,
        return_date: parse_date(&req.return_date, "sales return date")?,
        remark: req.remark,
        lines: req.lines.iter().map(line_change).collect::<Result<_, _>>()?,
    })
}

fn update_input(req: UpdateReturnRequest) -> Result<UpdateReturnInput, AppError> {
    Ok(UpdateReturnInput {
        return_id: parse_id(&req.return_id, "sales return")?,
        return_date: req
            .return_date
            .as_deref()
            .map(|d| parse_date(d, "sales return date"))
            .transpose()?,
        remark: req.remark,
        lines: req.lines.iter().map(line_change).collect::<Result<_, _>>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_create_input_requires_order() {
        let req = CreateReturnRequest {
            branch_id: Uuid::new_v4().to_string(),
            order_id: "DO2024051".to_string(),
            return_date: "2024-06-03".to_string(),
            remark: String::new(),
            lines: vec![],
        };
        assert_eq!(
            create_input(req).unwrap_err().to_string(),
            "Bad request: Please supply valid sales"
        );
    }

    #[test]
    fn test_line_id_empty_string_means_new_line() {
        let change = line_change(&ReturnLineInput {
            line_id: Some(String::new()),
            product_id: Uuid::new_v4().to_string(),
            quantity: 3,
        })
        .unwrap();
        assert!(change.line_id.is_none());
        assert_eq!(change.quantity, 3);
    }
}
