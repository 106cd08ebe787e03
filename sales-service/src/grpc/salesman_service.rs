//! SalesmanService gRPC implementation.

use crate::grpc::capability_check::{capabilities, CapabilityChecker};
use crate::grpc::proto::{
    salesman_service_server::SalesmanService, CreateSalesmanRequest, DeleteSalesmanRequest,
    DeleteSalesmanResponse, GetSalesmanRequest, ListSalesmenRequest, ListSalesmenResponse,
    SalesmanResponse, UpdateSalesmanRequest,
};
use crate::grpc::{finish, forward_rows, pagination_response, tenant_caller, ListStream};
use crate::models::{parse_id, validate_input, NewParty, PartyPatch, Salesman};
use crate::services::metrics::{record_document, GRPC_REQUEST_DURATION};
use crate::services::query::{ListParams, ListQuery};
use crate::services::Database;
use service_core::error::AppError;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{instrument, Span};

/// SalesmanService implementation.
pub struct SalesmanServiceImpl {
    db: Arc<Database>,
    capability_checker: Arc<CapabilityChecker>,
}

impl SalesmanServiceImpl {
    pub fn new(db: Arc<Database>, capability_checker: Arc<CapabilityChecker>) -> Self {
        Self {
            db,
            capability_checker,
        }
    }
}

#[tonic::async_trait]
impl SalesmanService for SalesmanServiceImpl {
    type ListSalesmenStream = ListStream<ListSalesmenResponse>;

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "CreateSalesman", tenant_id, salesman_id)
    )]
    async fn create_salesman(
        &self,
        request: Request<CreateSalesmanRequest>,
    ) -> Result<Response<SalesmanResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["CreateSalesman"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_SALESMAN_CREATE)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();

        let result = async {
            let caller = tenant_caller(&auth)?;
            let party = NewParty {
                code: req.code.trim().to_string(),
                name: req.name.trim().to_string(),
                email: req.email.trim().to_string(),
                address: req.address,
                phone: req.phone,
            };
            validate_input(&party)?;
            let salesman = self
                .db
                .create_salesman(caller.tenant_id, &party, &caller.caller_id)
                .await?;
            record_document("salesman", "create");
            Ok::<_, AppError>(salesman)
        }
        .await;
        let salesman = finish("CreateSalesman", result)?;

        Span::current().record("salesman_id", salesman.salesman_id.to_string());
        timer.observe_duration();

        Ok(Response::new(SalesmanResponse {
            salesman: Some(salesman.into()),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "UpdateSalesman", tenant_id, salesman_id)
    )]
    async fn update_salesman(
        &self,
        request: Request<UpdateSalesmanRequest>,
    ) -> Result<Response<SalesmanResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["UpdateSalesman"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_SALESMAN_UPDATE)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();
        Span::current().record("salesman_id", req.salesman_id.as_str());

        let result = async {
            let caller = tenant_caller(&auth)?;
            let salesman_id = parse_id(&req.salesman_id, "salesman")?;
            let patch = PartyPatch {
                name: req.name,
                email: req.email,
                address: req.address,
                phone: req.phone,
            };
            patch.check()?;

            let salesman = self
                .db
                .update_salesman(caller.tenant_id, salesman_id, &patch, &caller.caller_id)
                .await?
                .ok_or_else(|| AppError::not_found("Salesman not found"))?;
            record_document("salesman", "update");
            Ok::<_, AppError>(salesman)
        }
        .await;
        let salesman = finish("UpdateSalesman", result)?;
        timer.observe_duration();

        Ok(Response::new(SalesmanResponse {
            salesman: Some(salesman.into()),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "GetSalesman", tenant_id)
    )]
    async fn get_salesman(
        &self,
        request: Request<GetSalesmanRequest>,
    ) -> Result<Response<SalesmanResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["GetSalesman"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_SALESMAN_READ)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();

        let result = async {
            let caller = tenant_caller(&auth)?;
            let salesman_id = parse_id(&req.salesman_id, "salesman")?;
            self.db
                .get_salesman(caller.tenant_id, salesman_id)
                .await?
                .ok_or_else(|| AppError::not_found("Salesman not found"))
        }
        .await;
        let salesman = finish("GetSalesman", result)?;
        timer.observe_duration();

        Ok(Response::new(SalesmanResponse {
            salesman: Some(salesman.into()),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "DeleteSalesman", tenant_id, salesman_id)
    )]
    async fn delete_salesman(
        &self,
        request: Request<DeleteSalesmanRequest>,
    ) -> Result<Response<DeleteSalesmanResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["DeleteSalesman"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_SALESMAN_DELETE)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();
        Span::current().record("salesman_id", req.salesman_id.as_str());

        let result = async {
            let caller = tenant_caller(&auth)?;
            let salesman_id = parse_id(&req.salesman_id, "salesman")?;
            let deleted = self.db.delete_salesman(caller.tenant_id, salesman_id).await?;
            if deleted {
                record_document("salesman", "delete");
            }
            Ok::<_, AppError>(deleted)
        }
        .await;
        let deleted = finish("DeleteSalesman", result)?;
        timer.observe_duration();

        Ok(Response::new(DeleteSalesmanResponse { deleted }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "ListSalesmen", tenant_id)
    )]
    async fn list_salesmen(
        &self,
        request: Request<ListSalesmenRequest>,
    ) -> Result<Response<Self::ListSalesmenStream>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["ListSalesmen"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_SALESMAN_READ)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();

        let result = async {
            let caller = tenant_caller(&auth)?;
            let query = ListQuery::salesmen(caller.tenant_id, ListParams::from_proto(req.pagination.as_ref()));
            self.db.list::<Salesman>(query, "list_salesmen").await
        }
        .await;
        let (count, rows) = finish("ListSalesmen", result)?;
        let pagination = pagination_response(req.pagination, count);
        timer.observe_duration();

        Ok(Response::new(forward_rows(
            "ListSalesmen",
            rows,
            move |salesman: Salesman| ListSalesmenResponse {
                salesman: Some(salesman.into()),
                pagination: Some(pagination.clone()),
            },
        )))
    }
}
