//! CustomerService gRPC implementation.

use crate::grpc::capability_check::{capabilities, CapabilityChecker};
use crate::grpc::proto::{
    customer_service_server::CustomerService, CreateCustomerRequest, CustomerResponse,
    DeleteCustomerRequest, DeleteCustomerResponse, GetCustomerRequest, ListCustomersRequest,
    ListCustomersResponse, UpdateCustomerRequest,
};
use crate::grpc::{finish, forward_rows, pagination_response, tenant_caller, ListStream};
use crate::models::{parse_id, validate_input, Customer, NewParty, PartyPatch};
use crate::services::metrics::{record_document, GRPC_REQUEST_DURATION};
use crate::services::query::{ListParams, ListQuery};
use crate::services::Database;
use service_core::error::AppError;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{instrument, Span};

/// CustomerService implementation.
pub struct CustomerServiceImpl {
    db: Arc<Database>,
    capability_checker: Arc<CapabilityChecker>,
}

impl CustomerServiceImpl {
    pub fn new(db: Arc<Database>, capability_checker: Arc<CapabilityChecker>) -> Self {
        Self {
            db,
            capability_checker,
        }
    }
}

#[tonic::async_trait]
impl CustomerService for CustomerServiceImpl {
    type ListCustomersStream = ListStream<ListCustomersResponse>;

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "CreateCustomer", tenant_id, customer_id)
    )]
    async fn create_customer(
        &self,
        request: Request<CreateCustomerRequest>,
    ) -> Result<Response<CustomerResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["CreateCustomer"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_CUSTOMER_CREATE)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();

        let result = async {
            let caller = tenant_caller(&auth)?;
            let party = new_customer(req);
            validate_input(&party)?;
            let customer = self
                .db
                .create_customer(caller.tenant_id, &party, &caller.caller_id)
                .await?;
            record_document("customer", "create");
            Ok::<_, AppError>(customer)
        }
        .await;
        let customer = finish("CreateCustomer", result)?;

        Span::current().record("customer_id", customer.customer_id.to_string());
        timer.observe_duration();

        Ok(Response::new(CustomerResponse {
            customer: Some(customer.into()),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "UpdateCustomer", tenant_id, customer_id)
    )]
    async fn update_customer(
        &self,
        request: Request<UpdateCustomerRequest>,
    ) -> Result<Response<CustomerResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["UpdateCustomer"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_CUSTOMER_UPDATE)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();
        Span::current().record("customer_id", req.customer_id.as_str());

        let result = async {
            let caller = tenant_caller(&auth)?;
            let customer_id = parse_id(&req.customer_id, "customer")?;
            let patch = PartyPatch {
                name: req.name,
                email: None,
                address: req.address,
                phone: req.phone,
            };
            patch.check()?;

            let customer = self
                .db
                .update_customer(caller.tenant_id, customer_id, &patch, &caller.caller_id)
                .await?
                .ok_or_else(|| AppError::not_found("Customer not found"))?;
            record_document("customer", "update");
            Ok::<_, AppError>(customer)
        }
        .await;
        let customer = finish("UpdateCustomer", result)?;
        timer.observe_duration();

        Ok(Response::new(CustomerResponse {
            customer: Some(customer.into()),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "GetCustomer", tenant_id)
    )]
    async fn get_customer(
        &self,
        request: Request<GetCustomerRequest>,
    ) -> Result<Response<CustomerResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["GetCustomer"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_CUSTOMER_READ)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();

        let result = async {
            let caller = tenant_caller(&auth)?;
            let customer_id = parse_id(&req.customer_id, "customer")?;
            self.db
                .get_customer(caller.tenant_id, customer_id)
                .await?
                .ok_or_else(|| AppError::not_found("Customer not found"))
        }
        .await;
        let customer = finish("GetCustomer", result)?;
        timer.observe_duration();

        Ok(Response::new(CustomerResponse {
            customer: Some(customer.into()),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "DeleteCustomer", tenant_id, customer_id)
    )]
    async fn delete_customer(
        &self,
        request: Request<DeleteCustomerRequest>,
    ) -> Result<Response<DeleteCustomerResponse>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["DeleteCustomer"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_CUSTOMER_DELETE)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();
        Span::current().record("customer_id", req.customer_id.as_str());

        let result = async {
            let caller = tenant_caller(&auth)?;
            let customer_id = parse_id(&req.customer_id, "customer")?;
            let deleted = self.db.delete_customer(caller.tenant_id, customer_id).await?;
            if deleted {
                record_document("customer", "delete");
            }
            Ok::<_, AppError>(deleted)
        }
        .await;
        let deleted = finish("DeleteCustomer", result)?;
        timer.observe_duration();

        Ok(Response::new(DeleteCustomerResponse { deleted }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "sales-service", method = "ListCustomers", tenant_id)
    )]
    async fn list_customers(
        &self,
        request: Request<ListCustomersRequest>,
    ) -> Result<Response<Self::ListCustomersStream>, Status> {
        let timer = GRPC_REQUEST_DURATION
            .with_label_values(&["ListCustomers"])
            .start_timer();
        let auth = self
            .capability_checker
            .require_capability(&request, capabilities::SALES_CUSTOMER_READ)
            .await?;
        Span::current().record("tenant_id", auth.tenant_id.as_str());
        let req = request.into_inner();

        let result = async {
            let caller = tenant_caller(&auth)?;
            let query = ListQuery::customers(caller.tenant_id, ListParams::from_proto(req.pagination.as_ref()));
            self.db.list::<Customer>(query, "list_customers").await
        }
        .await;
        let (count, rows) = finish("ListCustomers", result)?;
        let pagination = pagination_response(req.pagination, count);
        timer.observe_duration();

        Ok(Response::new(forward_rows(
            "ListCustomers",
            rows,
            move |customer: Customer| ListCustomersResponse {
                customer: Some(customer.into()),
                pagination: Some(pagination.clone()),
            },
        )))
    }
}

fn new_customer(req: CreateCustomerRequest) -> NewParty {
    NewParty {
        code: req.code.trim().to_string(),
        name: req.name.trim().to_string(),
        email: String::new(),
        address: req.address,
        phone: req.phone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_customer_trims_identity_fields() {
        let party = new_customer(CreateCustomerRequest {
            code: " C-001 ".to_string(),
            name: " Toko Maju ".to_string(),
            address: "Jl. Merdeka 1".to_string(),
            phone: "021-555".to_string(),
        });
        assert_eq!(party.code, "C-001");
        assert_eq!(party.name, "Toko Maju");
        assert!(party.email.is_empty());
        assert!(validate_input(&party).is_ok());
    }

    #[test]
    fn test_blank_customer_name_rejected() {
        let party = new_customer(CreateCustomerRequest {
            code: "C-002".to_string(),
            name: "   ".to_string(),
            address: String::new(),
            phone: String::new(),
        });
        assert_eq!(
            validate_input(&party).unwrap_err().to_string(),
            "Bad request: Please supply valid name"
        );
    }
}
